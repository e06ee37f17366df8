// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use psp_proxy_rs::{
    error::ProtocolError,
    pdu::{
        framer::{FrameDecoder, encode_to_vec},
        header::{Direction, FOOTER_LEN, FRAME_OVERHEAD, HEADER_LEN, pad_len},
        rrn::RrnId,
    },
};
use rand::RngExt;

fn stub_frame(counter: u32, rrn: RrnId, ccd: u32, payload: &[u8]) -> Vec<u8> {
    encode_to_vec(Direction::StubToHost, counter, rrn, ccd, 0, 0, &[payload])
}

/// Drives the decoder over `wire` in chunks, collecting outcomes.
fn decode_all(dec: &mut FrameDecoder, wire: &[u8], chunk: usize) -> Vec<Result<Vec<u8>, ProtocolError>> {
    let mut out = Vec::new();
    for piece in wire.chunks(chunk.max(1)) {
        dec.extend(piece);
        loop {
            match dec.next_frame() {
                Ok(Some(frame)) => out.push(Ok(frame.payload.to_vec())),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
    }
    out
}

#[test]
fn golden_beacon_frame_is_bit_exact() {
    // Beacon #1, counter 1, CCD 0: header, payload + pad-to-8, footer with
    // the two's-complement byte-sum checksum, all little-endian.
    let expected = hex_literal::hex!(
        "20BADEC0" // stub→host start magic
        "04000000" // payload length
        "01000000" // PDU counter
        "81000000" // RRN id (Beacon)
        "00000000" // target CCD
        "00000000" // timestamp
        "00000000" // request rc
        "00000000" // reserved
        "01000000" // cBeaconsSent = 1
        "00000000" // pad to 8
        "01FDFFFF" // checksum
        "2FBADEC0" // stub→host end magic
    );

    let wire = stub_frame(1, RrnId::Beacon, 0, &1u32.to_le_bytes());
    assert_eq!(hex::encode(&wire), hex::encode(expected));

    let mut dec = FrameDecoder::new();
    dec.extend(&wire);
    let frame = dec.next_frame().expect("valid frame").expect("complete");
    assert_eq!(frame.payload.as_ref(), &1u32.to_le_bytes());
}

#[test]
fn roundtrip_random_payloads_any_chunking() {
    let mut rng = rand::rng();
    for _ in 0..50 {
        let len = rng.random_range(0..1500);
        let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let wire = stub_frame(1, RrnId::LogMsg, 0, &payload);

        // The pad region between payload and footer must be zero-filled.
        let padded_end = HEADER_LEN + len + pad_len(len);
        assert!(
            wire[HEADER_LEN + len..padded_end].iter().all(|b| *b == 0),
            "pad bytes must be zero"
        );
        assert_eq!(wire.len(), padded_end + FOOTER_LEN);

        let chunk = rng.random_range(1..64);
        let mut dec = FrameDecoder::new();
        let got = decode_all(&mut dec, &wire, chunk);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].as_ref().expect("frame accepted"), &payload);
    }
}

#[test]
fn single_byte_corruption_never_accepts_the_frame() {
    // Counter validation armed, as in a live session: the reference frame
    // carries the expected counter 2 on CCD 0 of a single-CCD topology.
    let payload = [0x11u8, 0x22, 0x33, 0x44, 0x55];
    let wire = stub_frame(2, RrnId::AddrXferResp, 0, &payload);

    for idx in 0..wire.len() {
        for bit in [0x01u8, 0x80] {
            let mut bad = wire.clone();
            bad[idx] ^= bit;

            let mut dec = FrameDecoder::new();
            dec.mark_connected(1);
            let outcomes = decode_all(&mut dec, &bad, 16);
            let accepted = outcomes.iter().filter(|o| o.is_ok()).count();
            assert_eq!(
                accepted, 0,
                "corrupting byte {idx} (bit {bit:#04x}) must not yield a valid frame"
            );
        }
    }
}

#[test]
fn in_order_counters_accepted_gap_rejected() {
    let mut dec = FrameDecoder::new();
    dec.mark_connected(1);

    for counter in 2..=5u32 {
        let wire = stub_frame(counter, RrnId::Beacon, 0, &counter.to_le_bytes());
        dec.extend(&wire);
        let frame = dec.next_frame().expect("in sequence").expect("complete");
        assert_eq!(frame.header.counter.get(), counter);
    }

    // Skipping 6 is a protocol violation.
    let wire = stub_frame(7, RrnId::Beacon, 0, &7u32.to_le_bytes());
    dec.extend(&wire);
    assert_eq!(
        dec.next_frame().expect_err("counter gap"),
        ProtocolError::CounterSkew { got: 7, want: 6 }
    );
}

#[test]
fn byte_wise_resync_accepts_exactly_one_frame() {
    let mut rng = rand::rng();
    let frame = stub_frame(1, RrnId::ConnectResp, 0, &[0xAB; 20]);

    for _ in 0..40 {
        let k = rng.random_range(0..64);
        // The inbound start magic contains 0xC0; keeping garbage below it
        // guarantees no window of the prefix forms the magic.
        let mut wire: Vec<u8> = (0..k).map(|_| rng.random_range(0..0xC0u8)).collect();
        wire.extend_from_slice(&frame);

        let mut dec = FrameDecoder::new();
        let got = decode_all(&mut dec, &wire, 7);
        let accepted: Vec<_> = got.iter().filter(|o| o.is_ok()).collect();
        assert_eq!(accepted.len(), 1, "k={k}");
    }
}

#[test]
fn oversized_payload_is_rejected_at_header_time() {
    // A frame claiming more payload than the receive window can ever hold.
    let mut wire = stub_frame(1, RrnId::LogMsg, 0, &[0u8; 8]);
    let huge = (4096u32 - FRAME_OVERHEAD as u32) + 1;
    wire[4..8].copy_from_slice(&huge.to_le_bytes());

    let mut dec = FrameDecoder::new();
    dec.extend(&wire);
    assert!(matches!(
        dec.next_frame(),
        Err(ProtocolError::PayloadTooLarge { .. })
    ));
}

#[test]
fn wrong_direction_magic_is_not_a_frame() {
    // A host→stub frame fed to the host-side decoder must never parse.
    let wire = encode_to_vec(Direction::HostToStub, 1, RrnId::ConnectReq, 0, 0, 0, &[]);
    let mut dec = FrameDecoder::new();
    let got = decode_all(&mut dec, &wire, 8);
    assert_eq!(got.len(), 0, "stream is silently skipped during resync");
}

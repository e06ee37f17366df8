// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Frame emitter and receive state machine.
//!
//! The decoder is a pure incremental parser: the engine feeds it whatever
//! the transport produced and cranks [`FrameDecoder::next_frame`] until it
//! runs dry. Validation failures surface as [`ProtocolError`]; a start-magic
//! mismatch is not an error but a byte-wise resync, so a receiver can lock
//! onto a stream mid-flight.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes};

use crate::{
    error::ProtocolError,
    pdu::{
        header::{
            Direction, FOOTER_LEN, FRAME_OVERHEAD, HEADER_LEN, PduFooter, PduHeader,
            RECV_BUFFER_LEN, byte_sum, pad_len,
        },
        rrn::RrnId,
    },
};

/// A validated inbound frame: owned header plus the payload with the
/// zero padding already stripped.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: PduHeader,
    pub payload: Bytes,
}

impl RawFrame {
    #[inline]
    pub fn rrn(&self) -> Result<RrnId, ProtocolError> {
        let raw = self.header.rrn.get();
        RrnId::try_from(raw).map_err(|_| ProtocolError::UnknownRrn(raw))
    }
}

/// Serialized frame envelope: the caller writes `header`, the payload
/// parts, `pad` zero bytes and `footer`, in that order.
#[derive(Debug)]
pub struct EncodedFrame {
    pub header: PduHeader,
    pub pad: usize,
    pub footer: PduFooter,
}

pub const PAD_ZEROES: [u8; 8] = [0u8; 8];

/// Builds header and footer for a payload given as scattered parts.
///
/// The checksum covers `header ∥ payload ∥ pad`; pad bytes are zero and
/// drop out of the byte sum.
pub fn encode(
    direction: Direction,
    counter: u32,
    rrn: RrnId,
    ccd_id: u32,
    timestamp_ms: u32,
    request_rc: u32,
    parts: &[&[u8]],
) -> EncodedFrame {
    let payload_len: usize = parts.iter().map(|p| p.len()).sum();
    let header = PduHeader::new(
        direction,
        payload_len as u32,
        counter,
        rrn,
        ccd_id,
        timestamp_ms,
        request_rc,
    );

    let mut sum = byte_sum(&[header.as_bytes()]);
    for part in parts {
        sum = sum.wrapping_add(byte_sum(&[part]));
    }

    EncodedFrame {
        header,
        pad: pad_len(payload_len),
        footer: PduFooter {
            checksum: sum.wrapping_neg().into(),
            magic: direction.end_magic().into(),
        },
    }
}

/// Convenience for tests and the ring-buffer path: one contiguous buffer.
pub fn encode_to_vec(
    direction: Direction,
    counter: u32,
    rrn: RrnId,
    ccd_id: u32,
    timestamp_ms: u32,
    request_rc: u32,
    parts: &[&[u8]],
) -> Vec<u8> {
    let frame = encode(direction, counter, rrn, ccd_id, timestamp_ms, request_rc, parts);
    let payload_len: usize = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload_len + frame.pad);
    out.extend_from_slice(frame.header.as_bytes());
    for part in parts {
        out.extend_from_slice(part);
    }
    out.extend_from_slice(&PAD_ZEROES[..frame.pad]);
    out.extend_from_slice(frame.footer.as_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    SeekMagic,
    Header,
    Payload,
    Footer,
}

/// Receive state machine: SeekMagic → Header → Payload → Footer.
#[derive(Debug)]
pub struct FrameDecoder {
    direction: Direction,
    state: DecodeState,
    /// Raw unconsumed input.
    pending: BytesMut,
    /// The frame being assembled, header onward.
    frame: BytesMut,
    /// Padded payload length of the frame being assembled.
    padded_len: usize,
    connected: bool,
    expect_counter: u32,
    c_ccds: u32,
}

impl FrameDecoder {
    /// Decoder for the host side of the link (expects stub→host magics).
    pub fn new() -> Self {
        Self::for_direction(Direction::StubToHost)
    }

    /// `direction` is the direction of the frames being *received*; the
    /// stub-side decoder in the test suite parses host→stub frames.
    pub fn for_direction(direction: Direction) -> Self {
        Self {
            direction,
            state: DecodeState::SeekMagic,
            pending: BytesMut::with_capacity(RECV_BUFFER_LEN),
            frame: BytesMut::with_capacity(RECV_BUFFER_LEN),
            padded_len: 0,
            connected: false,
            // A single CCD until the handshake advertises the topology, so
            // the ConnectResponse itself (CCD 0) passes validation.
            expect_counter: 1,
            c_ccds: 1,
        }
    }

    /// Arms counter validation after a validated ConnectResponse. The
    /// response was inbound frame #1, so #2 is expected next.
    pub fn mark_connected(&mut self, c_ccds: u32) {
        self.connected = true;
        self.c_ccds = c_ccds;
        self.expect_counter = 2;
    }

    #[inline]
    pub fn expect_counter(&self) -> u32 {
        self.expect_counter
    }

    /// Feeds raw transport bytes into the decoder.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn reset(&mut self) {
        self.state = DecodeState::SeekMagic;
        self.frame.clear();
        self.padded_len = 0;
    }

    /// Moves up to `target - frame.len()` pending bytes into the frame
    /// buffer; true when the frame buffer reached `target`.
    fn fill_frame_to(&mut self, target: usize) -> bool {
        let missing = target.saturating_sub(self.frame.len());
        let take = missing.min(self.pending.len());
        if take > 0 {
            self.frame.extend_from_slice(&self.pending[..take]);
            self.pending.advance(take);
        }
        self.frame.len() >= target
    }

    /// Cranks the state machine. `Ok(None)` means "need more input".
    ///
    /// A validation failure resets the machine and is returned; whether it
    /// is fatal is the caller's policy.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::SeekMagic => {
                    let magic = self.direction.start_magic().to_le_bytes();
                    // Byte-wise resync: drop one leading byte per mismatch.
                    while self.pending.len() >= 4 && self.pending[..4] != magic {
                        self.pending.advance(1);
                    }
                    if self.pending.len() < 4 {
                        return Ok(None);
                    }
                    self.frame.clear();
                    self.frame.extend_from_slice(&self.pending[..4]);
                    self.pending.advance(4);
                    self.state = DecodeState::Header;
                },
                DecodeState::Header => {
                    if !self.fill_frame_to(HEADER_LEN) {
                        return Ok(None);
                    }
                    let header = self.peek_header();
                    if let Err(e) = self.validate_header(&header) {
                        debug!("rejecting frame header: {e}");
                        self.reset();
                        return Err(e);
                    }
                    let len = header.payload_len.get() as usize;
                    self.padded_len = len + pad_len(len);
                    self.state = if self.padded_len == 0 {
                        DecodeState::Footer
                    } else {
                        DecodeState::Payload
                    };
                },
                DecodeState::Payload => {
                    if !self.fill_frame_to(HEADER_LEN + self.padded_len) {
                        return Ok(None);
                    }
                    self.state = DecodeState::Footer;
                },
                DecodeState::Footer => {
                    let total = HEADER_LEN + self.padded_len + FOOTER_LEN;
                    if !self.fill_frame_to(total) {
                        return Ok(None);
                    }
                    let result = self.finish_frame();
                    self.reset();
                    return result.map(Some);
                },
            }
        }
    }

    fn peek_header(&self) -> PduHeader {
        PduHeader::read_from_bytes(&self.frame[..HEADER_LEN])
            .unwrap_or_else(|_| unreachable!("frame buffer holds a full header"))
    }

    fn validate_header(&self, header: &PduHeader) -> Result<(), ProtocolError> {
        debug_assert_eq!(header.magic.get(), self.direction.start_magic());

        let len = header.payload_len.get();
        let max = (RECV_BUFFER_LEN - FRAME_OVERHEAD) as u32;
        if len > max {
            return Err(ProtocolError::PayloadTooLarge { len, max });
        }

        let raw_rrn = header.rrn.get();
        let rrn =
            RrnId::try_from(raw_rrn).map_err(|_| ProtocolError::UnknownRrn(raw_rrn))?;
        let rrn_fits_direction = match self.direction {
            // Host side: only responses and notifications come back.
            Direction::StubToHost => rrn.is_response() || rrn.is_notification(),
            // Stub side: only requests arrive.
            Direction::HostToStub => rrn.is_request(),
        };
        if !rrn_fits_direction {
            return Err(ProtocolError::UnknownRrn(raw_rrn));
        }

        if self.connected && header.counter.get() != self.expect_counter {
            return Err(ProtocolError::CounterSkew {
                got: header.counter.get(),
                want: self.expect_counter,
            });
        }

        if header.ccd_id.get() >= self.c_ccds {
            return Err(ProtocolError::CcdOutOfRange {
                got: header.ccd_id.get(),
                max: self.c_ccds,
            });
        }

        Ok(())
    }

    fn finish_frame(&mut self) -> Result<RawFrame, ProtocolError> {
        let header = self.peek_header();
        let body_end = HEADER_LEN + self.padded_len;
        let footer = PduFooter::read_from_bytes(&self.frame[body_end..body_end + FOOTER_LEN])
            .unwrap_or_else(|_| unreachable!("frame buffer holds a full footer"));

        if footer.magic.get() != self.direction.end_magic() {
            return Err(ProtocolError::BadEndMagic(footer.magic.get()));
        }

        let sum = byte_sum(&[&self.frame[..body_end]]).wrapping_add(footer.checksum.get());
        if sum != 0 {
            return Err(ProtocolError::ChecksumMismatch(sum));
        }

        self.expect_counter = self.expect_counter.wrapping_add(1);

        let payload_len = header.payload_len.get() as usize;
        let payload =
            Bytes::copy_from_slice(&self.frame[HEADER_LEN..HEADER_LEN + payload_len]);
        trace!(
            counter = header.counter.get(),
            rrn = header.rrn.get(),
            len = payload_len,
            "frame accepted"
        );
        Ok(RawFrame { header, payload })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

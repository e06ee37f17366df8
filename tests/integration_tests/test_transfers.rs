// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use psp_proxy_rs::{
    error::EngineError,
    pdu::{addr::PspAddress, request::XferFlags},
    proxy::{PspProxy, XferData},
    transport::TcpTransport,
};
use serial_test::serial;

use crate::integration_tests::stub::{self, StubConfig, mem_pattern};

const T: Duration = Duration::from_secs(2);

/// Wire cost of one transfer chunk besides the data itself: 32-byte frame
/// header, 8-byte footer, 32-byte request struct.
const XFER_OVERHEAD: u32 = 32 + 8 + 32;

async fn connected_proxy(cfg: StubConfig) -> Result<(PspProxy<TcpTransport>, stub::StubHandle)> {
    let handle = stub::spawn(cfg).await;
    let transport =
        TcpTransport::connect(&handle.addr.ip().to_string(), handle.addr.port()).await?;
    let mut proxy = PspProxy::with_null_io(transport);
    proxy.connect(T).await?;
    Ok((proxy, handle))
}

#[tokio::test]
#[serial]
async fn chunked_read_covers_range_exactly_once() -> Result<()> {
    let (mut proxy, handle) = connected_proxy(StubConfig {
        cb_pdu_max: 512,
        ..StubConfig::default()
    })
    .await?;

    const BASE: u32 = 0x1000;
    const LEN: usize = 1600;
    let mut out = vec![0u8; LEN];
    proxy.psp_mem_read(0, BASE, &mut out, T).await?;

    // The data matches the stub's deterministic memory.
    for (i, b) in out.iter().enumerate() {
        assert_eq!(*b, mem_pattern(0, BASE as u64 + i as u64), "byte {i}");
    }

    // ceil(1600 / (512 - overhead)) same-kind requests, covering the
    // range exactly once, in order, with no gap or overlap.
    let cap = 512 - XFER_OVERHEAD;
    let want_chunks = (LEN as u32).div_ceil(cap) as usize;
    let xfers = handle.xfers.lock().expect("records");
    assert_eq!(xfers.len(), want_chunks);

    let mut cursor = BASE as u64;
    let mut total = 0u32;
    for rec in xfers.iter() {
        assert_eq!(rec.space, 0, "PSP SRAM space tag");
        assert_eq!(rec.addr, cursor, "chunks advance the remote address");
        assert!(rec.cb <= cap);
        assert_ne!(rec.flags & XferFlags::READ.bits(), 0);
        assert_ne!(rec.flags & XferFlags::INCR_ADDR.bits(), 0);
        cursor += rec.cb as u64;
        total += rec.cb;
    }
    assert_eq!(total as usize, LEN);
    Ok(())
}

#[tokio::test]
#[serial]
async fn chunked_write_reads_back_identically() -> Result<()> {
    let (mut proxy, handle) = connected_proxy(StubConfig {
        cb_pdu_max: 512,
        ..StubConfig::default()
    })
    .await?;

    const BASE: u32 = 0x8000;
    let data: Vec<u8> = (0..1000u32).map(|i| (i.wrapping_mul(2654435761) >> 7) as u8).collect();
    proxy.psp_mem_write(0, BASE, &data, T).await?;

    let cap = 512 - XFER_OVERHEAD;
    let want_chunks = (data.len() as u32).div_ceil(cap) as usize;
    assert_eq!(handle.xfers.lock().expect("records").len(), want_chunks);

    let mut back = vec![0u8; data.len()];
    proxy.psp_mem_read(0, BASE, &mut back, T).await?;
    assert_eq!(back, data);
    Ok(())
}

#[tokio::test]
#[serial]
async fn memset_fills_with_stride_pattern() -> Result<()> {
    let (mut proxy, _handle) = connected_proxy(StubConfig::default()).await?;

    let pattern = [0xAB, 0xCD, 0xEF, 0x01];
    proxy
        .fill(0, PspAddress::PspSram(0x9000), 4, &pattern, 64, T)
        .await?;

    let mut back = vec![0u8; 64];
    proxy.psp_mem_read(0, 0x9000, &mut back, T).await?;
    for (i, b) in back.iter().enumerate() {
        assert_eq!(*b, pattern[i % 4], "byte {i}");
    }
    Ok(())
}

#[tokio::test]
#[serial]
async fn register_write_read_roundtrip() -> Result<()> {
    let (mut proxy, _handle) = connected_proxy(StubConfig::default()).await?;

    proxy.psp_mmio_write(0, 0x0300_0000, 4, 0xA5A5_5A5A, T).await?;
    assert_eq!(proxy.psp_mmio_read(0, 0x0300_0000, 4, T).await?, 0xA5A5_5A5A);

    proxy.x86_mmio_write(0, 0xFED8_0000, 8, 0x1122_3344_5566_7788, T).await?;
    assert_eq!(
        proxy.x86_mmio_read(0, 0xFED8_0000, 8, T).await?,
        0x1122_3344_5566_7788
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn coproc_and_branch_ops() -> Result<()> {
    let (mut proxy, _handle) = connected_proxy(StubConfig::default()).await?;

    // The stub folds the selector into the value deterministically.
    let val = proxy.coproc_read(0, 15, 0, 1, 2, 3, T).await?;
    assert_eq!(val, (1 << 16) | (2 << 8) | 3);

    proxy.coproc_write(0, 15, 0, 1, 0, 1, 0xFEED, T).await?;
    proxy.branch_to(0, 0x2_4000, T).await?;
    assert_eq!(proxy.last_request_rc(), 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn facade_rejects_bad_shapes_before_wire_traffic() -> Result<()> {
    let (mut proxy, handle) = connected_proxy(StubConfig::default()).await?;

    // Register width outside {1,2,4,8}.
    assert!(matches!(
        proxy.smn_read(0, 0x1000, 3, T).await,
        Err(EngineError::InvalidArgument(_))
    ));

    // Bad stride.
    let mut buf = [0u8; 6];
    assert!(matches!(
        proxy
            .transfer(
                0,
                PspAddress::Smn(0x1000),
                XferFlags::READ,
                3,
                XferData::Read(&mut buf),
                T
            )
            .await,
        Err(EngineError::InvalidArgument(_))
    ));

    // Length not a stride multiple.
    let mut buf = [0u8; 6];
    assert!(matches!(
        proxy
            .transfer(
                0,
                PspAddress::Smn(0x1000),
                XferFlags::READ,
                4,
                XferData::Read(&mut buf),
                T
            )
            .await,
        Err(EngineError::InvalidArgument(_))
    ));

    // Two transfer modes at once.
    assert!(matches!(
        proxy
            .transfer(
                0,
                PspAddress::Smn(0x1000),
                XferFlags::READ | XferFlags::WRITE,
                4,
                XferData::Write(&[0u8; 4]),
                T
            )
            .await,
        Err(EngineError::InvalidArgument(_))
    ));

    // CCD beyond the advertised topology.
    assert!(matches!(
        proxy.smn_read(5, 0x1000, 4, T).await,
        Err(EngineError::InvalidArgument(_))
    ));

    // Nothing reached the stub.
    assert!(handle.xfers.lock().expect("records").is_empty());
    Ok(())
}

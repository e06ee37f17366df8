// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use psp_proxy_rs::{
    cfg::logger::init_logger,
    error::EngineError,
    proxy::PspProxy,
    transport::TcpTransport,
};
use serial_test::serial;

use crate::integration_tests::stub::{self, StubConfig};

const T: Duration = Duration::from_secs(2);

async fn proxy_for(addr: std::net::SocketAddr) -> Result<PspProxy<TcpTransport>> {
    let transport = TcpTransport::connect(&addr.ip().to_string(), addr.port()).await?;
    Ok(PspProxy::with_null_io(transport))
}

#[tokio::test]
#[serial]
async fn smn_read_roundtrip() -> Result<()> {
    let _guard = init_logger("tests/config_logger.yaml")?;

    let stub = stub::spawn(StubConfig {
        preset_mem: vec![(2, 0x02DC_4000, vec![0xDE, 0xAD, 0xBE, 0xEF])],
        ..StubConfig::default()
    })
    .await;

    let mut proxy = proxy_for(stub.addr).await?;
    proxy.connect(T).await?;

    let info = proxy.query_info()?;
    assert_eq!(info.cb_pdu_max, 4096);
    assert_eq!(info.scratch_addr, 0x20000);
    assert_eq!(info.cb_scratch, 0x10000);
    assert_eq!(info.total_ccds(), 1);

    let val = proxy.smn_read(0, 0x02DC_4000, 4, T).await?;
    assert_eq!(val, 0xEFBE_ADDE);
    assert_eq!(proxy.last_request_rc(), 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn handshake_resyncs_over_leading_garbage() -> Result<()> {
    let stub = stub::spawn(StubConfig {
        garbage_prefix: vec![0x13, 0x37, 0x42],
        ..StubConfig::default()
    })
    .await;

    let mut proxy = proxy_for(stub.addr).await?;
    proxy.connect(T).await?;
    assert!(proxy.session().is_connected());
    assert!(proxy.beacons_seen() >= 1);
    Ok(())
}

#[tokio::test]
#[serial]
async fn operations_require_a_session() -> Result<()> {
    let stub = stub::spawn(StubConfig::default()).await;
    let mut proxy = proxy_for(stub.addr).await?;

    assert!(matches!(
        proxy.query_info(),
        Err(EngineError::NotConnected)
    ));
    assert!(matches!(
        proxy.wait_for_irq(Duration::ZERO).await,
        Err(EngineError::NotConnected)
    ));
    assert!(matches!(
        proxy.scratch_alloc(0x100),
        Err(EngineError::NotConnected)
    ));
    Ok(())
}

#[tokio::test]
#[serial]
async fn scratch_allocator_feeds_from_query_info() -> Result<()> {
    let stub = stub::spawn(StubConfig::default()).await;
    let mut proxy = proxy_for(stub.addr).await?;
    proxy.connect(T).await?;

    let a = proxy.scratch_alloc(0x1000)?;
    assert_eq!(a, 0x2F000);
    let b = proxy.scratch_alloc(0x1000)?;
    assert_eq!(b, 0x2E000);
    proxy.scratch_free(a, 0x1000)?;
    proxy.scratch_free(b, 0x1000)?;
    // The region is whole again: the next alloc carves the same block.
    assert_eq!(proxy.scratch_alloc(0x1000)?, 0x2F000);
    Ok(())
}

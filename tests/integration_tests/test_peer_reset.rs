// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use psp_proxy_rs::{error::EngineError, proxy::PspProxy, transport::TcpTransport};
use serial_test::serial;
use tokio::time::sleep;

use crate::integration_tests::stub::{self, StubCommand, StubConfig};

const T: Duration = Duration::from_secs(2);

async fn connected_proxy(
    cfg: StubConfig,
) -> Result<(PspProxy<TcpTransport>, stub::StubHandle)> {
    let handle = stub::spawn(cfg).await;
    let transport =
        TcpTransport::connect(&handle.addr.ip().to_string(), handle.addr.port()).await?;
    let mut proxy = PspProxy::with_null_io(transport);
    proxy.connect(T).await?;
    Ok((proxy, handle))
}

#[tokio::test]
#[serial]
async fn in_sequence_beacons_pass_through() -> Result<()> {
    let (mut proxy, handle) = connected_proxy(StubConfig::default()).await?;
    assert_eq!(proxy.beacons_seen(), 1);

    // The next heartbeat interleaves with a request and is absorbed.
    handle.cmds.send(StubCommand::Beacon { beacons_sent: 2 }).await?;
    sleep(Duration::from_millis(100)).await;

    let _ = proxy.smn_read(0, 0x1000, 4, T).await?;
    assert_eq!(proxy.beacons_seen(), 2);
    Ok(())
}

#[tokio::test]
#[serial]
async fn out_of_sequence_beacon_is_a_peer_reset() -> Result<()> {
    let (mut proxy, handle) = connected_proxy(StubConfig::default()).await?;

    // A few successful round trips first.
    for i in 0..3u32 {
        let _ = proxy.smn_read(0, 0x1000 + i * 4, 4, T).await?;
    }

    // The stub "restarts": its beacon counter falls back to zero.
    handle.cmds.send(StubCommand::Beacon { beacons_sent: 0 }).await?;
    sleep(Duration::from_millis(100)).await;

    let err = proxy
        .smn_read(0, 0x2000, 4, T)
        .await
        .expect_err("reset must surface");
    assert!(matches!(err, EngineError::PeerReset { got: 0, want: 2 }));

    // The connected flag survives, but the engine is latched: every
    // further operation fails until it is torn down and rebuilt.
    assert!(proxy.session().is_connected());
    assert!(matches!(
        proxy.smn_read(0, 0x2000, 4, T).await,
        Err(EngineError::Failed(_))
    ));
    assert!(matches!(
        proxy.wait_for_irq(Duration::ZERO).await,
        Err(EngineError::Failed(_))
    ));
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use psp_proxy_rs::{
    error::{EngineError, TransportError},
    proxy::PspProxy,
    transport::TcpTransport,
};
use serial_test::serial;
use tokio::time::sleep;

use crate::integration_tests::stub::{self, StubCommand, StubConfig};

const T: Duration = Duration::from_secs(2);

#[tokio::test]
#[serial]
async fn drains_in_arrival_order_one_ccd_per_call() -> Result<()> {
    let handle = stub::spawn(StubConfig {
        ccds_per_socket: 2,
        ..StubConfig::default()
    })
    .await;

    let transport =
        TcpTransport::connect(&handle.addr.ip().to_string(), handle.addr.port()).await?;
    let mut proxy = PspProxy::with_null_io(transport);
    proxy.connect(T).await?;

    // Empty table with a zero wait: "no change", not a timeout.
    assert!(proxy.wait_for_irq(Duration::ZERO).await?.is_none());

    handle
        .cmds
        .send(StubCommand::IrqChange {
            ccd: 1,
            irq: true,
            firq: false,
        })
        .await?;
    sleep(Duration::from_millis(50)).await;
    handle
        .cmds
        .send(StubCommand::IrqChange {
            ccd: 0,
            irq: false,
            firq: true,
        })
        .await?;
    sleep(Duration::from_millis(100)).await;

    // Pump both notifications through a request round trip so the table
    // fills before the first drain.
    let _ = proxy.smn_read(0, 0x1000, 4, T).await?;

    let first = proxy.wait_for_irq(Duration::ZERO).await?.expect("pending");
    assert_eq!((first.ccd, first.irq, first.firq), (1, true, false));

    let second = proxy.wait_for_irq(Duration::ZERO).await?.expect("pending");
    assert_eq!((second.ccd, second.irq, second.firq), (0, false, true));

    assert!(proxy.wait_for_irq(Duration::ZERO).await?.is_none());
    Ok(())
}

#[tokio::test]
#[serial]
async fn blocks_until_a_change_arrives() -> Result<()> {
    let handle = stub::spawn(StubConfig::default()).await;
    let transport =
        TcpTransport::connect(&handle.addr.ip().to_string(), handle.addr.port()).await?;
    let mut proxy = PspProxy::with_null_io(transport);
    proxy.connect(T).await?;

    let cmds = handle.cmds.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(150)).await;
        let _ = cmds
            .send(StubCommand::IrqChange {
                ccd: 0,
                irq: true,
                firq: true,
            })
            .await;
    });

    let snap = proxy
        .wait_for_irq(Duration::from_secs(2))
        .await?
        .expect("a change arrives while blocked");
    assert_eq!((snap.ccd, snap.irq, snap.firq), (0, true, true));
    Ok(())
}

#[tokio::test]
#[serial]
async fn interrupt_unblocks_a_pending_wait() -> Result<()> {
    let handle = stub::spawn(StubConfig::default()).await;
    let transport =
        TcpTransport::connect(&handle.addr.ip().to_string(), handle.addr.port()).await?;
    let mut proxy = PspProxy::with_null_io(transport);
    proxy.connect(T).await?;

    let interrupter = proxy.interrupter();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        interrupter.interrupt();
    });

    let err = proxy
        .wait_for_irq(Duration::from_secs(10))
        .await
        .expect_err("interrupted well before the deadline");
    assert!(matches!(
        err,
        EngineError::Transport(TransportError::Interrupted)
    ));

    // Cancellation surfaced as a transport failure, so the engine is done.
    assert!(matches!(
        proxy.smn_read(0, 0x1000, 4, T).await,
        Err(EngineError::Failed(_))
    ));
    Ok(())
}

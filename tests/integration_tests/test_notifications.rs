// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use psp_proxy_rs::{engine::HostIoSink, proxy::PspProxy, transport::TcpTransport};
use serial_test::serial;
use tokio::time::sleep;

use crate::integration_tests::stub::{self, StubCommand, StubConfig};

const T: Duration = Duration::from_secs(2);

#[derive(Default, Clone)]
struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
    out_bufs: Arc<Mutex<Vec<(u32, Vec<u8>)>>>,
}

impl HostIoSink for RecordingSink {
    fn log_msg(&mut self, line: &str) {
        self.lines.lock().expect("lines lock").push(line.to_string());
    }

    fn out_buf_write(&mut self, id_out_buf: u32, data: &[u8]) {
        self.out_bufs
            .lock()
            .expect("out_bufs lock")
            .push((id_out_buf, data.to_vec()));
    }
}

#[tokio::test]
#[serial]
async fn log_lines_and_out_buf_writes_reach_the_sink() -> Result<()> {
    let handle = stub::spawn(StubConfig::default()).await;
    let sink = RecordingSink::default();
    let lines = Arc::clone(&sink.lines);
    let out_bufs = Arc::clone(&sink.out_bufs);

    let transport =
        TcpTransport::connect(&handle.addr.ip().to_string(), handle.addr.port()).await?;
    let mut proxy = PspProxy::new(transport, Box::new(sink));
    proxy.connect(T).await?;

    // A log message split across two notifications, and an out-buffer
    // write, all queued ahead of the next response.
    handle
        .cmds
        .send(StubCommand::LogMsg(b"psp: boot ".to_vec()))
        .await?;
    handle
        .cmds
        .send(StubCommand::LogMsg(b"done\nhalf".to_vec()))
        .await?;
    handle
        .cmds
        .send(StubCommand::OutBuf {
            id: 3,
            data: b"xyz".to_vec(),
        })
        .await?;
    sleep(Duration::from_millis(100)).await;

    // The notifications are dispatched while waiting for this response.
    let _ = proxy.smn_read(0, 0x1000, 4, T).await?;

    assert_eq!(
        lines.lock().expect("lines lock").as_slice(),
        &["psp: boot done\n".to_string()]
    );
    assert_eq!(
        out_bufs.lock().expect("out_bufs lock").as_slice(),
        &[(3u32, b"xyz".to_vec())]
    );
    Ok(())
}

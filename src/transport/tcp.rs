// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP transport: the stub is reachable on a plain socket, usually a
//! forwarded debug port.

use std::{os::fd::AsRawFd, time::Duration};

use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::TransportError,
    transport::{
        Interrupter, PollOutcome, Transport, guarded, poll_with_deadline, queued_bytes,
    },
};

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    cancel: CancellationToken,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!(%host, port, "tcp transport connected");
        Ok(Self {
            stream,
            cancel: CancellationToken::new(),
        })
    }

    /// Wraps an already-connected stream; used by the loopback tests.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            cancel: CancellationToken::new(),
        })
    }
}

impl Transport for TcpTransport {
    async fn peek(&mut self) -> Result<usize, TransportError> {
        Ok(queued_bytes(self.stream.as_raw_fd())?)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.try_read(buf) {
            // A zero-length successful read on a TCP stream is EOF.
            Ok(0) if !buf.is_empty() => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        guarded(&self.cancel, self.stream.write_all(buf)).await
    }

    async fn poll_readable(
        &mut self,
        wait: Duration,
    ) -> Result<PollOutcome, TransportError> {
        poll_with_deadline(&self.cancel, wait, self.stream.readable()).await
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::new(self.cancel.clone())
    }
}

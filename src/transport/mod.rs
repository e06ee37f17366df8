// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pluggable byte transports underneath the PDU engine.
//!
//! A transport is a bidirectional byte channel with non-blocking reads, a
//! blocking-until-complete write, a deadline-bounded readability poll and
//! an out-of-band interrupt. The engine never blocks anywhere else.

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{error::TransportError, transport::uri::DeviceUri};

pub mod flash_rb;
pub mod serial;
pub mod tcp;
pub mod uri;

pub use flash_rb::FlashRbTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Outcome of a bounded readability poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Data can be read (or the link closed; the next read reports that).
    Ready,
    /// The deadline elapsed with nothing to read.
    TimedOut,
}

/// Cloneable handle that unblocks a concurrent poll on the same transport.
///
/// Safe to trigger from another task or a signal handler; the blocked
/// operation surfaces as [`TransportError::Interrupted`].
#[derive(Debug, Clone)]
pub struct Interrupter(CancellationToken);

impl Interrupter {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self(token)
    }

    pub fn interrupt(&self) {
        self.0.cancel();
    }
}

/// Byte channel contract of the engine.
///
/// All five operations report [`TransportError`] instead of panicking; an
/// `Err` from `read`/`write_all` means the link is lost for good.
pub trait Transport {
    /// Bytes available for a non-blocking read. May conservatively
    /// report 0.
    async fn peek(&mut self) -> Result<usize, TransportError>;

    /// Non-blocking read; 0 means "no data right now", a positive short
    /// read is permitted.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes the whole buffer or fails; returns only once every byte is
    /// handed to the channel.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Blocks up to `wait` until data could be read or the link errored.
    async fn poll_readable(&mut self, wait: Duration)
    -> Result<PollOutcome, TransportError>;

    /// Handle that cancels a concurrent `poll_readable` on this transport.
    fn interrupter(&self) -> Interrupter;
}

/// Runs a fallible IO future under the transport's cancellation token.
pub(crate) async fn guarded<F, T>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Interrupted),
        res = fut => res.map_err(TransportError::Io),
    }
}

/// Bounded single-poll helper shared by the stream transports.
pub(crate) async fn poll_with_deadline<F>(
    cancel: &CancellationToken,
    wait: Duration,
    readable: F,
) -> Result<PollOutcome, TransportError>
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Interrupted),
        res = timeout(wait, readable) => match res {
            Ok(Ok(())) => Ok(PollOutcome::Ready),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Ok(PollOutcome::TimedOut),
        },
    }
}

/// Bytes queued on a descriptor, per `FIONREAD`.
#[cfg(unix)]
pub(crate) fn queued_bytes(fd: std::os::fd::RawFd) -> std::io::Result<usize> {
    let mut avail: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the provided pointer.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut avail) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(avail.max(0) as usize)
}

/// One transport per device URI scheme.
///
/// Exists so embedders can pick the provider at run time from a config
/// string while the engine stays generic over [`Transport`].
#[derive(Debug)]
pub enum AnyTransport {
    Tcp(TcpTransport),
    Serial(SerialTransport),
    FlashRb(FlashRbTransport),
}

impl AnyTransport {
    /// Factory: parses `scheme://details` and opens the matching provider.
    /// Unknown schemes fail during parsing with a "no such provider"
    /// error, before any connection attempt.
    pub async fn open(uri: &str) -> Result<Self, OpenError> {
        let parsed: DeviceUri = uri.parse()?;
        Ok(match parsed {
            DeviceUri::Tcp { host, port } => {
                Self::Tcp(TcpTransport::connect(&host, port).await?)
            },
            DeviceUri::Serial {
                path,
                baud,
                data_bits,
                parity,
                stop_bits,
            } => Self::Serial(SerialTransport::open(
                &path, baud, data_bits, parity, stop_bits,
            )?),
            DeviceUri::Em100Tcp { host, port } => {
                Self::FlashRb(FlashRbTransport::connect(&host, port).await?)
            },
        })
    }
}

/// Factory failure: either the URI is not understood or the provider
/// could not bring the channel up.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Uri(#[from] uri::UriError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Transport for AnyTransport {
    async fn peek(&mut self) -> Result<usize, TransportError> {
        match self {
            Self::Tcp(t) => t.peek().await,
            Self::Serial(t) => t.peek().await,
            Self::FlashRb(t) => t.peek().await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self {
            Self::Tcp(t) => t.read(buf).await,
            Self::Serial(t) => t.read(buf).await,
            Self::FlashRb(t) => t.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        match self {
            Self::Tcp(t) => t.write_all(buf).await,
            Self::Serial(t) => t.write_all(buf).await,
            Self::FlashRb(t) => t.write_all(buf).await,
        }
    }

    async fn poll_readable(
        &mut self,
        wait: Duration,
    ) -> Result<PollOutcome, TransportError> {
        match self {
            Self::Tcp(t) => t.poll_readable(wait).await,
            Self::Serial(t) => t.poll_readable(wait).await,
            Self::FlashRb(t) => t.poll_readable(wait).await,
        }
    }

    fn interrupter(&self) -> Interrupter {
        match self {
            Self::Tcp(t) => t.interrupter(),
            Self::Serial(t) => t.interrupter(),
            Self::FlashRb(t) => t.interrupter(),
        }
    }
}

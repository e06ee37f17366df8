// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Serial transport: a termios tty in raw mode.
//!
//! The descriptor stays `O_NONBLOCK` for its whole lifetime; writes loop on
//! writability instead of flipping the flag per operation, so the observable
//! contract is unchanged: `write_all` returns only once the full packet is
//! out or the line failed.

use std::{
    fs::File,
    io::{Read, Write},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
    time::Duration,
};

use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags,
    SetArg, SpecialCharacterIndices,
};
use tokio::{
    io::unix::AsyncFd,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::TransportError,
    transport::{Interrupter, PollOutcome, Transport, queued_bytes, uri::Parity},
};

fn nix_err(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

fn baud_rate(baud: u32) -> Option<BaudRate> {
    Some(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _ => return None,
    })
}

fn configure_tty(
    file: &File,
    baud: u32,
    data_bits: u8,
    parity: Parity,
    stop_bits: u8,
) -> std::io::Result<()> {
    let mut tio = termios::tcgetattr(file).map_err(nix_err)?;

    // Raw mode: no line editing, no echo, no signal keys, no translation.
    tio.local_flags
        .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
    tio.output_flags.remove(OutputFlags::OPOST);
    tio.input_flags.remove(
        InputFlags::IXON
            | InputFlags::IXOFF
            | InputFlags::ICRNL
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ISTRIP,
    );

    tio.control_flags.remove(
        ControlFlags::CSIZE
            | ControlFlags::PARENB
            | ControlFlags::PARODD
            | ControlFlags::CSTOPB,
    );
    tio.control_flags.insert(match data_bits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        _ => ControlFlags::CS8,
    });
    match parity {
        Parity::None => {},
        Parity::Even => {
            tio.control_flags.insert(ControlFlags::PARENB);
        },
        Parity::Odd => {
            tio.control_flags
                .insert(ControlFlags::PARENB | ControlFlags::PARODD);
        },
    }
    if stop_bits == 2 {
        tio.control_flags.insert(ControlFlags::CSTOPB);
    }
    tio.control_flags
        .insert(ControlFlags::CREAD | ControlFlags::CLOCAL);

    // VMIN=0/VTIME=0: reads return whatever is queued, possibly nothing.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    let rate = baud_rate(baud).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "unsupported baud rate")
    })?;
    termios::cfsetispeed(&mut tio, rate).map_err(nix_err)?;
    termios::cfsetospeed(&mut tio, rate).map_err(nix_err)?;

    termios::tcflush(file, FlushArg::TCIOFLUSH).map_err(nix_err)?;
    termios::tcsetattr(file, SetArg::TCSANOW, &tio).map_err(nix_err)?;
    Ok(())
}

#[derive(Debug)]
pub struct SerialTransport {
    fd: AsyncFd<File>,
    cancel: CancellationToken,
}

impl SerialTransport {
    /// Opens and configures the tty. Must run inside a tokio runtime (the
    /// descriptor is registered with the reactor).
    pub fn open(
        path: &Path,
        baud: u32,
        data_bits: u8,
        parity: Parity,
        stop_bits: u8,
    ) -> Result<Self, TransportError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;
        configure_tty(&file, baud, data_bits, parity, stop_bits)?;
        debug!(path = %path.display(), baud, "serial transport opened");
        Ok(Self {
            fd: AsyncFd::new(file)?,
            cancel: CancellationToken::new(),
        })
    }
}

impl Transport for SerialTransport {
    async fn peek(&mut self) -> Result<usize, TransportError> {
        Ok(queued_bytes(self.fd.get_ref().as_raw_fd())?)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut f: &File = self.fd.get_ref();
        match f.read(buf) {
            // 0 from a VMIN=0 tty means "nothing queued", not EOF.
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let mut written = 0usize;
        while written < buf.len() {
            let mut guard = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Interrupted),
                g = self.fd.writable() => g.map_err(TransportError::Io)?,
            };
            match guard.try_io(|inner| {
                let mut f: &File = inner.get_ref();
                f.write(&buf[written..])
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    async fn poll_readable(
        &mut self,
        wait: Duration,
    ) -> Result<PollOutcome, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            if queued_bytes(self.fd.get_ref().as_raw_fd())? > 0 {
                return Ok(PollOutcome::Ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(PollOutcome::TimedOut);
            }
            let mut guard = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Interrupted),
                res = timeout(deadline - now, self.fd.readable()) => match res {
                    Ok(g) => g.map_err(TransportError::Io)?,
                    Err(_) => return Ok(PollOutcome::TimedOut),
                },
            };
            // Readiness can be stale after a draining read; re-check the
            // queue before reporting ready.
            if queued_bytes(self.fd.get_ref().as_raw_fd())? == 0 {
                guard.clear_ready();
                continue;
            }
            return Ok(PollOutcome::Ready);
        }
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::new(self.cancel.clone())
    }
}

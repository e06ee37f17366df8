// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Device URI parsing: `scheme://details`.
//!
//! Supported schemes:
//! - `tcp://<host>:<port>` — stub reachable over a TCP socket
//! - `serial://<path>:<baud>:<databits>:<parity>:<stopbits>` — tty link
//! - `em100tcp://<host>:<port>` — flash emulator with the ring-buffer
//!   channel embedded in the image

use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;

/// Baud rates the serial provider accepts.
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("no such provider: {0:?}")]
    NoSuchProvider(String),

    #[error("malformed device URI: {0}")]
    Malformed(&'static str),

    #[error("unsupported baud rate {0} (supported: 9600..115200)")]
    BadBaudRate(u32),

    #[error("data bits must be 5..=8, got {0}")]
    BadDataBits(u8),

    #[error("parity must be one of n/o/e, got {0:?}")]
    BadParity(String),

    #[error("stop bits must be 1 or 2, got {0}")]
    BadStopBits(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::None => "n",
            Parity::Odd => "o",
            Parity::Even => "e",
        })
    }
}

/// A parsed device URI, one variant per provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceUri {
    Tcp {
        host: String,
        port: u16,
    },
    Serial {
        path: PathBuf,
        baud: u32,
        data_bits: u8,
        parity: Parity,
        stop_bits: u8,
    },
    Em100Tcp {
        host: String,
        port: u16,
    },
}

fn parse_host_port(details: &str) -> Result<(String, u16), UriError> {
    let (host, port) = details
        .rsplit_once(':')
        .ok_or(UriError::Malformed("expected <host>:<port>"))?;
    if host.is_empty() {
        return Err(UriError::Malformed("empty host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| UriError::Malformed("port is not a u16"))?;
    Ok((host.to_string(), port))
}

fn parse_serial(details: &str) -> Result<DeviceUri, UriError> {
    // The path may itself contain ':' on exotic setups, so split the four
    // trailing fields from the right.
    let mut parts = details.rsplitn(5, ':');
    let stop = parts.next();
    let parity = parts.next();
    let bits = parts.next();
    let baud = parts.next();
    let path = parts.next();
    let (Some(stop), Some(parity), Some(bits), Some(baud), Some(path)) =
        (stop, parity, bits, baud, path)
    else {
        return Err(UriError::Malformed(
            "expected <path>:<baud>:<databits>:<parity>:<stopbits>",
        ));
    };
    if path.is_empty() {
        return Err(UriError::Malformed("empty tty path"));
    }

    let baud = baud
        .parse::<u32>()
        .map_err(|_| UriError::Malformed("baud is not a number"))?;
    if !SUPPORTED_BAUD_RATES.contains(&baud) {
        return Err(UriError::BadBaudRate(baud));
    }

    let data_bits = bits
        .parse::<u8>()
        .map_err(|_| UriError::Malformed("databits is not a number"))?;
    if !(5..=8).contains(&data_bits) {
        return Err(UriError::BadDataBits(data_bits));
    }

    let parity = match parity {
        "n" | "N" => Parity::None,
        "o" | "O" => Parity::Odd,
        "e" | "E" => Parity::Even,
        other => return Err(UriError::BadParity(other.to_string())),
    };

    let stop_bits = stop
        .parse::<u8>()
        .map_err(|_| UriError::Malformed("stopbits is not a number"))?;
    if stop_bits != 1 && stop_bits != 2 {
        return Err(UriError::BadStopBits(stop_bits));
    }

    Ok(DeviceUri::Serial {
        path: PathBuf::from(path),
        baud,
        data_bits,
        parity,
        stop_bits,
    })
}

impl FromStr for DeviceUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, details) = s
            .split_once("://")
            .ok_or(UriError::Malformed("expected scheme://details"))?;
        match scheme {
            "tcp" => {
                let (host, port) = parse_host_port(details)?;
                Ok(DeviceUri::Tcp { host, port })
            },
            "em100tcp" => {
                let (host, port) = parse_host_port(details)?;
                Ok(DeviceUri::Em100Tcp { host, port })
            },
            "serial" => parse_serial(details),
            other => Err(UriError::NoSuchProvider(other.to_string())),
        }
    }
}

impl fmt::Display for DeviceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceUri::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            DeviceUri::Em100Tcp { host, port } => write!(f, "em100tcp://{host}:{port}"),
            DeviceUri::Serial {
                path,
                baud,
                data_bits,
                parity,
                stop_bits,
            } => write!(
                f,
                "serial://{}:{baud}:{data_bits}:{parity}:{stop_bits}",
                path.display()
            ),
        }
    }
}

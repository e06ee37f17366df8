// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy of the proxy.
//!
//! Transport failures, protocol violations and stub-side rejections are
//! distinct kinds so that an embedder can tell "the link died" from "the
//! stub said no" without string matching.

use thiserror::Error;

/// Failure of the byte channel underneath the PDU engine.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The OS-level channel reported an error; the link is gone.
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the channel.
    #[error("transport closed by peer")]
    Closed,

    /// A concurrent [`Interrupter`](crate::transport::Interrupter) fired
    /// while an operation was blocked.
    #[error("transport operation interrupted")]
    Interrupted,
}

/// A violation of the wire protocol detected while validating an inbound
/// frame or matching it against the in-flight request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("header start magic mismatch: got {0:#010x}")]
    BadStartMagic(u32),

    #[error("footer end magic mismatch: got {0:#010x}")]
    BadEndMagic(u32),

    #[error("frame checksum mismatch: byte sum {0:#010x} does not wrap to zero")]
    ChecksumMismatch(u32),

    #[error("payload length {len} exceeds receive window of {max} bytes")]
    PayloadTooLarge { len: u32, max: u32 },

    #[error("RRN id {0:#06x} is not a response or notification")]
    UnknownRrn(u32),

    #[error("inbound PDU counter skew: got {got}, expected {want}")]
    CounterSkew { got: u32, want: u32 },

    #[error("CCD id {got} out of range (topology advertises {max})")]
    CcdOutOfRange { got: u32, max: u32 },

    #[error("unexpected RRN {0:#06x} while waiting for a response")]
    UnexpectedRrn(u32),

    #[error("response payload size mismatch: got {got}, expected {want}")]
    PayloadSizeMismatch { got: usize, want: usize },

    #[error("unusable topology: {sockets} sockets x {ccds_per_socket} CCDs")]
    BadTopology { sockets: u32, ccds_per_socket: u32 },
}

/// Error surface of the PDU engine and the proxy façade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A per-call deadline elapsed with no data.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Header/footer validation failed, the counter skewed or an unexpected
    /// RRN arrived. Recoverable only by tearing the session down.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// A beacon counter out of sequence: the stub resumed from reset.
    #[error("peer reset detected (beacon counter {got}, expected {want})")]
    PeerReset { got: u32, want: u32 },

    /// The stub accepted the request but answered with a non-success
    /// status code.
    #[error("request rejected by stub: rc={rc:#010x}")]
    RequestRejected { rc: u32 },

    /// The façade rejected the call before any wire traffic.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A previous fatal error latched the engine; every further operation
    /// fails until the embedder tears the engine down and reconnects.
    #[error("engine failed permanently: {0}")]
    Failed(&'static str),

    /// The operation needs an established session.
    #[error("not connected")]
    NotConnected,

    /// The scratch region is exhausted or the free request does not match
    /// an allocation.
    #[error("scratch allocator: {0}")]
    Scratch(&'static str),
}

impl EngineError {
    /// Fatal errors latch the engine permanently (peer reset, protocol
    /// violations and transport failures); argument and rejection errors
    /// leave it usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_)
                | EngineError::Protocol(_)
                | EngineError::PeerReset { .. }
        )
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Stub → host payloads: the ConnectResponse body and the four
//! notification bodies the engine understands.

use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32,
};

use crate::error::ProtocolError;

/// Exact-size payload view. Inbound bodies are fixed structs; a size
/// mismatch is a protocol violation, not a parse ambiguity.
fn view<T: ZFromBytes + KnownLayout + Immutable>(
    payload: &[u8],
) -> Result<&T, ProtocolError> {
    T::ref_from_bytes(payload).map_err(|_| ProtocolError::PayloadSizeMismatch {
        got: payload.len(),
        want: size_of::<T>(),
    })
}

/// Body of the ConnectResponse.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ConnectResponsePayload {
    /// Maximum frame size the stub accepts or emits.
    pub cb_pdu_max: U32<LittleEndian>,
    /// Base of the stub-reserved scratch window in PSP SRAM.
    pub scratch_addr: U32<LittleEndian>,
    /// Length of the scratch window in bytes.
    pub cb_scratch: U32<LittleEndian>,
    pub sys_sockets: U32<LittleEndian>,
    pub ccds_per_socket: U32<LittleEndian>,
}

pub const CONNECT_RESP_LEN: usize = size_of::<ConnectResponsePayload>();

impl ConnectResponsePayload {
    pub fn parse(payload: &[u8]) -> Result<&Self, ProtocolError> {
        view(payload)
    }
}

/// Heartbeat the stub emits continuously, carrying a monotonically
/// increasing send counter.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BeaconNotify {
    pub beacons_sent: U32<LittleEndian>,
}

impl BeaconNotify {
    pub fn parse(payload: &[u8]) -> Result<&Self, ProtocolError> {
        view(payload)
    }
}

/// Sub-header of an OutBufWrite notification; the written bytes follow.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OutBufWriteHdr {
    pub id_out_buf: U32<LittleEndian>,
    pub cb_data: U32<LittleEndian>,
}

impl OutBufWriteHdr {
    /// Splits the notification body into its sub-header and the payload
    /// bytes, cross-checking the embedded length.
    pub fn parse(payload: &[u8]) -> Result<(&Self, &[u8]), ProtocolError> {
        let (hdr, rest) = Self::ref_from_prefix(payload).map_err(|_| {
            ProtocolError::PayloadSizeMismatch {
                got: payload.len(),
                want: size_of::<Self>(),
            }
        })?;
        let cb = hdr.cb_data.get() as usize;
        if rest.len() < cb {
            return Err(ProtocolError::PayloadSizeMismatch {
                got: rest.len(),
                want: cb,
            });
        }
        Ok((hdr, &rest[..cb]))
    }
}

/// Current interrupt line state of the emitting CCD.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IrqChangeNotify {
    pub irq_cur: U32<LittleEndian>,
}

impl IrqChangeNotify {
    pub const FIRQ_BIT: u32 = 0b10;
    pub const IRQ_BIT: u32 = 0b01;

    pub fn parse(payload: &[u8]) -> Result<&Self, ProtocolError> {
        view(payload)
    }

    #[inline]
    pub fn irq(&self) -> bool {
        self.irq_cur.get() & Self::IRQ_BIT != 0
    }

    #[inline]
    pub fn firq(&self) -> bool {
        self.irq_cur.get() & Self::FIRQ_BIT != 0
    }
}

/// Final notification of a code-module run, delivering its return value.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ExecFinishedNotify {
    pub cm_ret: U32<LittleEndian>,
}

impl ExecFinishedNotify {
    pub fn parse(payload: &[u8]) -> Result<&Self, ProtocolError> {
        view(payload)
    }
}

/// Body of a CoprocReadResponse.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CoprocReadResponsePayload {
    pub val: U32<LittleEndian>,
}

impl CoprocReadResponsePayload {
    pub fn parse(payload: &[u8]) -> Result<&Self, ProtocolError> {
        view(payload)
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The **RRN id** — the request/response/notification tag carried in every
//! PDU header.
//!
//! The id space is partitioned into three disjoint contiguous ranges:
//!
//! ```text
//! 0x01 ..= 0x3F   requests   (host → stub)
//! 0x41 ..= 0x7F   responses  (stub → host), response id = request id + 0x40
//! 0x81 ..= 0xBF   notifications (stub → host, unsolicited)
//! ```
//!
//! Each request elicits exactly one response bearing the corresponding
//! response id; any number of notifications may interleave before it.

use thiserror::Error;

/// Offset between a request id and its response id.
const RESPONSE_OFFSET: u32 = 0x40;

/// All RRN ids understood by this protocol version.
#[repr(u32)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RrnId {
    // Requests.
    #[default]
    ConnectReq = 0x01,
    AddrXferReq = 0x02,
    CoprocReadReq = 0x03,
    CoprocWriteReq = 0x04,
    BranchToReq = 0x05,
    CodeModLoadReq = 0x06,
    CodeModExecReq = 0x07,
    InputBufWriteReq = 0x08,

    // Responses.
    ConnectResp = 0x41,
    AddrXferResp = 0x42,
    CoprocReadResp = 0x43,
    CoprocWriteResp = 0x44,
    BranchToResp = 0x45,
    CodeModLoadResp = 0x46,
    CodeModExecResp = 0x47,
    InputBufWriteResp = 0x48,

    // Notifications.
    Beacon = 0x81,
    LogMsg = 0x82,
    OutBufWrite = 0x83,
    IrqChange = 0x84,
    CodeModExecFinished = 0x85,
}

/// Returned when a header carries an id outside the defined ranges.
#[derive(Debug, Error)]
#[error("invalid RRN id: {0:#06x}")]
pub struct UnknownRrn(pub u32);

impl RrnId {
    #[inline]
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x01 => Self::ConnectReq,
            0x02 => Self::AddrXferReq,
            0x03 => Self::CoprocReadReq,
            0x04 => Self::CoprocWriteReq,
            0x05 => Self::BranchToReq,
            0x06 => Self::CodeModLoadReq,
            0x07 => Self::CodeModExecReq,
            0x08 => Self::InputBufWriteReq,
            0x41 => Self::ConnectResp,
            0x42 => Self::AddrXferResp,
            0x43 => Self::CoprocReadResp,
            0x44 => Self::CoprocWriteResp,
            0x45 => Self::BranchToResp,
            0x46 => Self::CodeModLoadResp,
            0x47 => Self::CodeModExecResp,
            0x48 => Self::InputBufWriteResp,
            0x81 => Self::Beacon,
            0x82 => Self::LogMsg,
            0x83 => Self::OutBufWrite,
            0x84 => Self::IrqChange,
            0x85 => Self::CodeModExecFinished,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_request(self) -> bool {
        (self as u32) < RESPONSE_OFFSET
    }

    #[inline]
    pub fn is_response(self) -> bool {
        let v = self as u32;
        (0x41..=0x7F).contains(&v)
    }

    #[inline]
    pub fn is_notification(self) -> bool {
        (self as u32) >= 0x81
    }

    /// The response id a request elicits.
    ///
    /// Meaningless for ids outside the request range; callers only invoke
    /// this on the request they are about to emit.
    #[inline]
    pub fn response(self) -> Self {
        debug_assert!(self.is_request());
        match self {
            Self::ConnectReq => Self::ConnectResp,
            Self::AddrXferReq => Self::AddrXferResp,
            Self::CoprocReadReq => Self::CoprocReadResp,
            Self::CoprocWriteReq => Self::CoprocWriteResp,
            Self::BranchToReq => Self::BranchToResp,
            Self::CodeModLoadReq => Self::CodeModLoadResp,
            Self::CodeModExecReq => Self::CodeModExecResp,
            Self::InputBufWriteReq => Self::InputBufWriteResp,
            other => other,
        }
    }
}

impl TryFrom<u32> for RrnId {
    type Error = UnknownRrn;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Self::from_u32(v).ok_or(UnknownRrn(v))
    }
}

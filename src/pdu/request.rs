// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Host → stub request payloads.
//!
//! Each request is a fixed little-endian struct, optionally followed by
//! bulk data (writes, code-module bytes). The structs are `zerocopy` views
//! so serialization is `as_bytes()` and never depends on in-memory layout
//! tricks.

use bitflags::bitflags;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64,
};

use crate::pdu::addr::PspAddress;

bitflags! {
    /// Mode of a generic address transfer.
    ///
    /// Exactly one of `READ`/`WRITE`/`MEMSET` must be set; `INCR_ADDR`
    /// selects between a linear copy and repeated access to a single
    /// address (e.g. a FIFO data port).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XferFlags: u32 {
        const READ      = 0b0001;
        const WRITE     = 0b0010;
        const MEMSET    = 0b0100;
        const INCR_ADDR = 0b1000;
    }
}

impl XferFlags {
    /// True when exactly one transfer mode bit is present.
    #[inline]
    pub fn has_single_mode(self) -> bool {
        (self & (XferFlags::READ | XferFlags::WRITE | XferFlags::MEMSET))
            .bits()
            .count_ones()
            == 1
    }
}

/// Generic address-transfer request; bulk data follows for writes, and a
/// single stride-sized pattern follows for memsets.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AddrXferRequest {
    pub addr_space: U32<LittleEndian>,    // 0..4
    pub caching_flags: U32<LittleEndian>, // 4..8
    pub addr: U64<LittleEndian>,          // 8..16
    pub flags: U32<LittleEndian>,         // 16..20
    pub stride: U32<LittleEndian>,        // 20..24
    pub cb_xfer: U32<LittleEndian>,       // 24..28
    reserved: [u8; 4],                    // 28..32
}

pub const ADDR_XFER_REQ_LEN: usize = size_of::<AddrXferRequest>();

impl AddrXferRequest {
    pub fn new(addr: PspAddress, flags: XferFlags, stride: u32, cb_xfer: u32) -> Self {
        Self {
            addr_space: U32::new(addr.space() as u32),
            caching_flags: U32::new(addr.caching().bits()),
            addr: U64::new(addr.raw()),
            flags: U32::new(flags.bits()),
            stride: U32::new(stride),
            cb_xfer: U32::new(cb_xfer),
            reserved: [0; 4],
        }
    }
}

/// Coprocessor register selector (`MRC`/`MCR`-style addressing).
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CoprocReadRequest {
    pub coproc: U32<LittleEndian>,
    pub opc1: U32<LittleEndian>,
    pub crn: U32<LittleEndian>,
    pub crm: U32<LittleEndian>,
    pub opc2: U32<LittleEndian>,
    reserved: [u8; 4],
}

impl CoprocReadRequest {
    pub fn new(coproc: u32, opc1: u32, crn: u32, crm: u32, opc2: u32) -> Self {
        Self {
            coproc: U32::new(coproc),
            opc1: U32::new(opc1),
            crn: U32::new(crn),
            crm: U32::new(crm),
            opc2: U32::new(opc2),
            reserved: [0; 4],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CoprocWriteRequest {
    pub selector: CoprocReadRequest,
    pub val: U32<LittleEndian>,
    reserved: [u8; 4],
}

impl CoprocWriteRequest {
    pub fn new(selector: CoprocReadRequest, val: u32) -> Self {
        Self {
            selector,
            val: U32::new(val),
            reserved: [0; 4],
        }
    }
}

/// Redirect PSP execution to an address in PSP SRAM.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BranchToRequest {
    pub addr: U32<LittleEndian>,
    pub flags: U32<LittleEndian>,
}

impl BranchToRequest {
    pub fn new(addr: u32) -> Self {
        Self {
            addr: U32::new(addr),
            flags: U32::new(0),
        }
    }
}

/// Announces an upcoming code-module upload of `cb_total` bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CodeModLoadRequest {
    pub cb_total: U32<LittleEndian>,
    reserved: [u8; 4],
}

impl CodeModLoadRequest {
    pub fn new(cb_total: u32) -> Self {
        Self {
            cb_total: U32::new(cb_total),
            reserved: [0; 4],
        }
    }
}

/// Starts a previously loaded code module with one scalar argument.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CodeModExecRequest {
    pub arg: U32<LittleEndian>,
    reserved: [u8; 4],
}

impl CodeModExecRequest {
    pub fn new(arg: u32) -> Self {
        Self {
            arg: U32::new(arg),
            reserved: [0; 4],
        }
    }
}

/// Feeds bytes into one of the stub-side input buffers; the data follows
/// the struct in the payload.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InputBufWriteRequest {
    pub id_in_buf: U32<LittleEndian>,
    pub cb_data: U32<LittleEndian>,
}

pub const INPUT_BUF_WRITE_REQ_LEN: usize = size_of::<InputBufWriteRequest>();

impl InputBufWriteRequest {
    pub fn new(id_in_buf: u32, cb_data: u32) -> Self {
        Self {
            id_in_buf: U32::new(id_in_buf),
            cb_data: U32::new(cb_data),
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Address model of the target system.
//!
//! Every read/write is eventually expressed against one of five address
//! spaces: PSP SRAM, PSP MMIO, the SMN fabric, x86 physical memory or x86
//! MMIO. The x86 spaces are 64-bit; PSP and SMN addresses are 32-bit.

use bitflags::bitflags;

bitflags! {
    /// Caching attributes applied when the stub maps an x86 physical range.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct X86CachingFlags: u32 {
        const WRITE_BACK    = 0b0001;
        const WRITE_COMBINE = 0b0010;
        const WRITE_THROUGH = 0b0100;
    }
}

/// Wire tag selecting the address space of a transfer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSpace {
    PspSram = 0,
    PspMmio = 1,
    Smn = 2,
    X86Mem = 3,
    X86Mmio = 4,
}

/// A tagged target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PspAddress {
    /// PSP-local SRAM.
    PspSram(u32),
    /// PSP-local memory-mapped registers.
    PspMmio(u32),
    /// System Management Network, 32-bit fabric addresses.
    Smn(u32),
    /// x86 physical memory with explicit caching attributes.
    X86Mem {
        addr: u64,
        caching: X86CachingFlags,
    },
    /// x86 memory-mapped I/O (always uncached).
    X86Mmio(u64),
}

impl PspAddress {
    #[inline]
    pub fn space(&self) -> AddrSpace {
        match self {
            PspAddress::PspSram(_) => AddrSpace::PspSram,
            PspAddress::PspMmio(_) => AddrSpace::PspMmio,
            PspAddress::Smn(_) => AddrSpace::Smn,
            PspAddress::X86Mem { .. } => AddrSpace::X86Mem,
            PspAddress::X86Mmio(_) => AddrSpace::X86Mmio,
        }
    }

    /// The numeric address, widened to 64 bits.
    #[inline]
    pub fn raw(&self) -> u64 {
        match *self {
            PspAddress::PspSram(a) | PspAddress::PspMmio(a) | PspAddress::Smn(a) => {
                a as u64
            },
            PspAddress::X86Mem { addr, .. } | PspAddress::X86Mmio(addr) => addr,
        }
    }

    #[inline]
    pub fn caching(&self) -> X86CachingFlags {
        match self {
            PspAddress::X86Mem { caching, .. } => *caching,
            _ => X86CachingFlags::empty(),
        }
    }

    /// The same address advanced by `offset` bytes; used by the chunker.
    #[inline]
    pub fn advanced_by(self, offset: u64) -> Self {
        match self {
            PspAddress::PspSram(a) => PspAddress::PspSram(a.wrapping_add(offset as u32)),
            PspAddress::PspMmio(a) => PspAddress::PspMmio(a.wrapping_add(offset as u32)),
            PspAddress::Smn(a) => PspAddress::Smn(a.wrapping_add(offset as u32)),
            PspAddress::X86Mem { addr, caching } => PspAddress::X86Mem {
                addr: addr.wrapping_add(offset),
                caching,
            },
            PspAddress::X86Mmio(addr) => PspAddress::X86Mmio(addr.wrapping_add(offset)),
        }
    }
}

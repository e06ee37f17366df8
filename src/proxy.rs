// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed façade over the PDU engine.
//!
//! Each operation validates its argument shape up front (register widths,
//! strides, flag combinations), builds the request struct for its wire
//! operation and delegates to the engine's request/response and chunking
//! primitives. Nothing here touches the wire format directly.

use std::time::Duration;

use crate::{
    engine::{
        HostIoSink, IrqSnapshot, NullHostIo, PduEngine, SessionInfo, SessionState,
    },
    error::EngineError,
    pdu::{
        addr::{PspAddress, X86CachingFlags},
        request::{CoprocReadRequest, XferFlags},
    },
    scratch::ScratchAllocator,
    transport::{AnyTransport, Interrupter, OpenError, Transport},
};

/// Register access widths accepted by the read/write helpers.
const REG_WIDTHS: [u32; 4] = [1, 2, 4, 8];

/// Data role of a generic transfer, carrying the matching buffer.
#[derive(Debug)]
pub enum XferData<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    Memset { pattern: &'a [u8], cb_xfer: u32 },
}

/// High-level handle for driving a PSP through the remote-debug stub.
pub struct PspProxy<T: Transport> {
    engine: PduEngine<T>,
    /// Lazily built from the advertised scratch region on first alloc.
    scratch: Option<ScratchAllocator>,
}

impl PspProxy<AnyTransport> {
    /// Opens the provider selected by `scheme://details` and wraps it.
    pub async fn open(uri: &str, sink: Box<dyn HostIoSink>) -> Result<Self, OpenError> {
        Ok(Self::new(AnyTransport::open(uri).await?, sink))
    }
}

impl<T: Transport> PspProxy<T> {
    pub fn new(transport: T, sink: Box<dyn HostIoSink>) -> Self {
        Self {
            engine: PduEngine::new(transport, sink),
            scratch: None,
        }
    }

    /// Proxy without host I/O consumers; log lines and output-buffer
    /// writes are discarded.
    pub fn with_null_io(transport: T) -> Self {
        Self::new(transport, Box::new(NullHostIo))
    }

    pub async fn connect(&mut self, timeout: Duration) -> Result<(), EngineError> {
        self.engine.connect(timeout).await
    }

    #[inline]
    pub fn session(&self) -> &SessionState {
        self.engine.session()
    }

    pub fn query_info(&self) -> Result<&SessionInfo, EngineError> {
        self.engine.query_info()
    }

    #[inline]
    pub fn beacons_seen(&self) -> u32 {
        self.engine.beacons_seen()
    }

    #[inline]
    pub fn last_request_rc(&self) -> u32 {
        self.engine.last_request_rc()
    }

    pub fn interrupter(&self) -> Interrupter {
        self.engine.interrupter()
    }

    // ── generic transfer ───────────────────────────────────────────────

    /// The superset operation: one of read/write/memset over any address
    /// space, with stride and optional address auto-increment.
    pub async fn transfer(
        &mut self,
        ccd: u32,
        addr: PspAddress,
        flags: XferFlags,
        stride: u32,
        data: XferData<'_>,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        if !flags.has_single_mode() {
            return Err(EngineError::InvalidArgument(
                "exactly one of READ/WRITE/MEMSET must be set",
            ));
        }
        if !matches!(stride, 1 | 2 | 4) {
            return Err(EngineError::InvalidArgument("stride must be 1, 2 or 4"));
        }
        let incr = flags.contains(XferFlags::INCR_ADDR);

        match data {
            XferData::Read(out) => {
                if !flags.contains(XferFlags::READ) {
                    return Err(EngineError::InvalidArgument(
                        "READ flag requires a read buffer",
                    ));
                }
                check_xfer_len(out.len(), stride)?;
                self.engine
                    .transfer_read(ccd, addr, incr, stride, out, timeout)
                    .await
            },
            XferData::Write(data) => {
                if !flags.contains(XferFlags::WRITE) {
                    return Err(EngineError::InvalidArgument(
                        "WRITE flag requires a write buffer",
                    ));
                }
                check_xfer_len(data.len(), stride)?;
                self.engine
                    .transfer_write(ccd, addr, incr, stride, data, timeout)
                    .await
            },
            XferData::Memset { pattern, cb_xfer } => {
                if !flags.contains(XferFlags::MEMSET) {
                    return Err(EngineError::InvalidArgument(
                        "MEMSET flag requires a fill pattern",
                    ));
                }
                if pattern.len() != stride as usize {
                    return Err(EngineError::InvalidArgument(
                        "memset pattern must be exactly one stride",
                    ));
                }
                check_xfer_len(cb_xfer as usize, stride)?;
                self.engine
                    .transfer_fill(ccd, addr, incr, stride, pattern, cb_xfer, timeout)
                    .await
            },
        }
    }

    // ── bulk memory ────────────────────────────────────────────────────

    /// Reads `out.len()` bytes of PSP SRAM, chunked transparently.
    pub async fn psp_mem_read(
        &mut self,
        ccd: u32,
        addr: u32,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.engine
            .transfer_read(ccd, PspAddress::PspSram(addr), true, 1, out, timeout)
            .await
    }

    pub async fn psp_mem_write(
        &mut self,
        ccd: u32,
        addr: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.engine
            .transfer_write(ccd, PspAddress::PspSram(addr), true, 1, data, timeout)
            .await
    }

    pub async fn x86_mem_read(
        &mut self,
        ccd: u32,
        addr: u64,
        caching: X86CachingFlags,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let addr = PspAddress::X86Mem { addr, caching };
        self.engine
            .transfer_read(ccd, addr, true, 1, out, timeout)
            .await
    }

    pub async fn x86_mem_write(
        &mut self,
        ccd: u32,
        addr: u64,
        caching: X86CachingFlags,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let addr = PspAddress::X86Mem { addr, caching };
        self.engine
            .transfer_write(ccd, addr, true, 1, data, timeout)
            .await
    }

    /// Fills `cb_xfer` bytes at `addr` with a stride-sized pattern.
    pub async fn fill(
        &mut self,
        ccd: u32,
        addr: PspAddress,
        stride: u32,
        pattern: &[u8],
        cb_xfer: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.transfer(
            ccd,
            addr,
            XferFlags::MEMSET | XferFlags::INCR_ADDR,
            stride,
            XferData::Memset { pattern, cb_xfer },
            timeout,
        )
        .await
    }

    // ── registers ──────────────────────────────────────────────────────

    /// Register read of 1, 2, 4 or 8 bytes, widened to u64.
    pub async fn reg_read(
        &mut self,
        ccd: u32,
        addr: PspAddress,
        cb_val: u32,
        timeout: Duration,
    ) -> Result<u64, EngineError> {
        check_reg_width(cb_val)?;
        let mut raw = [0u8; 8];
        let stride = cb_val.min(4);
        self.engine
            .transfer_read(ccd, addr, true, stride, &mut raw[..cb_val as usize], timeout)
            .await?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Register write of 1, 2, 4 or 8 bytes.
    pub async fn reg_write(
        &mut self,
        ccd: u32,
        addr: PspAddress,
        cb_val: u32,
        val: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        check_reg_width(cb_val)?;
        let raw = val.to_le_bytes();
        let stride = cb_val.min(4);
        self.engine
            .transfer_write(ccd, addr, true, stride, &raw[..cb_val as usize], timeout)
            .await
    }

    pub async fn smn_read(
        &mut self,
        ccd: u32,
        addr: u32,
        cb_val: u32,
        timeout: Duration,
    ) -> Result<u64, EngineError> {
        self.reg_read(ccd, PspAddress::Smn(addr), cb_val, timeout).await
    }

    pub async fn smn_write(
        &mut self,
        ccd: u32,
        addr: u32,
        cb_val: u32,
        val: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.reg_write(ccd, PspAddress::Smn(addr), cb_val, val, timeout)
            .await
    }

    pub async fn psp_mmio_read(
        &mut self,
        ccd: u32,
        addr: u32,
        cb_val: u32,
        timeout: Duration,
    ) -> Result<u64, EngineError> {
        self.reg_read(ccd, PspAddress::PspMmio(addr), cb_val, timeout)
            .await
    }

    pub async fn psp_mmio_write(
        &mut self,
        ccd: u32,
        addr: u32,
        cb_val: u32,
        val: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.reg_write(ccd, PspAddress::PspMmio(addr), cb_val, val, timeout)
            .await
    }

    pub async fn x86_mmio_read(
        &mut self,
        ccd: u32,
        addr: u64,
        cb_val: u32,
        timeout: Duration,
    ) -> Result<u64, EngineError> {
        self.reg_read(ccd, PspAddress::X86Mmio(addr), cb_val, timeout)
            .await
    }

    pub async fn x86_mmio_write(
        &mut self,
        ccd: u32,
        addr: u64,
        cb_val: u32,
        val: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.reg_write(ccd, PspAddress::X86Mmio(addr), cb_val, val, timeout)
            .await
    }

    // ── coprocessor and control flow ───────────────────────────────────

    pub async fn coproc_read(
        &mut self,
        ccd: u32,
        coproc: u32,
        opc1: u32,
        crn: u32,
        crm: u32,
        opc2: u32,
        timeout: Duration,
    ) -> Result<u32, EngineError> {
        let sel = CoprocReadRequest::new(coproc, opc1, crn, crm, opc2);
        self.engine.coproc_read(ccd, sel, timeout).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn coproc_write(
        &mut self,
        ccd: u32,
        coproc: u32,
        opc1: u32,
        crn: u32,
        crm: u32,
        opc2: u32,
        val: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let sel = CoprocReadRequest::new(coproc, opc1, crn, crm, opc2);
        self.engine.coproc_write(ccd, sel, val, timeout).await
    }

    /// Redirects the selected PSP to execute at `addr` in its SRAM.
    pub async fn branch_to(
        &mut self,
        ccd: u32,
        addr: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.engine.branch_to(ccd, addr, timeout).await
    }

    // ── code modules ───────────────────────────────────────────────────

    /// Uploads a code module image into the stub's staging input buffer.
    pub async fn code_mod_load(
        &mut self,
        ccd: u32,
        image: &[u8],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        if image.is_empty() {
            return Err(EngineError::InvalidArgument("empty code module image"));
        }
        self.engine.code_mod_load(ccd, image, timeout).await
    }

    /// Runs the loaded module, pumping host input in the meantime, and
    /// returns the module's return value.
    pub async fn code_mod_exec(
        &mut self,
        ccd: u32,
        arg: u32,
        timeout: Duration,
    ) -> Result<u32, EngineError> {
        self.engine.code_mod_exec(ccd, arg, timeout).await
    }

    // ── interrupts ─────────────────────────────────────────────────────

    /// One pending IRQ change per call, in arrival order; see
    /// [`PduEngine::wait_for_irq`] for the timeout semantics.
    pub async fn wait_for_irq(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<IrqSnapshot>, EngineError> {
        self.engine.wait_for_irq(timeout).await
    }

    // ── scratch space ──────────────────────────────────────────────────

    fn scratch_mut(&mut self) -> Result<&mut ScratchAllocator, EngineError> {
        if self.scratch.is_none() {
            let info = self.engine.query_info()?;
            self.scratch = Some(ScratchAllocator::new(
                info.scratch_addr,
                info.cb_scratch,
            ));
        }
        Ok(self
            .scratch
            .as_mut()
            .unwrap_or_else(|| unreachable!("initialized above")))
    }

    /// Carves a block out of the stub-advertised scratch region.
    pub fn scratch_alloc(&mut self, cb: u32) -> Result<u32, EngineError> {
        self.scratch_mut()?.alloc(cb)
    }

    /// Returns a block to the scratch region.
    pub fn scratch_free(&mut self, addr: u32, cb: u32) -> Result<(), EngineError> {
        self.scratch_mut()?.free(addr, cb);
        Ok(())
    }
}

fn check_reg_width(cb_val: u32) -> Result<(), EngineError> {
    if !REG_WIDTHS.contains(&cb_val) {
        return Err(EngineError::InvalidArgument(
            "register width must be 1, 2, 4 or 8 bytes",
        ));
    }
    Ok(())
}

fn check_xfer_len(len: usize, stride: u32) -> Result<(), EngineError> {
    if len == 0 {
        return Err(EngineError::InvalidArgument("zero-length transfer"));
    }
    if len % stride as usize != 0 {
        return Err(EngineError::InvalidArgument(
            "transfer length must be a multiple of the stride",
        ));
    }
    Ok(())
}

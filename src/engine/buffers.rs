// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Engine-side bookkeeping: log-line reassembly and the per-CCD IRQ table.

use std::collections::VecDeque;

use tracing::warn;

use crate::engine::host_io::HostIoSink;

/// Capacity of the line-assembly buffer for LogMsg payloads.
pub const LOG_BUFFER_LEN: usize = 1024;

/// Assembles LogMsg payload fragments into newline-terminated lines.
///
/// A message that would overflow the buffer is dropped whole; partial
/// trailing data stays buffered until its newline arrives.
#[derive(Debug, Default)]
pub struct LogLineBuffer {
    buf: Vec<u8>,
}

impl LogLineBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(LOG_BUFFER_LEN),
        }
    }

    /// Appends a payload and hands every complete line (newline included)
    /// to the sink.
    pub fn push(&mut self, payload: &[u8], sink: &mut dyn HostIoSink) {
        if self.buf.len() + payload.len() > LOG_BUFFER_LEN {
            warn!(
                buffered = self.buf.len(),
                incoming = payload.len(),
                "dropping log message overflowing the line buffer"
            );
            return;
        }
        self.buf.extend_from_slice(payload);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            sink.log_msg(&String::from_utf8_lossy(&line));
        }
    }

    #[cfg(test)]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

/// One delivered IRQ state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqSnapshot {
    pub ccd: u32,
    pub irq: bool,
    pub firq: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct CcdIrq {
    pending: bool,
    irq: bool,
    firq: bool,
}

/// Per-CCD interrupt lines plus a FIFO of CCDs with undelivered changes,
/// drained one CCD per WaitForIrq call in arrival order.
#[derive(Debug, Default)]
pub struct IrqTable {
    ccds: Vec<CcdIrq>,
    fifo: VecDeque<u32>,
}

impl IrqTable {
    /// Sizes the table once the topology is known.
    pub fn resize(&mut self, total_ccds: u32) {
        self.ccds = vec![CcdIrq::default(); total_ccds as usize];
        self.fifo.clear();
    }

    /// Applies an IrqChange notification. The CCD id was already validated
    /// against the topology by the frame decoder.
    pub fn record(&mut self, ccd: u32, irq: bool, firq: bool) {
        let Some(state) = self.ccds.get_mut(ccd as usize) else {
            return;
        };
        state.irq = irq;
        state.firq = firq;
        if !state.pending {
            state.pending = true;
            self.fifo.push_back(ccd);
        }
    }

    /// Number of CCDs with a change received since their last drain.
    #[inline]
    pub fn pending_changes(&self) -> usize {
        self.fifo.len()
    }

    /// Hands back the oldest undelivered change and clears its flag.
    pub fn drain(&mut self) -> Option<IrqSnapshot> {
        let ccd = self.fifo.pop_front()?;
        let state = self.ccds.get_mut(ccd as usize)?;
        state.pending = false;
        Some(IrqSnapshot {
            ccd,
            irq: state.irq,
            firq: state.firq,
        })
    }
}

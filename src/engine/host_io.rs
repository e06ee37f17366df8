// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Host-side I/O callbacks.
//!
//! The embedder provides one sink object; the engine calls into it when
//! the stub pushes log lines or output-buffer bytes, and polls it for
//! stdin-style input while a code module runs. Sinks cannot fail the
//! engine: there is nothing to return, and a panicking sink is an embedder
//! bug, not a protocol condition.

/// Consumer-provided sinks and sources for in-band I/O. All methods have
/// do-nothing defaults, so an embedder implements only what it uses.
pub trait HostIoSink {
    /// One complete log line from the stub, newline included.
    fn log_msg(&mut self, _line: &str) {}

    /// Bytes the PSP wrote to one of its output buffers.
    fn out_buf_write(&mut self, _id_out_buf: u32, _data: &[u8]) {}

    /// Bytes currently available on a host input source. Only consulted
    /// during a code-module run.
    fn in_buf_peek(&mut self, _id_in_buf: u32) -> usize {
        0
    }

    /// Pulls up to `buf.len()` bytes from a host input source; returns the
    /// number copied.
    fn in_buf_read(&mut self, _id_in_buf: u32, _buf: &mut [u8]) -> usize {
        0
    }
}

/// Sink that discards everything; the default for embedders that only
/// issue register traffic.
#[derive(Debug, Default)]
pub struct NullHostIo;

impl HostIoSink for NullHostIo {}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Userspace proxy for driving AMD Platform-Security-Processor hardware
//! through a remote-debugging stub.
//!
//! The [`proxy::PspProxy`] façade issues typed requests (SRAM/MMIO/SMN and
//! x86 memory access, coprocessor registers, code-module upload and
//! execution, interrupt waits); underneath, [`engine::PduEngine`] frames
//! them into checksummed PDUs, correlates responses, multiplexes the
//! stub's asynchronous notifications and chunks transfers against the
//! stub-advertised frame limit. Transports plug in via
//! [`transport::Transport`]: TCP, a raw-mode serial line, or ring buffers
//! embedded in an emulated SPI flash image.

pub mod cfg;
pub mod engine;
pub mod error;
pub mod pdu;
pub mod proxy;
pub mod scratch;
pub mod transport;

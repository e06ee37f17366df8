// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The PDU engine and its session-side state.

pub mod buffers;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod host_io;
pub mod session;

pub use buffers::IrqSnapshot;
pub use engine::{MAX_CCDS, PduEngine};
pub use host_io::{HostIoSink, NullHostIo};
pub use session::{SessionInfo, SessionState};

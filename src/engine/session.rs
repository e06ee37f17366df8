// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session state: a sum type instead of a connected flag, so the values
//! advertised by the handshake only exist while a session does.

/// Everything the ConnectResponse advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Largest frame the stub accepts or emits, bytes.
    pub cb_pdu_max: u32,
    /// Scratch window in PSP SRAM reserved for host allocations.
    pub scratch_addr: u32,
    pub cb_scratch: u32,
    pub sys_sockets: u32,
    pub ccds_per_socket: u32,
}

impl SessionInfo {
    #[inline]
    pub fn total_ccds(&self) -> u32 {
        self.sys_sockets * self.ccds_per_socket
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected(SessionInfo),
}

impl SessionState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }

    #[inline]
    pub fn info(&self) -> Option<&SessionInfo> {
        match self {
            SessionState::Connected(info) => Some(info),
            SessionState::Disconnected => None,
        }
    }
}

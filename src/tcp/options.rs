//! Socket option surface (spec S6). Not modeled by the teacher at all; grafted
//! on as a pair of plain option structs rather than an open-ended `getsockopt`
//! byte-blob API, since the engine is a library, not a syscall table.

use std::time::Duration;

/// `SOL_SOCKET`-equivalent options, independent of the TCP protocol itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasicOptions {
    pub linger: Option<Duration>,
    pub send_buffer_size: u32,
    /// Read-only: always 1.
    pub send_minimum: u32,
    pub send_timeout: Option<Duration>,
    pub receive_buffer_size: u32,
    pub receive_minimum: u32,
    pub receive_timeout: Option<Duration>,
    /// Read-only: true once the socket is Listening.
    pub accept_connections: bool,
    pub keep_alive: bool,
    pub inline_out_of_band: bool,
}

impl Default for BasicOptions {
    fn default() -> Self {
        BasicOptions {
            linger: None,
            send_buffer_size: 16 * 1024,
            send_minimum: 1,
            send_timeout: None,
            receive_buffer_size: 64 * 1024,
            receive_minimum: 1,
            receive_timeout: None,
            accept_connections: false,
            keep_alive: false,
            inline_out_of_band: false,
        }
    }
}

/// Minimum receive-buffer floor: anything smaller clips to one MSS (spec S6).
pub const RECEIVE_BUFFER_MIN: u32 = 256;
pub const RECEIVE_BUFFER_MAX: u32 = 1 << 30;

/// `IPPROTO_TCP`-level options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TcpOptions {
    pub no_delay: bool,
    pub keepalive_timeout: Duration,
    pub keepalive_period: Duration,
    pub keepalive_probe_limit: u32,
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            no_delay: false,
            keepalive_timeout: Duration::from_secs(3600),
            keepalive_period: Duration::from_secs(60),
            keepalive_probe_limit: 5,
        }
    }
}

/// RFC 1323 window-scale selection: the smallest shift such that
/// `buffer_size >> shift` still fits the 16-bit wire window field, capped at
/// the protocol maximum of 14 (spec S6 "growing it re-computes the
/// window-scale").
pub fn compute_window_scale(buffer_size: u32) -> u8 {
    let mut shift = 0u8;
    while (buffer_size >> shift) > u16::MAX as u32 && shift < 14 {
        shift += 1;
    }
    shift
}

/// `UserControl` ioctl-style codes (spec S6), chosen to match common
/// kernel-to-user numbering so a caller coming from a real ioctl table finds
/// familiar values.
pub const AT_URGENT_MARK: u32 = 0x7300;
pub const GET_INPUT_QUEUE_SIZE: u32 = 0x741B;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_window_needs_no_shift() {
        assert_eq!(compute_window_scale(32 * 1024), 0);
    }

    #[test]
    fn larger_windows_need_a_growing_shift_capped_at_fourteen() {
        assert_eq!(compute_window_scale(64 * 1024), 1);
        assert_eq!(compute_window_scale(1 << 20), 5);
        assert_eq!(compute_window_scale(1 << 30), 14);
    }
}

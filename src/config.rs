use std::time::Duration;

/// Bundled tuneables (spec S6). Replaces the scattered literals a first draft
/// tends to inline directly into the state machine.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// Shared periodic timer tick.
    pub tick_interval: Duration,
    /// Initial retransmission back-off.
    pub initial_rto: Duration,
    /// Ceiling on the exponential retransmission/zero-window-probe back-off.
    pub max_rto: Duration,
    /// Default receive window advertised on a fresh connection.
    pub default_recv_window: u32,
    /// Default window-scale shift applied to `default_recv_window`.
    pub default_recv_scale: u8,
    /// Default send-buffer size.
    pub default_send_buffer: u32,
    /// Default segment size used until MSS negotiation completes.
    pub default_mss: u16,
    /// Duplicate-ACK count that triggers fast retransmit.
    pub dup_ack_threshold: u32,
    /// 2*MSL equivalent time held in TIME-WAIT.
    pub time_wait: Duration,
    /// Default keep-alive idle timeout before the first probe.
    pub keepalive_timeout: Duration,
    /// Interval between keep-alive probes.
    pub keepalive_period: Duration,
    /// Probes sent with no reply before the connection is declared dead.
    pub keepalive_probe_limit: u32,
    /// Listener backlog capacity.
    pub backlog: usize,
    /// Default linger timeout when `SO_LINGER` is enabled without `l_onoff=0`.
    pub linger_timeout: Duration,
    /// R1 (spec S4.4/RFC 9293 S3.8.3): cumulative retransmission time for a
    /// data segment past which the path is presumed degraded but the
    /// connection is kept open. Logged, not fatal.
    pub retransmit_warn: Duration,
    /// R2: cumulative retransmission time for a data segment past which the
    /// connection is abandoned.
    pub retransmit_giveup: Duration,
    /// R1 for the initial SYN.
    pub syn_warn: Duration,
    /// R2 for the initial SYN; an active open gives up after this much total
    /// retransmission time with no response.
    pub syn_giveup: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            tick_interval: Duration::from_millis(250),
            initial_rto: Duration::from_millis(500),
            max_rto: Duration::from_secs(120),
            default_recv_window: 64 * 1024,
            default_recv_scale: 8,
            default_send_buffer: 16 * 1024,
            default_mss: 576,
            dup_ack_threshold: 3,
            time_wait: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(3600),
            keepalive_period: Duration::from_secs(60),
            keepalive_probe_limit: 5,
            backlog: 16,
            linger_timeout: Duration::from_secs(30),
            retransmit_warn: Duration::from_secs(50),
            retransmit_giveup: Duration::from_secs(100),
            syn_warn: Duration::from_secs(60),
            syn_giveup: Duration::from_secs(3 * 60),
        }
    }
}

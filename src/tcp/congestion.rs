//! New-Reno congestion control (spec S4.5). Kept close to the teacher's
//! `tcb.rs::{congestion_control, compute_rto}`, which already implements
//! slow start, congestion avoidance, and the RTT EWMA correctly; this module
//! adds the fast-retransmit/fast-recovery half the teacher leaves as a
//! `TODO: Probably want to inform the congestion control algorithm` at the
//! duplicate-ACK branch in `mod.rs`.

use std::cmp;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct CongestionState {
    pub ssthresh: u32,
    pub cwnd: u32,
    pub in_fast_recovery: bool,
    pub fast_recovery_end: u32,
    pub dup_ack_count: u32,
    pub last_ack: Option<u32>,

    srtt: u128,
    rttvar: u128,
    rtt_measured: bool,
    pub rto: Duration,
}

const MIN_RTO_MS: u128 = 1000;

impl CongestionState {
    pub fn new(mss: u32, peer_window: u32, initial_rto: Duration) -> Self {
        CongestionState {
            ssthresh: peer_window.max(mss),
            cwnd: 2 * mss,
            in_fast_recovery: false,
            fast_recovery_end: 0,
            dup_ack_count: 0,
            last_ack: None,
            srtt: 0,
            rttvar: 0,
            rtt_measured: false,
            rto: initial_rto,
        }
    }

    pub fn is_slow_start(&self) -> bool {
        self.cwnd <= self.ssthresh
    }

    pub fn effective_window(&self, peer_window: u32) -> u32 {
        cmp::min(peer_window, self.cwnd)
    }

    /// Cumulative ACK acknowledging new data.
    pub fn on_new_ack(&mut self, mss: u32) {
        self.dup_ack_count = 0;
        if self.in_fast_recovery {
            return; // exit handled by caller via `exit_fast_recovery_if_past`
        }
        if self.is_slow_start() {
            self.cwnd += mss;
        } else {
            self.cwnd += cmp::max(1, ((mss as u64 * mss as u64) / self.cwnd as u64) as u32);
        }
    }

    /// Called once per duplicate ACK observed while not already in fast
    /// recovery; returns true exactly when this is the third duplicate and
    /// fast retransmit should fire.
    pub fn on_duplicate_ack(&mut self, next_seq: u32, mss: u32, dup_ack_threshold: u32) -> bool {
        self.dup_ack_count += 1;

        if self.in_fast_recovery {
            self.cwnd += mss;
            return false;
        }

        if self.dup_ack_count == dup_ack_threshold {
            self.ssthresh = cmp::max(self.cwnd / 2, 2 * mss);
            self.cwnd = self.ssthresh + dup_ack_threshold * mss;
            self.fast_recovery_end = next_seq;
            self.in_fast_recovery = true;
            return true;
        }

        false
    }

    /// A new cumulative ACK covers `fast_recovery_end`: leave fast recovery.
    pub fn exit_fast_recovery_if_past(&mut self, ack: u32) {
        use super::seq::greater_eq;
        if self.in_fast_recovery && greater_eq(ack, self.fast_recovery_end) {
            self.in_fast_recovery = false;
            self.cwnd = self.ssthresh;
        }
    }

    pub fn on_timeout(&mut self, mss: u32) {
        self.ssthresh = cmp::max(self.cwnd / 2, 2 * mss);
        self.cwnd = mss;
        self.in_fast_recovery = false;
        self.dup_ack_count = 0;
        self.rto = cmp::min(self.rto * 2, Duration::from_secs(120));
    }

    /// RFC 6298-style RTT EWMA (alpha=1/8, beta=1/4), matching spec S4.5/S6.
    pub fn sample_rtt(&mut self, r: Duration) {
        let r = r.as_millis();

        if !self.rtt_measured {
            self.srtt = r;
            self.rttvar = r / 2;
            self.rtt_measured = true;
        } else {
            self.rttvar = ((3 * self.rttvar) + self.srtt.abs_diff(r)) / 4;
            self.srtt = ((7 * self.srtt) + r) / 8;
        }

        let rto_ms = self.srtt + cmp::max(100, 4 * self.rttvar);
        self.rto = Duration::from_millis(cmp::max(rto_ms, MIN_RTO_MS) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_then_congestion_avoidance() {
        let mut c = CongestionState::new(536, 10_000, Duration::from_millis(500));
        assert!(c.is_slow_start());
        c.on_new_ack(536);
        assert_eq!(c.cwnd, 3 * 536);

        c.ssthresh = c.cwnd; // force the boundary
        c.on_new_ack(536);
        assert!(c.cwnd > 3 * 536);
    }

    #[test]
    fn third_duplicate_ack_enters_fast_recovery_once() {
        let mut c = CongestionState::new(536, 10_000, Duration::from_millis(500));
        c.cwnd = 10 * 536;
        assert!(!c.on_duplicate_ack(5000, 536, 3));
        assert!(!c.on_duplicate_ack(5000, 536, 3));
        assert!(c.on_duplicate_ack(5000, 536, 3));
        assert!(c.in_fast_recovery);

        let cwnd_after_entry = c.cwnd;
        assert!(!c.on_duplicate_ack(5000, 536, 3));
        assert_eq!(c.cwnd, cwnd_after_entry + 536);
    }

    #[test]
    fn exits_fast_recovery_on_covering_ack() {
        let mut c = CongestionState::new(536, 10_000, Duration::from_millis(500));
        c.cwnd = 10 * 536;
        c.on_duplicate_ack(5000, 536, 3);
        c.on_duplicate_ack(5000, 536, 3);
        c.on_duplicate_ack(5000, 536, 3);
        let ssthresh = c.ssthresh;

        c.exit_fast_recovery_if_past(5000);
        assert!(!c.in_fast_recovery);
        assert_eq!(c.cwnd, ssthresh);
    }

    #[test]
    fn timeout_restarts_slow_start() {
        let mut c = CongestionState::new(536, 10_000, Duration::from_millis(500));
        c.cwnd = 20 * 536;
        c.on_timeout(536);
        assert_eq!(c.cwnd, 536);
        assert!(c.is_slow_start());
    }
}

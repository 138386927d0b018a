//! Send queue & retransmission (spec S4.4).
//!
//! Generalizes the teacher's `tcb.rs::Segment`/`on_tick` retransmit walk: same
//! per-segment `sent`/`total_ret_time`/retry-doubling shape, but against a
//! real ordered queue with tail-coalescing at write time instead of a single
//! flat `outgoing: VecDeque<u8>` that only gets carved into segments lazily
//! on the timer tick.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutFlags {
    pub syn: bool,
    pub fin: bool,
    pub psh: bool,
    pub urg: bool,
}

#[derive(Debug, Clone)]
pub struct OutgoingSegment {
    /// Sequence number of the first byte/control-bit still unacknowledged in
    /// this segment (advances on partial ACK, per spec's `Offset` field).
    pub seq: u32,
    pub flags: OutFlags,
    /// Remaining (not yet acknowledged) payload bytes.
    pub payload: Vec<u8>,
    pub last_send: Option<Instant>,
    pub timeout_interval: Duration,
    pub send_attempts: u32,
    pub total_retrans_time: Duration,
}

impl OutgoingSegment {
    /// Total sequence-space length still outstanding: payload bytes plus one
    /// for SYN/FIN if still unacked.
    pub fn remaining_len(&self) -> u32 {
        self.payload.len() as u32 + if self.flags.syn || self.flags.fin { 1 } else { 0 }
    }

    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.remaining_len())
    }

    pub fn is_control_only(&self) -> bool {
        self.payload.is_empty() && (self.flags.syn || self.flags.fin)
    }
}

#[derive(Debug, Default, Clone)]
pub struct SendQueue {
    segments: VecDeque<OutgoingSegment>,
}

pub enum AckOutcome {
    /// Segment fully acknowledged; bytes to return to the send buffer free
    /// count (data bytes only, not control bits).
    Full { freed_data: u32, rtt_sample: Option<Duration> },
    /// Segment partially acknowledged; some bytes freed but the segment stays.
    Partial { freed_data: u32 },
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue {
            segments: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Sum of outstanding payload bytes across every queued segment (spec
    /// S3 "sum of enqueued segment lengths = SendBufTotal - SendBufFree").
    pub fn queued_bytes(&self) -> u32 {
        self.segments.iter().map(|s| s.payload.len() as u32).sum()
    }

    pub fn push_back(&mut self, seg: OutgoingSegment) {
        self.segments.push_back(seg);
    }

    pub fn front(&self) -> Option<&OutgoingSegment> {
        self.segments.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut OutgoingSegment> {
        self.segments.front_mut()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutgoingSegment> {
        self.segments.iter_mut()
    }

    /// Sequence number one past the last byte/control-bit already queued,
    /// i.e. where the next freshly-written byte would land.
    pub fn peek_end_seq(&self) -> Option<u32> {
        self.segments.back().map(|s| s.end())
    }

    /// Coalesce `data` onto the tail segment if it exists, has never been
    /// transmitted, and has room up to `mss`; otherwise allocate a new tail
    /// segment. Returns the number of bytes actually accepted.
    pub fn append_or_coalesce(&mut self, seq_if_new: u32, data: &[u8], mss: usize, psh: bool) -> u32 {
        if let Some(tail) = self.segments.back_mut() {
            if tail.send_attempts == 0 && !tail.flags.fin && tail.payload.len() < mss {
                let room = mss - tail.payload.len();
                let take = room.min(data.len());
                tail.payload.extend_from_slice(&data[..take]);
                tail.flags.psh = psh && take == data.len();
                return take as u32;
            }
        }

        let take = data.len().min(mss);
        self.segments.push_back(OutgoingSegment {
            seq: seq_if_new,
            flags: OutFlags {
                psh: psh && take == data.len(),
                ..OutFlags::default()
            },
            payload: data[..take].to_vec(),
            last_send: None,
            timeout_interval: Duration::from_secs(1),
            send_attempts: 0,
            total_retrans_time: Duration::ZERO,
        });
        take as u32
    }

    /// Process cumulative ACK number `ack`: remove fully-acked segments,
    /// advance the offset of a segment straddling `ack`. Stops at the first
    /// segment not yet fully covered.
    pub fn process_ack(&mut self, ack: u32) -> (u32, Option<Duration>) {
        use super::seq::greater_eq;

        let mut freed = 0u32;
        let mut rtt_sample = None;

        loop {
            let Some(front) = self.segments.front() else { break };
            let end = front.end();

            if greater_eq(ack, end) {
                // Fully acknowledged.
                let seg = self.segments.pop_front().unwrap();
                freed += seg.payload.len() as u32;
                if seg.send_attempts == 1 {
                    if let Some(sent) = seg.last_send {
                        rtt_sample = Some(sent.elapsed());
                    }
                }
                continue;
            }

            if greater_eq(ack, front.seq) {
                // Partially acknowledged.
                let front = self.segments.front_mut().unwrap();
                let consumed = ack.wrapping_sub(front.seq) as usize;
                let consumed = consumed.min(front.payload.len());
                front.payload.drain(..consumed);
                freed += consumed as u32;
                front.seq = ack;
            }

            break;
        }

        (freed, rtt_sample)
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_small_writes_onto_untransmitted_tail() {
        let mut q = SendQueue::new();
        q.append_or_coalesce(1000, b"hello", 20, false);
        q.append_or_coalesce(1000, b" world", 20, true);

        assert_eq!(q.len(), 1);
        assert_eq!(q.front().unwrap().payload, b"hello world");
        assert!(q.front().unwrap().flags.psh);
        assert_eq!(q.queued_bytes(), 11);
    }

    #[test]
    fn does_not_coalesce_onto_already_sent_segment() {
        let mut q = SendQueue::new();
        q.append_or_coalesce(1000, b"hello", 20, false);
        q.front_mut().unwrap().send_attempts = 1;
        q.append_or_coalesce(1005, b"world", 20, false);

        assert_eq!(q.len(), 2);
    }

    #[test]
    fn full_ack_removes_segment_and_frees_bytes() {
        let mut q = SendQueue::new();
        q.append_or_coalesce(1000, b"hello", 20, true);
        q.front_mut().unwrap().send_attempts = 1;
        q.front_mut().unwrap().last_send = Some(Instant::now());

        let (freed, rtt) = q.process_ack(1005);
        assert_eq!(freed, 5);
        assert!(rtt.is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn partial_ack_advances_offset_without_removing() {
        let mut q = SendQueue::new();
        q.append_or_coalesce(1000, b"hello", 20, true);

        let (freed, _) = q.process_ack(1002);
        assert_eq!(freed, 2);
        assert_eq!(q.front().unwrap().payload, b"llo");
        assert_eq!(q.front().unwrap().seq, 1002);
    }
}

//! Receive reassembly (spec S4.3).
//!
//! The teacher never reassembles out-of-order data at all: `Tcb::on_segment`
//! only accepts the prefix that lines up with `rcv.nxt` and silently clips
//! everything else to the window (`tcb.rs`, the "process segment text" step).
//! This module generalizes that into a real ordered list with insert-and-clip
//! semantics against both neighbors, per spec S4.3 steps 1-6, plus the
//! urgent-byte split the teacher has no equivalent of at all.

use super::pool::SegmentPool;
use super::seq::{greater, less};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegFlags {
    pub fin: bool,
    pub syn: bool,
    pub psh: bool,
    pub urg: bool,
}

#[derive(Debug, Clone)]
pub struct ReceivedSegment {
    pub seq: u32,
    pub len: u32,
    /// Usually `seq + len`, but one larger when a zero-length urgent marker
    /// was split out ahead of this segment (spec S4.3 "Urgent handling").
    pub next_seq: u32,
    pub flags: SegFlags,
    pub payload: Vec<u8>,
}

impl ReceivedSegment {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReassemblyQueue {
    /// Ordered by `seq`, modularly, relative to `rcv.nxt`. No two entries
    /// overlap (spec S8 invariant).
    segments: Vec<ReceivedSegment>,
    pub missing_data: bool,
}

pub struct InsertReport {
    pub inserted: bool,
    pub urgent_raised: bool,
}

impl ReassemblyQueue {
    pub fn new() -> Self {
        ReassemblyQueue {
            segments: Vec::new(),
            missing_data: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn front_seq(&self) -> Option<u32> {
        self.segments.first().map(|s| s.seq)
    }

    /// `UserControl` AtUrgentMark support: does the head entry carry URG.
    pub fn front_is_urgent(&self) -> bool {
        self.segments.first().map(|s| s.flags.urg).unwrap_or(false)
    }

    /// Insert `payload` starting at `seq`, clipped per spec S4.3 steps 1-5,
    /// then allocated/inserted (step 6). `urgent_offset` is `Some(n)` when the
    /// URG flag is set and the urgent pointer lands `n` bytes into `payload`.
    /// `inline_urgent` controls whether the urgent byte itself is kept as a
    /// one-byte segment or consumed as a zero-length flag-only marker.
    pub fn insert(
        &mut self,
        pool: &mut SegmentPool,
        unread: u32,
        rcv_free: u32,
        seq: u32,
        mut payload: Vec<u8>,
        mut flags: SegFlags,
        urgent_offset: Option<usize>,
        inline_urgent: bool,
    ) -> InsertReport {
        let mut seq = seq;
        let mut len = payload.len() as u32;

        // Step 1: entirely below Unread -> discard.
        if !greater(seq.wrapping_add(len), unread) {
            pool.release(payload);
            return InsertReport {
                inserted: false,
                urgent_raised: false,
            };
        }

        // Step 2: clip left edge up to Unread.
        if less(seq, unread) {
            let clip = unread.wrapping_sub(seq) as usize;
            payload.drain(..clip);
            seq = unread;
            len = payload.len() as u32;
        }

        // Find insertion point (first stored segment whose start exceeds seq).
        let idx = self
            .segments
            .iter()
            .position(|s| greater(s.seq, seq))
            .unwrap_or(self.segments.len());

        // Step 3: predecessor overlap.
        if idx > 0 {
            let pred = &self.segments[idx - 1];
            if greater(pred.next_seq, seq) {
                let clip = pred.next_seq.wrapping_sub(seq) as usize;
                if clip >= payload.len() {
                    pool.release(payload);
                    return InsertReport {
                        inserted: false,
                        urgent_raised: false,
                    };
                }
                payload.drain(..clip);
                seq = pred.next_seq;
                len = payload.len() as u32;
            }
        }

        // Step 4: successor overlap.
        if idx < self.segments.len() {
            let succ_seq = self.segments[idx].seq;
            if less(succ_seq, seq.wrapping_add(len)) {
                let new_len = succ_seq.wrapping_sub(seq);
                payload.truncate(new_len as usize);
                len = new_len;
                flags.fin = false; // FIN can't land inside data we no longer own.
            }
        }

        // Step 5: clip further by RcvFree.
        if len > rcv_free {
            payload.truncate(rcv_free as usize);
            len = rcv_free;
        }

        if len == 0 && !flags.fin {
            pool.release(payload);
            return InsertReport {
                inserted: false,
                urgent_raised: false,
            };
        }

        let mut urgent_raised = false;

        // Urgent-byte split: up to three sub-segments.
        if flags.urg {
            if let Some(off) = urgent_offset {
                if off < payload.len() {
                    urgent_raised = true;
                    let tail = payload.split_off(off + 1);
                    let urgent_byte = payload.pop(); // last byte of the first half is the urgent byte
                    let head_len = payload.len() as u32;

                    if head_len > 0 {
                        self.segments.insert(
                            idx,
                            ReceivedSegment {
                                seq,
                                len: head_len,
                                next_seq: seq.wrapping_add(head_len),
                                flags: SegFlags::default(),
                                payload,
                            },
                        );
                    }
                    let urg_seq = seq.wrapping_add(head_len);
                    let urg_payload = if inline_urgent {
                        urgent_byte.into_iter().collect::<Vec<u8>>()
                    } else {
                        Vec::new()
                    };
                    let urg_len = if inline_urgent { 1 } else { 0 };
                    let mut insert_at = idx + if head_len > 0 { 1 } else { 0 };
                    self.segments.insert(
                        insert_at,
                        ReceivedSegment {
                            seq: urg_seq,
                            len: urg_len,
                            next_seq: urg_seq.wrapping_add(1),
                            flags: SegFlags {
                                urg: true,
                                ..SegFlags::default()
                            },
                            payload: urg_payload,
                        },
                    );
                    insert_at += 1;

                    let tail_len = tail.len() as u32;
                    if tail_len > 0 || flags.fin {
                        let tail_seq = urg_seq.wrapping_add(1);
                        self.segments.insert(
                            insert_at,
                            ReceivedSegment {
                                seq: tail_seq,
                                len: tail_len,
                                next_seq: tail_seq
                                    .wrapping_add(tail_len)
                                    .wrapping_add(if flags.fin { 1 } else { 0 }),
                                flags: SegFlags {
                                    fin: flags.fin,
                                    psh: flags.psh,
                                    ..SegFlags::default()
                                },
                                payload: tail,
                            },
                        );
                    }

                    return InsertReport {
                        inserted: true,
                        urgent_raised,
                    };
                }
            }
        }

        // Step 6: plain insert.
        self.segments.insert(
            idx,
            ReceivedSegment {
                seq,
                len,
                next_seq: seq.wrapping_add(len).wrapping_add(if flags.fin { 1 } else { 0 }),
                flags,
                payload,
            },
        );

        InsertReport {
            inserted: true,
            urgent_raised,
        }
    }

    /// Advance `rcv_nxt` over any newly contiguous prefix, appending accepted
    /// bytes to `readable` in order and releasing drained segment buffers
    /// back to `pool`. Stops at the first urgent-flagged segment so a reader
    /// never crosses an urgent boundary within one contiguous pull; the
    /// caller re-invokes once the urgent marker itself has been consumed.
    /// Returns `(bytes accepted, fin consumed)`.
    pub fn advance_contiguous(
        &mut self,
        rcv_nxt: &mut u32,
        pool: &mut SegmentPool,
        readable: &mut std::collections::VecDeque<u8>,
    ) -> (u32, bool) {
        let mut accepted = 0u32;
        let mut fin_consumed = false;

        while let Some(front) = self.segments.first() {
            if front.seq != *rcv_nxt {
                break;
            }
            if front.flags.urg && !readable.is_empty() {
                // Don't merge an urgent marker into bytes already queued for
                // this read; let the caller drain what it has first.
                break;
            }

            let front = self.segments.remove(0);
            accepted = accepted.wrapping_add(front.len);
            *rcv_nxt = front.next_seq;
            fin_consumed |= front.flags.fin;
            readable.extend(front.payload.iter().copied());
            pool.release(front.payload);

            if front.flags.urg {
                break;
            }
        }

        self.missing_data = !self.segments.is_empty()
            && self
                .segments
                .first()
                .map(|s| greater(s.seq, *rcv_nxt))
                .unwrap_or(false);

        (accepted, fin_consumed)
    }
}

/// True when free receive-buffer space crosses the MSS threshold from below,
/// the trigger for an unsolicited window-update ACK (spec S4.7 Receive).
pub fn window_cross_into_mss(before_free: u32, after_free: u32, mss: u32) -> bool {
    before_free < mss && after_free >= mss
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SegmentPool {
        SegmentPool::new(536, 536, 16)
    }

    #[test]
    fn plain_insert_and_advance() {
        let mut q = ReassemblyQueue::new();
        let mut p = pool();
        let mut readable = std::collections::VecDeque::new();
        q.insert(&mut p, 100, 1000, 100, vec![1, 2, 3], SegFlags::default(), None, false);
        let mut nxt = 100u32;
        let (accepted, _) = q.advance_contiguous(&mut nxt, &mut p, &mut readable);
        assert_eq!(accepted, 3);
        assert_eq!(nxt, 103);
        assert!(q.is_empty());
        assert_eq!(readable.len(), 3);
    }

    #[test]
    fn out_of_order_then_fill_hole() {
        let mut q = ReassemblyQueue::new();
        let mut p = pool();
        let mut readable = std::collections::VecDeque::new();
        // second segment arrives first
        q.insert(&mut p, 100, 1000, 106, vec![4, 5, 6], SegFlags::default(), None, false);
        let mut nxt = 100u32;
        assert_eq!(q.advance_contiguous(&mut nxt, &mut p, &mut readable).0, 0);
        assert_eq!(nxt, 100);
        assert!(q.missing_data);

        q.insert(&mut p, 100, 1000, 100, vec![1, 2, 3], SegFlags::default(), None, false);
        assert_eq!(q.advance_contiguous(&mut nxt, &mut p, &mut readable).0, 6);
        assert_eq!(nxt, 106);
        assert_eq!(readable.len(), 6);
    }

    #[test]
    fn discards_fully_old_segment() {
        let mut q = ReassemblyQueue::new();
        let mut p = pool();
        let report = q.insert(&mut p, 200, 1000, 100, vec![1, 2, 3], SegFlags::default(), None, false);
        assert!(!report.inserted);
        assert!(q.is_empty());
    }

    #[test]
    fn clips_against_predecessor_overlap() {
        let mut q = ReassemblyQueue::new();
        let mut p = pool();
        let mut readable = std::collections::VecDeque::new();
        q.insert(&mut p, 100, 1000, 100, vec![1, 2, 3, 4], SegFlags::default(), None, false);
        // overlaps first two bytes of the existing segment's tail region
        q.insert(&mut p, 100, 1000, 102, vec![9, 9, 9], SegFlags::default(), None, false);
        let mut nxt = 100u32;
        let (accepted, _) = q.advance_contiguous(&mut nxt, &mut p, &mut readable);
        assert_eq!(accepted, 5); // 4 original + 1 clipped tail byte from the new segment
    }

    #[test]
    fn urgent_split_produces_up_to_three_parts() {
        let mut q = ReassemblyQueue::new();
        let mut p = pool();
        let flags = SegFlags {
            urg: true,
            ..SegFlags::default()
        };
        // urgent byte at offset 2 within a 5-byte payload
        q.insert(&mut p, 100, 1000, 100, vec![1, 2, 3, 4, 5], flags, Some(2), true);
        assert_eq!(q.segments.len(), 3);
        assert_eq!(q.segments[0].seq, 100);
        assert_eq!(q.segments[0].len, 2);
        assert!(q.segments[1].flags.urg);
        assert_eq!(q.segments[1].len, 1);
        assert_eq!(q.segments[2].len, 2);
    }
}

//! Per-connection segment buffer freelist (spec S4.2).
//!
//! Sized to the larger of the receive and send MSS so any released buffer can
//! serve either role later. Free insertion is LIFO for cache locality, as the
//! spec calls out explicitly.

#[derive(Debug, Clone)]
pub struct SegmentPool {
    slot_size: usize,
    free: Vec<Vec<u8>>,
    /// Soft cap: the pool must not grow past what send+receive windows could
    /// simultaneously require.
    max_slots: usize,
}

impl SegmentPool {
    pub fn new(recv_mss: u16, send_mss: u16, max_slots: usize) -> Self {
        SegmentPool {
            slot_size: recv_mss.max(send_mss) as usize,
            free: Vec::new(),
            max_slots,
        }
    }

    /// Grow the slot size (e.g. after an MSS re-negotiation); existing free
    /// buffers below the new size are dropped rather than resized in place.
    pub fn resize_slots(&mut self, recv_mss: u16, send_mss: u16) {
        let new_size = recv_mss.max(send_mss) as usize;
        if new_size != self.slot_size {
            self.slot_size = new_size;
            self.free.retain(|b| b.capacity() >= new_size);
        }
    }

    pub fn take(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.slot_size),
        }
    }

    pub fn release(&mut self, mut buf: Vec<u8>) {
        if self.free.len() >= self.max_slots {
            return;
        }
        buf.clear();
        self.free.push(buf);
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffers_lifo() {
        let mut pool = SegmentPool::new(536, 536, 4);
        let a = pool.take();
        let b = pool.take();
        pool.release(a);
        pool.release(b);

        // LIFO: the most recently released buffer comes back first.
        let first = pool.take();
        assert_eq!(first.len(), 0);
        assert!(first.capacity() >= 536);
    }

    #[test]
    fn respects_max_slots() {
        let mut pool = SegmentPool::new(536, 536, 1);
        pool.release(Vec::new());
        pool.release(Vec::new());
        assert_eq!(pool.free.len(), 1);
    }
}

//! Outbound packet coalescing.
//!
//! Frames the engine emits are appended here on the packets context and
//! handed to the upper layer as one batch per flush. A flush happens when the
//! byte or packet threshold is crossed, when the scheduled deadline fires, or
//! on an explicit trigger. Packets are never dropped, only delayed; the
//! engine's own send buffers bound production.

use smallvec::SmallVec;

/// One flushed batch: packets and their address families, index-aligned.
#[derive(Debug, Default)]
pub struct OutboundBatch {
    pub packets: Vec<Vec<u8>>,
    pub families: Vec<i32>,
}

impl OutboundBatch {
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.packets.iter().map(Vec::len).sum()
    }
}

pub(crate) struct PacketBatcher {
    pending: SmallVec<[(Vec<u8>, i32); 16]>,
    pending_bytes: usize,
    max_bytes: usize,
    max_packets: usize,
    /// A deadline flush is already queued on the packets context.
    pub(crate) flush_scheduled: bool,
}

impl PacketBatcher {
    pub(crate) fn new(max_bytes: usize, max_packets: usize) -> Self {
        Self {
            pending: SmallVec::new(),
            pending_bytes: 0,
            max_bytes: max_bytes.max(1),
            max_packets: max_packets.max(1),
            flush_scheduled: false,
        }
    }

    /// Append a frame. Returns `true` once a threshold is crossed and the
    /// pending batch should flush without waiting for the deadline.
    pub(crate) fn enqueue(&mut self, frame: Vec<u8>) -> bool {
        let family = family_of(&frame);
        self.pending_bytes += frame.len();
        self.pending.push((frame, family));
        self.pending_bytes >= self.max_bytes || self.pending.len() >= self.max_packets
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn pending_packets(&self) -> usize {
        self.pending.len()
    }

    /// Swap the pending list out, preserving FIFO order, and reset counters.
    pub(crate) fn take(&mut self) -> OutboundBatch {
        let drained = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        self.flush_scheduled = false;
        let mut batch = OutboundBatch {
            packets: Vec::with_capacity(drained.len()),
            families: Vec::with_capacity(drained.len()),
        };
        for (packet, family) in drained {
            batch.packets.push(packet);
            batch.families.push(family);
        }
        batch
    }
}

/// Address family tag for an emitted frame: `AF_INET6` for a version-6
/// nibble, `AF_INET` otherwise. Kept for the future v6 path.
pub(crate) fn family_of(frame: &[u8]) -> i32 {
    if frame.first().map(|byte| byte >> 4 == 6).unwrap_or(false) {
        libc::AF_INET6
    } else {
        libc::AF_INET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_preserves_fifo_and_resets() {
        let mut batcher = PacketBatcher::new(64 * 1024, 64);
        for tag in 0u8..5 {
            assert!(!batcher.enqueue(vec![0x45, tag]));
        }
        let batch = batcher.take();
        assert_eq!(batch.packets.len(), 5);
        assert_eq!(batch.families, vec![libc::AF_INET; 5]);
        for (index, packet) in batch.packets.iter().enumerate() {
            assert_eq!(packet[1], index as u8);
        }
        assert!(batcher.is_empty());
        assert_eq!(batcher.pending_packets(), 0);
        assert!(batcher.take().is_empty());
    }

    #[test]
    fn byte_threshold_requests_flush() {
        let mut batcher = PacketBatcher::new(1024, 64);
        assert!(!batcher.enqueue(vec![0x45; 512]));
        assert!(batcher.enqueue(vec![0x45; 512]));
        assert_eq!(batcher.take().total_bytes(), 1024);
    }

    #[test]
    fn packet_threshold_requests_flush() {
        let mut batcher = PacketBatcher::new(64 * 1024, 3);
        assert!(!batcher.enqueue(vec![0x45, 0]));
        assert!(!batcher.enqueue(vec![0x45, 1]));
        assert!(batcher.enqueue(vec![0x45, 2]));
    }

    #[test]
    fn families_follow_version_nibble() {
        let mut batcher = PacketBatcher::new(64 * 1024, 64);
        batcher.enqueue(vec![0x45, 0]);
        batcher.enqueue(vec![0x60, 0]);
        let batch = batcher.take();
        assert_eq!(batch.families, vec![libc::AF_INET, libc::AF_INET6]);
    }
}

//! Virtual interface plumbing between the stack facade and the engine: an
//! inbound ring the facade fills and an outbound ring the engine's transmit
//! tokens fill. Both rings live behind one lock so the device stays `Clone`
//! and cheap to hand to the engine.

use parking_lot::Mutex;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) const MIN_MTU: usize = 576;

struct SharedRing {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    capacity: usize,
}

#[derive(Clone)]
pub(crate) struct TunDevice {
    inner: Arc<Mutex<SharedRing>>,
    mtu: usize,
}

impl TunDevice {
    pub(crate) fn new(mtu: usize, ring_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedRing {
                inbound: VecDeque::with_capacity(ring_capacity.max(16)),
                outbound: VecDeque::new(),
                capacity: ring_capacity.max(16),
            })),
            mtu: mtu.max(MIN_MTU),
        }
    }

    pub(crate) fn mtu(&self) -> usize {
        self.mtu
    }

    /// Queue one inbound packet for the engine. Returns `false` when the
    /// ring is full and the packet was dropped; the caller surfaces that.
    pub(crate) fn push_inbound(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return true;
        }
        let mut guard = self.inner.lock();
        if guard.inbound.len() >= guard.capacity {
            return false;
        }
        let capped = packet.len().min(self.mtu);
        guard.inbound.push_back(packet[..capped].to_vec());
        true
    }

    /// Drain every frame the engine emitted since the last call, in emission
    /// order.
    pub(crate) fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        guard.outbound.drain(..).collect()
    }

    pub(crate) fn inbound_len(&self) -> usize {
        self.inner.lock().inbound.len()
    }
}

impl Device for TunDevice {
    type RxToken<'a>
        = TunRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TunTxToken
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut guard = self.inner.lock();
        guard.inbound.pop_front().map(|packet| {
            let rx = TunRxToken { buffer: packet };
            let tx = TunTxToken {
                inner: Arc::clone(&self.inner),
                mtu: self.mtu,
            };
            (rx, tx)
        })
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TunTxToken {
            inner: Arc::clone(&self.inner),
            mtu: self.mtu,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

pub(crate) struct TunRxToken {
    buffer: Vec<u8>,
}

pub(crate) struct TunTxToken {
    inner: Arc<Mutex<SharedRing>>,
    mtu: usize,
}

impl RxToken for TunRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.buffer;
        f(&mut buffer)
    }
}

impl TxToken for TunTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len.min(self.mtu)];
        let result = f(&mut frame);
        // Outbound is drained on every engine turn; no eviction here, the
        // batcher owns pacing.
        self.inner.lock().outbound.push_back(frame);
        result
    }
}

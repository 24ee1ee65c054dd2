//! Per-turn engine servicing: polls the engine, walks every flow for
//! deliveries, sent/writable edges, EOF, and termination, and moves emitted
//! frames into the batcher.

use super::{AcceptPhase, StackCore};
use crate::conn::{ConnectionState, TcpConnection, TerminationReason};
use crate::error::{WriteResult, WriteStatus};
use crate::logger::{self, BreadcrumbFlags};
use smallvec::SmallVec;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::{Socket as TcpSocket, State};
use smoltcp::time::Instant;
use smoltcp::wire::{IpAddress, Ipv4Address};
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl StackCore {
    fn now(&self) -> Instant {
        Instant::from_millis(self.epoch.elapsed().as_millis().min(i64::MAX as u128) as i64)
    }

    /// One engine turn: poll, service every flow, batch whatever the engine
    /// emitted, recycle drained sockets. Safe to call repeatedly within a
    /// packets job.
    pub(crate) fn pump(&mut self) {
        let now = self.now();
        let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
        self.service_flows();
        self.collect_outbound();
        self.reap_draining();
    }

    fn service_flows(&mut self) {
        let handles: SmallVec<[SocketHandle; 32]> = self.flows.keys().copied().collect();
        for handle in handles {
            self.service_flow(handle);
        }
    }

    fn service_flow(&mut self, handle: SocketHandle) {
        let mut terminate_with: Option<TerminationReason> = None;
        {
            let Some(entry) = self.flows.get_mut(&handle) else {
                return;
            };
            let conn = Arc::clone(&entry.conn);
            if conn.terminated.load(Ordering::Acquire) {
                return;
            }
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            let state = socket.state();

            // Handshake complete: ask the upper layer for a verdict, once.
            if entry.phase == AcceptPhase::Handshake && state == State::Established {
                // The engine must have completed the handshake for the tuple
                // this flow was intercepted with; a stale listener claiming a
                // different peer is torn down instead of surfaced.
                let expected_peer = IpAddress::Ipv4(Ipv4Address::from_bytes(
                    &entry.key.src_ip.octets(),
                ));
                let tuple_matches = socket.remote_endpoint().is_some_and(|remote| {
                    remote.addr == expected_peer && remote.port == entry.key.src_port
                });
                if tuple_matches {
                    entry.phase = AcceptPhase::Asked;
                    self.effects.accept_asks.push(Arc::clone(&conn));
                } else {
                    logger::warn(format!(
                        "flow {} established with an unexpected peer; resetting",
                        conn.info()
                    ));
                    entry.local_abort = true;
                    socket.abort();
                }
            }

            if entry.phase == AcceptPhase::Accepted {
                // Inbound delivery, gated and one batch in flight at a time.
                if !entry.gate_open {
                    if socket.recv_queue() > 0 {
                        entry.gate_pending = true;
                    }
                } else if !entry.pending_delivery && socket.can_recv() {
                    entry.gate_pending = false;
                    if conn.has_readable_bytes_handler() {
                        let queued = socket.recv_queue();
                        if let Ok(chunk) = socket.peek(queued) {
                            if !chunk.is_empty() {
                                let copy = chunk.to_vec();
                                entry.pending_delivery = true;
                                self.effects
                                    .readable_batches
                                    .push((Arc::clone(&conn), copy));
                            }
                        }
                    } else if conn.has_readable_handler() {
                        // Compatibility path: contiguous copy, window
                        // credited here on the caller's behalf.
                        let mut data = Vec::with_capacity(socket.recv_queue());
                        while socket.can_recv() {
                            let result = socket.recv(|buffer| {
                                data.extend_from_slice(buffer);
                                (buffer.len(), ())
                            });
                            if result.is_err() {
                                break;
                            }
                        }
                        if !data.is_empty() {
                            self.effects.readable_copies.push((Arc::clone(&conn), data));
                        }
                    }
                    // Neither handler installed: bytes stay queued and the
                    // closing window is the backpressure.
                }

                // Peer FIN drained through: read EOF, once. Does not
                // terminate; the local side still owns its close.
                let peer_closed = matches!(
                    state,
                    State::CloseWait | State::Closing | State::LastAck | State::TimeWait
                );
                if peer_closed
                    && entry.gate_open
                    && !entry.pending_delivery
                    && !socket.can_recv()
                    && !entry.eof_fired
                {
                    entry.eof_fired = true;
                    self.effects.read_eofs.push(Arc::clone(&conn));
                }

                // Peer ACKs show up as a shrinking send queue.
                let send_queue = socket.send_queue();
                let acked = entry.last_send_queue.saturating_sub(send_queue);
                if acked > 0 {
                    self.effects.sent.push((Arc::clone(&conn), acked));
                }
                entry.last_send_queue = send_queue;

                // Writability edges: false on a full buffer, true on an
                // empty one or on fresh ACKs with an MSS of headroom.
                let free = socket.send_capacity().saturating_sub(send_queue);
                let current = conn.writable.load(Ordering::Acquire);
                let target = if !socket.may_send() {
                    current
                } else if free == 0 {
                    false
                } else if send_queue == 0 {
                    true
                } else if acked > 0 && free >= self.config.mss {
                    true
                } else {
                    current
                };
                if target != current {
                    conn.writable.store(target, Ordering::Release);
                    self.effects.writable_edges.push((Arc::clone(&conn), target));
                }
            }

            // Termination: all five paths converge here or in `terminate`.
            terminate_with = match state {
                State::Closed => Some(if entry.rst_seen || entry.local_abort {
                    TerminationReason::Reset
                } else if entry.local_fin {
                    TerminationReason::Close
                } else {
                    // The engine gave up (error, timeout) without a close or
                    // reset in flight.
                    TerminationReason::Abort
                }),
                State::TimeWait if entry.local_fin => Some(TerminationReason::Close),
                _ => None,
            };
        }
        if let Some(reason) = terminate_with {
            self.terminate(handle, reason);
        }
    }

    /// Exactly-once terminal transition. Whichever path reaches the latch
    /// first wins; the packets context serializes contenders.
    pub(crate) fn terminate(&mut self, handle: SocketHandle, reason: TerminationReason) {
        let Some(entry) = self.flows.get(&handle) else {
            return;
        };
        let conn = Arc::clone(&entry.conn);
        if conn.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        conn.set_reason(reason);
        conn.set_state(ConnectionState::Terminated);
        conn.writable.store(false, Ordering::Release);
        // Handle goes dead before the engine releases its retains.
        conn.handle_ref().invalidate();
        self.registry.destroy(handle);
        let entry = self.flows.remove(&handle).expect("live flow entry");
        self.by_key.remove(&entry.key);
        self.draining.push(handle);
        self.effects.terminated.push((conn, reason));
        logger::breadcrumb(
            BreadcrumbFlags::CONN,
            format!("{} detached ({reason:?})", entry.conn.info()),
        );
    }

    /// Return sockets whose engine state has fully closed to the pool.
    fn reap_draining(&mut self) {
        let mut index = 0;
        while index < self.draining.len() {
            let handle = self.draining[index];
            if self.sockets.get::<TcpSocket>(handle).state() == State::Closed {
                self.draining.swap_remove(index);
                self.pool.push(handle);
            } else {
                index += 1;
            }
        }
    }

    fn collect_outbound(&mut self) {
        let frames = self.device.drain_outbound();
        let mut threshold_hit = false;
        for frame in frames {
            eprintln!("DEBUG tx frame len={}", frame.len());
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += frame.len() as u64;
            threshold_hit |= self.batcher.enqueue(frame);
        }
        if self.batcher.is_empty() {
            return;
        }
        if threshold_hit || self.config.flush_interval.is_zero() {
            self.flush_batcher_now();
        } else if !self.batcher.flush_scheduled {
            self.batcher.flush_scheduled = true;
            self.effects.schedule_flush = Some(self.config.flush_interval);
        }
    }

    pub(crate) fn flush_batcher_now(&mut self) {
        let batch = self.batcher.take();
        if batch.is_empty() {
            return;
        }
        self.stats.batches_flushed += 1;
        logger::breadcrumb(
            BreadcrumbFlags::BATCH,
            format!(
                "flushing {} packets / {} bytes",
                batch.packets.len(),
                batch.total_bytes()
            ),
        );
        match &mut self.effects.outbound {
            Some(pending) => {
                pending.packets.extend(batch.packets);
                pending.families.extend(batch.families);
            }
            None => self.effects.outbound = Some(batch),
        }
    }

    /// Deadline flush job and `trigger_flush` entry.
    pub(crate) fn flush_batcher(&mut self) {
        self.batcher.flush_scheduled = false;
        if !self.batcher.is_empty() {
            self.flush_batcher_now();
        }
    }

    fn entry_for<'a>(
        flows: &'a mut rustc_hash::FxHashMap<SocketHandle, super::FlowEntry>,
        conn: &Arc<TcpConnection>,
    ) -> Option<&'a mut super::FlowEntry> {
        // Guard against socket-handle reuse: the entry must still belong to
        // this connection object.
        flows
            .get_mut(&conn.socket)
            .filter(|entry| Arc::ptr_eq(&entry.conn, conn))
    }

    pub(crate) fn mark_active(&mut self, conn: &Arc<TcpConnection>) {
        if conn.terminated.load(Ordering::Acquire) {
            return;
        }
        let Some(entry) = Self::entry_for(&mut self.flows, conn) else {
            return;
        };
        if entry.phase == AcceptPhase::Accepted {
            return;
        }
        entry.phase = AcceptPhase::Accepted;
        conn.set_state(ConnectionState::Active);
        self.stats.connections_accepted += 1;
        self.effects.activated.push(Arc::clone(conn));
        self.pump();
    }

    pub(crate) fn set_inbound_delivery(&mut self, conn: &Arc<TcpConnection>, enabled: bool) {
        let Some(entry) = Self::entry_for(&mut self.flows, conn) else {
            return;
        };
        if entry.gate_open == enabled {
            return;
        }
        entry.gate_open = enabled;
        logger::breadcrumb(
            BreadcrumbFlags::CONN,
            format!(
                "{} inbound delivery {}",
                conn.info(),
                if enabled { "enabled" } else { "disabled" }
            ),
        );
        if enabled {
            // Pending bytes deliver before anything newly arriving.
            self.pump();
        }
    }

    /// Balance one delivered batch: dequeue `total` bytes from the engine's
    /// receive buffer, which advances the window, then look for more work.
    pub(crate) fn credit_receive(&mut self, conn: &Arc<TcpConnection>, total: usize) {
        let Some(entry) = Self::entry_for(&mut self.flows, conn) else {
            return;
        };
        entry.pending_delivery = false;
        let socket = self.sockets.get_mut::<TcpSocket>(conn.socket);
        let mut remaining = total;
        while remaining > 0 {
            match socket.recv(|buffer| {
                let take = remaining.min(buffer.len());
                (take, take)
            }) {
                Ok(0) | Err(_) => break,
                Ok(taken) => remaining -= taken,
            }
        }
        self.pump();
    }

    pub(crate) fn write(&mut self, conn: &Arc<TcpConnection>, bytes: &[u8]) -> WriteResult {
        match conn.state() {
            ConnectionState::Idle => return WriteResult::status(WriteStatus::Error),
            ConnectionState::Terminated => return WriteResult::status(WriteStatus::Closed),
            ConnectionState::Active | ConnectionState::Closing => {}
        }
        let outcome = {
            let Some(entry) = Self::entry_for(&mut self.flows, conn) else {
                return WriteResult::status(WriteStatus::Closed);
            };
            let socket = self.sockets.get_mut::<TcpSocket>(conn.socket);
            if !socket.may_send() {
                return WriteResult::status(WriteStatus::Closed);
            }
            let free = socket.send_capacity().saturating_sub(socket.send_queue());
            if free < bytes.len() {
                if conn.writable.swap(false, Ordering::AcqRel) {
                    self.effects.writable_edges.push((Arc::clone(conn), false));
                }
                return WriteResult::status(WriteStatus::WouldBlock);
            }
            match socket.send_slice(bytes) {
                Ok(written) => {
                    entry.last_send_queue = socket.send_queue();
                    Some(written)
                }
                Err(_) => None,
            }
        };
        match outcome {
            Some(written) => {
                // Explicit output flush, coalesced with this packets turn.
                self.pump();
                WriteResult::ok(written)
            }
            None => WriteResult::status(WriteStatus::Closed),
        }
    }

    /// Half-close: shut down the send side only.
    pub(crate) fn shutdown_write(&mut self, conn: &Arc<TcpConnection>) {
        if conn.terminated.load(Ordering::Acquire) {
            return;
        }
        let Some(entry) = Self::entry_for(&mut self.flows, conn) else {
            return;
        };
        if entry.local_fin {
            return;
        }
        entry.local_fin = true;
        self.sockets.get_mut::<TcpSocket>(conn.socket).close();
        conn.set_state(ConnectionState::Closing);
        logger::breadcrumb(BreadcrumbFlags::CONN, format!("{} shutdown write", conn.info()));
        self.pump();
    }

    /// Full close: FIN now, engine finishes the exchange; a watchdog aborts
    /// the flow if it is still closing after the configured timeout.
    pub(crate) fn graceful_close(&mut self, conn: &Arc<TcpConnection>) {
        if conn.terminated.load(Ordering::Acquire) {
            return;
        }
        let timeout = self.config.graceful_close_timeout;
        let Some(entry) = Self::entry_for(&mut self.flows, conn) else {
            return;
        };
        if entry.local_detached {
            return;
        }
        entry.local_detached = true;
        if !entry.local_fin {
            entry.local_fin = true;
            self.sockets.get_mut::<TcpSocket>(conn.socket).close();
        }
        conn.set_state(ConnectionState::Closing);
        self.effects.close_timers.push((Arc::clone(conn), timeout));
        logger::breadcrumb(BreadcrumbFlags::CONN, format!("{} graceful close", conn.info()));
        self.pump();
    }

    /// Immediate RST and terminal transition.
    pub(crate) fn abort_flow(&mut self, conn: &Arc<TcpConnection>) {
        if conn.terminated.load(Ordering::Acquire) {
            return;
        }
        let rejected = {
            let Some(entry) = Self::entry_for(&mut self.flows, conn) else {
                return;
            };
            entry.local_abort = true;
            entry.phase != AcceptPhase::Accepted
        };
        if rejected {
            self.stats.connections_rejected += 1;
        }
        self.sockets.get_mut::<TcpSocket>(conn.socket).abort();
        self.terminate(conn.socket, TerminationReason::Reset);
        // Let the RST frame out through the batcher.
        self.pump();
    }

    /// Graceful-close watchdog body.
    pub(crate) fn abort_if_still_closing(&mut self, conn: &Arc<TcpConnection>) {
        if conn.terminated.load(Ordering::Acquire) {
            return;
        }
        if Self::entry_for(&mut self.flows, conn).is_none() {
            return;
        }
        logger::warn(format!(
            "graceful close timed out for {}; aborting",
            conn.info()
        ));
        self.abort_flow(conn);
    }
}

//! Stack bridge: installs the virtual interface inside the engine, captures
//! every inbound SYN, and routes engine output through the packet batcher.
//!
//! All engine state lives in `StackCore`, which is only ever touched on the
//! packets context. Upper-layer callbacks collected during a core turn are
//! dispatched to the connections context after the core lock is released.

mod interface;
mod service;

use crate::batcher::{OutboundBatch, PacketBatcher};
use crate::config::StackConfig;
use crate::conn::{AcceptDecision, ConnectionInfo, TcpConnection, TerminationReason};
use crate::device::TunDevice;
use crate::error::StackError;
use crate::handle::{ObjectRef, StackRef};
use crate::logger::{self, BreadcrumbFlags};
use crate::parse::{self, ParsedPacket, TcpSegment};
use crate::registry::ExtArgRegistry;
use crate::scheduler::Scheduler;
use crate::stats::StackStats;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::Socket as TcpSocket;
use smoltcp::wire::{IpAddress, IpListenEndpoint, Ipv4Address};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant as StdInstant};

/// Upper-layer accept hook. The decision MUST be resolved exactly once;
/// `AcceptDecision` enforces that by consumption.
pub trait StackDelegate: Send + Sync {
    fn did_accept_tcp_connection(&self, conn: Arc<TcpConnection>, decision: AcceptDecision);
}

/// Outbound batch consumer: packets and address families, index-aligned.
pub type OutboundHandler = dyn Fn(Vec<Vec<u8>>, Vec<i32>) + Send + Sync;

static SHARED: OnceCell<Arc<IpStack>> = OnceCell::new();
// The engine treats interface and PCB pools as process-global; refuse a
// second concurrently running stack.
static ACTIVE_STACK: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
}

pub struct IpStack {
    core: Arc<Mutex<StackCore>>,
    config: StackConfig,
    run_state: Mutex<RunState>,
    delegate: Mutex<Option<Arc<dyn StackDelegate>>>,
    outbound: Mutex<Option<Arc<OutboundHandler>>>,
    torn_down: AtomicBool,
}

impl IpStack {
    /// Process-wide default instance.
    pub fn shared() -> Arc<IpStack> {
        SHARED
            .get_or_init(|| {
                IpStack::new(StackConfig::default()).expect("default config is valid")
            })
            .clone()
    }

    /// Returns the shared instance, applying `config` only on first call; a
    /// later config is ignored once the singleton exists.
    pub fn shared_with_config(config: StackConfig) -> Result<Arc<IpStack>, StackError> {
        if let Some(existing) = SHARED.get() {
            return Ok(existing.clone());
        }
        config.validate()?;
        Ok(SHARED
            .get_or_init(move || IpStack::new(config).expect("config validated"))
            .clone())
    }

    pub fn new(config: StackConfig) -> Result<Arc<IpStack>, StackError> {
        config.validate()?;
        let core = Arc::new(Mutex::new(StackCore::new(config.clone())?));
        {
            let mut guard = core.lock();
            guard.core_weak = Arc::downgrade(&core);
        }
        let stack = Arc::new(IpStack {
            core: Arc::clone(&core),
            config,
            run_state: Mutex::new(RunState::Stopped),
            delegate: Mutex::new(None),
            outbound: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });
        core.lock().stack_ref = Some(ObjectRef::new(&stack));
        Ok(stack)
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn StackDelegate>>) {
        *self.delegate.lock() = delegate;
    }

    pub(crate) fn delegate(&self) -> Option<Arc<dyn StackDelegate>> {
        self.delegate.lock().clone()
    }

    pub fn set_outbound_handler(
        &self,
        handler: impl Fn(Vec<Vec<u8>>, Vec<i32>) + Send + Sync + 'static,
    ) {
        *self.outbound.lock() = Some(Arc::new(handler));
    }

    pub(crate) fn outbound_handler(&self) -> Option<Arc<OutboundHandler>> {
        self.outbound.lock().clone()
    }

    /// Arm the engine tick and enable the intercept hook. Idempotent; fails
    /// with `AlreadyRunning` when a different stack holds the engine.
    pub fn start(self: &Arc<Self>) -> Result<(), StackError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(StackError::Config("stack has been torn down".into()));
        }
        {
            let mut state = self.run_state.lock();
            if *state == RunState::Running {
                return Ok(());
            }
            if ACTIVE_STACK.swap(true, Ordering::SeqCst) {
                return Err(StackError::AlreadyRunning);
            }
            *state = RunState::Running;
        }
        let core = Arc::clone(&self.core);
        Scheduler::shared().packets().perform_async({
            let core = Arc::clone(&core);
            move || {
                with_core(&core, |core| {
                    core.running = true;
                    core.intercept_enabled = true;
                });
            }
        });
        Scheduler::shared().start_timer(
            self.config.timer_interval,
            Arc::new(move || {
                with_core(&core, |core| {
                    if core.running {
                        core.pump();
                    }
                });
            }),
        );
        logger::breadcrumb(BreadcrumbFlags::STACK, "stack started");
        Ok(())
    }

    /// Disarm the tick and disable intercept. Idempotent. In-flight
    /// callbacks may still run until the contexts drain.
    pub fn stop(&self) {
        {
            let mut state = self.run_state.lock();
            if *state == RunState::Stopped {
                return;
            }
            *state = RunState::Stopped;
        }
        Scheduler::shared().stop_timer();
        let core = Arc::clone(&self.core);
        Scheduler::shared().packets().perform_async(move || {
            with_core(&core, |core| {
                core.running = false;
                core.intercept_enabled = false;
            });
        });
        ACTIVE_STACK.store(false, Ordering::SeqCst);
        logger::breadcrumb(BreadcrumbFlags::STACK, "stack stopped");
    }

    /// Stop and destroy every flow. The stack cannot be started again.
    pub fn teardown(&self) {
        self.stop();
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = Arc::clone(&self.core);
        Scheduler::shared()
            .packets()
            .perform_async(move || with_core(&core, |core| core.teardown()));
    }

    pub fn is_running(&self) -> bool {
        *self.run_state.lock() == RunState::Running
    }

    pub fn is_ready(&self) -> bool {
        !self.torn_down.load(Ordering::Acquire)
    }

    /// Inject one raw IP packet. Safe from any context; processing hops to
    /// the packets context. Packets received while stopped are dropped and
    /// counted.
    pub fn input_packet(&self, packet: &[u8]) {
        let owned = packet.to_vec();
        let core = Arc::clone(&self.core);
        Scheduler::shared()
            .packets()
            .perform_async(move || with_core(&core, |core| core.input(owned)));
    }

    /// Flush the pending outbound batch now (diagnostics, tests).
    pub fn trigger_flush(&self) {
        let core = Arc::clone(&self.core);
        Scheduler::shared()
            .packets()
            .perform_async(move || with_core(&core, |core| core.flush_batcher()));
    }

    pub fn stats(&self) -> StackStats {
        let core = Arc::clone(&self.core);
        Scheduler::shared()
            .packets()
            .perform_sync(move || with_core(&core, |core| core.snapshot_stats()))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct FlowKey {
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
}

impl FlowKey {
    fn from_segment(segment: &TcpSegment<'_>) -> Self {
        Self {
            src_ip: segment.src,
            src_port: segment.src_port,
            dst_ip: segment.dst,
            dst_port: segment.dst_port,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AcceptPhase {
    /// SYN intercepted, handshake still running.
    Handshake,
    /// ESTABLISHED reported; the delegate holds the verdict.
    Asked,
    /// Activated by the upper layer.
    Accepted,
}

pub(crate) struct FlowEntry {
    pub(crate) key: FlowKey,
    pub(crate) conn: Arc<TcpConnection>,
    pub(crate) phase: AcceptPhase,
    pub(crate) gate_open: bool,
    /// Bytes arrived while the gate was closed; retry delivery on reopen.
    pub(crate) gate_pending: bool,
    /// A delivered batch is awaiting its completion credit.
    pub(crate) pending_delivery: bool,
    pub(crate) rst_seen: bool,
    pub(crate) local_fin: bool,
    pub(crate) local_detached: bool,
    pub(crate) local_abort: bool,
    pub(crate) eof_fired: bool,
    pub(crate) last_send_queue: usize,
}

/// Upper-layer work collected during one core turn, executed after the core
/// lock is released. Keeps callbacks off the lock and preserves per-flow
/// ordering: activation first, termination last.
#[derive(Default)]
pub(crate) struct Effects {
    outbound: Option<OutboundBatch>,
    schedule_flush: Option<Duration>,
    close_timers: Vec<(Arc<TcpConnection>, Duration)>,
    activated: Vec<Arc<TcpConnection>>,
    accept_asks: Vec<Arc<TcpConnection>>,
    readable_copies: Vec<(Arc<TcpConnection>, Vec<u8>)>,
    readable_batches: Vec<(Arc<TcpConnection>, Vec<u8>)>,
    sent: Vec<(Arc<TcpConnection>, usize)>,
    writable_edges: Vec<(Arc<TcpConnection>, bool)>,
    read_eofs: Vec<Arc<TcpConnection>>,
    terminated: Vec<(Arc<TcpConnection>, TerminationReason)>,
}

pub(crate) struct StackCore {
    pub(crate) config: StackConfig,
    pub(crate) device: TunDevice,
    pub(crate) iface: Interface,
    pub(crate) sockets: SocketSet<'static>,
    pub(crate) pool: Vec<SocketHandle>,
    /// Sockets whose flow terminated but whose engine state is still
    /// winding down; recycled once Closed.
    pub(crate) draining: Vec<SocketHandle>,
    pub(crate) flows: FxHashMap<SocketHandle, FlowEntry>,
    pub(crate) by_key: FxHashMap<FlowKey, SocketHandle>,
    pub(crate) registry: ExtArgRegistry,
    pub(crate) batcher: PacketBatcher,
    pub(crate) effects: Effects,
    pub(crate) stats: StackStats,
    pub(crate) epoch: StdInstant,
    pub(crate) running: bool,
    pub(crate) intercept_enabled: bool,
    pub(crate) stack_ref: Option<Arc<StackRef>>,
    pub(crate) core_weak: Weak<Mutex<StackCore>>,
}

impl StackCore {
    fn new(config: StackConfig) -> Result<Self, StackError> {
        let mut device = TunDevice::new(config.mtu, config.ring_capacity);
        let (iface, sockets, pool) = interface::build_interface(&config, &mut device);
        Ok(Self {
            batcher: PacketBatcher::new(config.batch_max_bytes, config.batch_max_packets),
            config,
            device,
            iface,
            sockets,
            pool,
            draining: Vec::new(),
            flows: FxHashMap::default(),
            by_key: FxHashMap::default(),
            registry: ExtArgRegistry::new(),
            effects: Effects::default(),
            stats: StackStats::default(),
            epoch: StdInstant::now(),
            running: false,
            intercept_enabled: false,
            stack_ref: None,
            core_weak: Weak::new(),
        })
    }

    pub(crate) fn input(&mut self, packet: Vec<u8>) {
        if !self.running {
            self.stats.packets_dropped += 1;
            return;
        }
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.len() as u64;
        match parse::parse_ipv4(&packet) {
            Err(err) => {
                self.stats.malformed_packets += 1;
                logger::breadcrumb(
                    BreadcrumbFlags::PACKET,
                    format!("dropped inbound packet: {}", err.description()),
                );
                return;
            }
            Ok(ParsedPacket::Other) => {
                self.stats.packets_dropped += 1;
                logger::breadcrumb(BreadcrumbFlags::PACKET, "non-TCP packet ignored");
                return;
            }
            Ok(ParsedPacket::Tcp(segment)) => self.intercept(&segment),
        }
        if !self.device.push_inbound(&packet) {
            self.stats.packets_dropped += 1;
            logger::warn("inbound ring full; packet dropped");
            return;
        }
        self.pump();
    }

    /// The intercept hook: runs for every inbound TCP segment before the
    /// engine sees it. A SYN for an unknown 4-tuple claims a pooled socket,
    /// points it at the SYN's destination, and wires the flow identities into
    /// the PCB's argument slots.
    fn intercept(&mut self, segment: &TcpSegment<'_>) {
        let key = FlowKey::from_segment(segment);
        if let Some(&handle) = self.by_key.get(&key) {
            if segment.flags.rst {
                if let Some(entry) = self.flows.get_mut(&handle) {
                    entry.rst_seen = true;
                }
            }
            return;
        }
        if !segment.flags.syn || segment.flags.ack || !self.intercept_enabled {
            return;
        }
        let Some(handle) = self.pool.pop() else {
            self.stats.admission_failures += 1;
            logger::warn(format!(
                "socket pool exhausted; SYN for {}:{} refused",
                segment.dst, segment.dst_port
            ));
            return;
        };
        {
            let socket = self.sockets.get_mut::<TcpSocket>(handle);
            let endpoint = IpListenEndpoint {
                addr: Some(IpAddress::Ipv4(Ipv4Address::from_bytes(
                    &segment.dst.octets(),
                ))),
                port: segment.dst_port,
            };
            if socket.listen(endpoint).is_err() {
                self.stats.admission_failures += 1;
                self.pool.push(handle);
                return;
            }
            // Delayed ACKs only add tick latency on a TUN path that batches
            // anyway.
            socket.set_ack_delay(None);
            socket.set_keep_alive(
                self.config
                    .keepalive_interval
                    .map(|interval| smoltcp::time::Duration::from_millis(interval.as_millis() as u64)),
            );
            socket.set_timeout(
                self.config
                    .engine_timeout
                    .map(|timeout| smoltcp::time::Duration::from_millis(timeout.as_millis() as u64)),
            );
        }
        let info = ConnectionInfo {
            src_ip: key.src_ip,
            src_port: key.src_port,
            dst_ip: key.dst_ip,
            dst_port: key.dst_port,
        };
        let conn = TcpConnection::new(info, handle, self.core_weak.clone());
        let stack_ref = self.stack_ref.clone().expect("stack ref installed");
        self.registry.bind_stack(handle, &stack_ref);
        self.registry.bind_connection(handle, conn.handle_ref());
        self.flows.insert(
            handle,
            FlowEntry {
                key,
                conn,
                phase: AcceptPhase::Handshake,
                gate_open: true,
                gate_pending: false,
                pending_delivery: false,
                rst_seen: segment.flags.rst,
                local_fin: false,
                local_detached: false,
                local_abort: false,
                eof_fired: false,
                last_send_queue: 0,
            },
        );
        self.by_key.insert(key, handle);
        self.stats.connections_intercepted += 1;
        logger::breadcrumb(
            BreadcrumbFlags::STACK,
            format!("TCP flow {info} intercepted"),
        );
    }

    /// Destroy every flow; only reached through `IpStack::teardown`.
    pub(crate) fn teardown(&mut self) {
        self.running = false;
        self.intercept_enabled = false;
        let handles: Vec<SocketHandle> = self.flows.keys().copied().collect();
        for handle in handles {
            self.sockets.get_mut::<TcpSocket>(handle).abort();
            self.terminate(handle, TerminationReason::Destroyed);
        }
        self.pump();
        if !self.batcher.is_empty() {
            self.flush_batcher_now();
        }
        if let Some(stack_ref) = &self.stack_ref {
            stack_ref.invalidate();
        }
        logger::breadcrumb(BreadcrumbFlags::STACK, "stack torn down");
    }

    pub(crate) fn snapshot_stats(&self) -> StackStats {
        let mut stats = self.stats;
        stats.connections_active = self.flows.len() as u64;
        stats
    }
}

/// Run `f` against the core on the packets context, then dispatch the
/// upper-layer work it collected once the lock is released.
pub(crate) fn with_core<R>(
    core: &Arc<Mutex<StackCore>>,
    f: impl FnOnce(&mut StackCore) -> R,
) -> R {
    Scheduler::shared().assert_packets_context();
    let (result, effects, stack) = {
        let mut guard = core.lock();
        let result = f(&mut guard);
        let effects = std::mem::take(&mut guard.effects);
        let stack = guard.stack_ref.as_ref().and_then(|stack_ref| stack_ref.get());
        (result, effects, stack)
    };
    dispatch_effects(core, stack, effects);
    result
}

fn dispatch_effects(
    core: &Arc<Mutex<StackCore>>,
    stack: Option<Arc<IpStack>>,
    effects: Effects,
) {
    let scheduler = Scheduler::shared();
    let Effects {
        outbound,
        schedule_flush,
        close_timers,
        activated,
        accept_asks,
        readable_copies,
        readable_batches,
        sent,
        writable_edges,
        read_eofs,
        terminated,
    } = effects;

    if let Some(delay) = schedule_flush {
        let core = Arc::clone(core);
        scheduler
            .packets()
            .perform_after(delay, move || with_core(&core, |core| core.flush_batcher()));
    }
    for (conn, delay) in close_timers {
        let core = Arc::clone(core);
        scheduler.packets().perform_after(delay, move || {
            with_core(&core, |core| core.abort_if_still_closing(&conn));
        });
    }

    if let Some(batch) = outbound {
        if let Some(handler) = stack.as_ref().and_then(|stack| stack.outbound_handler()) {
            scheduler
                .connections()
                .perform_async(move || handler(batch.packets, batch.families));
        }
    }
    for conn in activated {
        scheduler
            .connections()
            .perform_async(move || conn.fire_activated());
    }
    for conn in accept_asks {
        match stack.as_ref().and_then(|stack| stack.delegate()) {
            Some(delegate) => {
                scheduler.connections().perform_async(move || {
                    let decision = AcceptDecision::new(Arc::clone(&conn));
                    delegate.did_accept_tcp_connection(conn, decision);
                });
            }
            None => {
                logger::warn(format!("no delegate installed; rejecting {}", conn.info()));
                conn.abort();
            }
        }
    }
    for (conn, data) in readable_copies {
        scheduler
            .connections()
            .perform_async(move || conn.fire_readable(data));
    }
    for (conn, chunk) in readable_batches {
        scheduler
            .connections()
            .perform_async(move || conn.fire_readable_bytes(chunk));
    }
    for (conn, count) in sent {
        scheduler
            .connections()
            .perform_async(move || conn.fire_sent_bytes(count));
    }
    for (conn, writable) in writable_edges {
        scheduler
            .connections()
            .perform_async(move || conn.fire_writable_changed(writable));
    }
    for conn in read_eofs {
        scheduler
            .connections()
            .perform_async(move || conn.fire_read_eof());
    }
    for (conn, reason) in terminated {
        scheduler
            .connections()
            .perform_async(move || conn.fire_terminated(reason));
    }
}

#[cfg(test)]
mod tests;

//! Per-flow connection object handed to the upper layer.
//!
//! Terminology (engine perspective): local = the embedded engine / bridge
//! side, peer = the app behind the TUN device. The engine only speaks TCP to
//! the peer; the real server lifecycle belongs entirely to the upper layer.
//!
//! Every method hops to the packets context before touching the engine;
//! every handler fires on the connections context. Termination converges on
//! one atomic latch, tested on the packets context, so exactly one
//! `on_terminated` runs no matter which of the five paths gets there first.

use crate::error::{WriteResult, WriteStatus};
use crate::handle::{ConnRef, ObjectRef};
use crate::logger::{self, BreadcrumbFlags};
use crate::scheduler::Scheduler;
use crate::stack::{with_core, StackCore};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use smoltcp::iface::SocketHandle;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Largest run a single `write_bytes` call accepts.
pub const MAX_WRITE_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Active = 1,
    Closing = 2,
    Terminated = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Closing,
            3 => Self::Terminated,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminationReason {
    None = 0,
    /// Local close completed its FIN exchange.
    Close = 1,
    /// RST, either from the peer or a local abort/reject.
    Reset = 2,
    /// Engine error without a close or reset in flight.
    Abort = 3,
    /// The engine destroyed the PCB out from under the flow (teardown).
    Destroyed = 4,
}

impl TerminationReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Close,
            2 => Self::Reset,
            3 => Self::Abort,
            4 => Self::Destroyed,
            _ => Self::None,
        }
    }
}

/// Endpoint tuple snapshotted when the SYN is intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

pub type ActivatedHandler = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;
pub type ReadableHandler = Box<dyn FnMut(&Arc<TcpConnection>, Vec<u8>) + Send>;
pub type ReadableBytesHandler =
    Box<dyn FnMut(&Arc<TcpConnection>, &[&[u8]], usize, ReceiveCompletion) + Send>;
pub type WritableChangedHandler = Box<dyn FnMut(&Arc<TcpConnection>, bool) + Send>;
pub type SentBytesHandler = Box<dyn FnMut(&Arc<TcpConnection>, usize) + Send>;
pub type ReadEofHandler = Box<dyn FnMut(&Arc<TcpConnection>) + Send>;
pub type TerminatedHandler = Box<dyn FnMut(&Arc<TcpConnection>, TerminationReason) + Send>;

#[derive(Default)]
struct Handlers {
    on_activated: Option<ActivatedHandler>,
    on_readable: Option<ReadableHandler>,
    on_readable_bytes: Option<ReadableBytesHandler>,
    on_writable_changed: Option<WritableChangedHandler>,
    on_sent_bytes: Option<SentBytesHandler>,
    on_read_eof: Option<ReadEofHandler>,
    on_terminated: Option<TerminatedHandler>,
}

/// Credits the engine's receive window for one delivered batch. Consuming
/// `complete` makes a second completion unrepresentable; dropping it without
/// completing stalls the flow and is logged as a contract violation.
pub struct ReceiveCompletion {
    conn: Option<Arc<TcpConnection>>,
    total: usize,
}

impl ReceiveCompletion {
    pub(crate) fn new(conn: Arc<TcpConnection>, total: usize) -> Self {
        Self {
            conn: Some(conn),
            total,
        }
    }

    /// Return `total` bytes of receive credit to the engine, allowing the
    /// window to advance and the next batch to deliver.
    pub fn complete(mut self) {
        let conn = self.conn.take().expect("completion consumed once");
        let total = self.total;
        Scheduler::shared().packets().perform_async(move || {
            let Some(core) = conn.core.upgrade() else {
                return;
            };
            with_core(&core, |core| core.credit_receive(&conn, total));
        });
    }
}

impl Drop for ReceiveCompletion {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            logger::warn(format!(
                "receive completion for {} dropped; {} bytes never credited",
                conn.info(),
                self.total
            ));
        }
    }
}

/// Exactly-once accept verdict for an intercepted connection. `accept(true)`
/// activates the flow; `accept(false)` resets it. Dropping the decision
/// undecided also resets it so a forgetful delegate cannot leak the flow.
pub struct AcceptDecision {
    conn: Option<Arc<TcpConnection>>,
}

impl AcceptDecision {
    pub(crate) fn new(conn: Arc<TcpConnection>) -> Self {
        Self { conn: Some(conn) }
    }

    pub fn accept(mut self, accept: bool) {
        let conn = self.conn.take().expect("decision consumed once");
        if accept {
            conn.mark_active();
        } else {
            conn.abort();
        }
    }
}

impl Drop for AcceptDecision {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            logger::warn(format!(
                "accept decision for {} dropped without a verdict; resetting",
                conn.info()
            ));
            conn.abort();
        }
    }
}

pub struct TcpConnection {
    info: ConnectionInfo,
    pub(crate) socket: SocketHandle,
    pub(crate) core: Weak<Mutex<StackCore>>,
    handle: OnceCell<Arc<ConnRef>>,
    state: AtomicU8,
    reason: AtomicU8,
    /// The exactly-once termination latch; test-and-set on the packets
    /// context only.
    pub(crate) terminated: AtomicBool,
    pub(crate) writable: AtomicBool,
    handlers: Mutex<Handlers>,
}

impl TcpConnection {
    pub(crate) fn new(
        info: ConnectionInfo,
        socket: SocketHandle,
        core: Weak<Mutex<StackCore>>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            info,
            socket,
            core,
            handle: OnceCell::new(),
            state: AtomicU8::new(ConnectionState::Idle as u8),
            reason: AtomicU8::new(TerminationReason::None as u8),
            terminated: AtomicBool::new(false),
            writable: AtomicBool::new(true),
            handlers: Mutex::new(Handlers::default()),
        });
        let handle = ObjectRef::new(&conn);
        let _ = conn.handle.set(handle);
        conn
    }

    pub(crate) fn handle_ref(&self) -> &Arc<ConnRef> {
        self.handle.get().expect("handle installed at construction")
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn termination_reason(&self) -> TerminationReason {
        TerminationReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_reason(&self, reason: TerminationReason) {
        self.reason.store(reason as u8, Ordering::Release);
    }

    /// False once the connection has terminated.
    pub fn alive(&self) -> bool {
        !self.terminated.load(Ordering::Acquire)
    }

    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    // Handler installation. Set these before deciding the accept verdict;
    // callbacks always fire on the connections context.

    pub fn set_on_activated(&self, handler: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        self.handlers.lock().on_activated = Some(Box::new(handler));
    }

    /// Compatibility receive path: one contiguous copy per delivery, window
    /// credited on the caller's behalf. Prefer `set_on_readable_bytes`.
    pub fn set_on_readable(&self, handler: impl FnMut(&Arc<TcpConnection>, Vec<u8>) + Send + 'static) {
        self.handlers.lock().on_readable = Some(Box::new(handler));
    }

    /// Batch receive path. The completion MUST be consumed exactly once after
    /// the slices have been read; it returns the window credit.
    pub fn set_on_readable_bytes(
        &self,
        handler: impl FnMut(&Arc<TcpConnection>, &[&[u8]], usize, ReceiveCompletion) + Send + 'static,
    ) {
        self.handlers.lock().on_readable_bytes = Some(Box::new(handler));
    }

    pub fn set_on_writable_changed(
        &self,
        handler: impl FnMut(&Arc<TcpConnection>, bool) + Send + 'static,
    ) {
        self.handlers.lock().on_writable_changed = Some(Box::new(handler));
    }

    pub fn set_on_sent_bytes(&self, handler: impl FnMut(&Arc<TcpConnection>, usize) + Send + 'static) {
        self.handlers.lock().on_sent_bytes = Some(Box::new(handler));
    }

    pub fn set_on_read_eof(&self, handler: impl FnMut(&Arc<TcpConnection>) + Send + 'static) {
        self.handlers.lock().on_read_eof = Some(Box::new(handler));
    }

    pub fn set_on_terminated(
        &self,
        handler: impl FnMut(&Arc<TcpConnection>, TerminationReason) + Send + 'static,
    ) {
        self.handlers.lock().on_terminated = Some(Box::new(handler));
    }

    /// Accept the intercepted flow and open it for delivery. Fires
    /// `on_activated` exactly once; a repeat call is a no-op.
    pub fn mark_active(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        Scheduler::shared().packets().perform_async(move || {
            let Some(core) = conn.core.upgrade() else {
                return;
            };
            with_core(&core, |core| core.mark_active(&conn));
        });
    }

    /// Flow-control gate for inbound delivery. While disabled, bytes stay in
    /// the engine's receive buffer unacknowledged; re-enabling retries any
    /// pending delivery. Idempotent.
    pub fn set_inbound_delivery_enabled(self: &Arc<Self>, enabled: bool) {
        let conn = Arc::clone(self);
        Scheduler::shared().packets().perform_async(move || {
            let Some(core) = conn.core.upgrade() else {
                return;
            };
            with_core(&core, |core| core.set_inbound_delivery(&conn, enabled));
        });
    }

    /// Enqueue `bytes` into the engine's send buffer (the engine copies).
    /// All-or-nothing: a full buffer yields `WouldBlock` and a writability
    /// edge rather than a partial write.
    pub fn write_bytes(self: &Arc<Self>, bytes: &[u8]) -> WriteResult {
        if bytes.is_empty() || bytes.len() > MAX_WRITE_LEN {
            return WriteResult::status(WriteStatus::Overflow);
        }
        let scheduler = Scheduler::shared();
        if scheduler.packets().is_current() {
            let Some(core) = self.core.upgrade() else {
                return WriteResult::status(WriteStatus::Closed);
            };
            let conn = Arc::clone(self);
            return with_core(&core, |core| core.write(&conn, bytes));
        }
        let conn = Arc::clone(self);
        let owned = bytes.to_vec();
        scheduler.packets().perform_sync(move || {
            let Some(core) = conn.core.upgrade() else {
                return WriteResult::status(WriteStatus::Closed);
            };
            with_core(&core, |core| core.write(&conn, &owned))
        })
    }

    /// Half-close: shut down the send side, keep receiving.
    pub fn shutdown_write(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        Scheduler::shared().packets().perform_async(move || {
            let Some(core) = conn.core.upgrade() else {
                return;
            };
            with_core(&core, |core| core.shutdown_write(&conn));
        });
    }

    /// Full close: send FIN and detach; the engine finishes the exchange. A
    /// flow still closing after the configured timeout is aborted. Idempotent.
    pub fn graceful_close(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        Scheduler::shared().packets().perform_async(move || {
            let Some(core) = conn.core.upgrade() else {
                return;
            };
            with_core(&core, |core| core.graceful_close(&conn));
        });
    }

    /// Immediate RST. Terminates with `Reset`. Idempotent.
    pub fn abort(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        Scheduler::shared().packets().perform_async(move || {
            let Some(core) = conn.core.upgrade() else {
                return;
            };
            with_core(&core, |core| core.abort_flow(&conn));
        });
    }

    // Dispatch helpers, connections context only. Handlers are taken out of
    // the slot for the call so a callback may install handlers without
    // deadlocking; a handler replaced from within its own invocation wins.

    pub(crate) fn fire_activated(self: &Arc<Self>) {
        logger::breadcrumb(BreadcrumbFlags::CONN, format!("{} activated", self.info));
        let taken = self.handlers.lock().on_activated.take();
        if let Some(mut handler) = taken {
            handler(self);
            let mut guard = self.handlers.lock();
            if guard.on_activated.is_none() {
                guard.on_activated = Some(handler);
            }
        }
    }

    pub(crate) fn has_readable_bytes_handler(&self) -> bool {
        self.handlers.lock().on_readable_bytes.is_some()
    }

    pub(crate) fn has_readable_handler(&self) -> bool {
        self.handlers.lock().on_readable.is_some()
    }

    /// Deliver one batch on the zero-copy path. Falls back to immediate
    /// credit when the handler disappeared between pump and dispatch.
    pub(crate) fn fire_readable_bytes(self: &Arc<Self>, chunk: Vec<u8>) {
        let total = chunk.len();
        let completion = ReceiveCompletion::new(Arc::clone(self), total);
        let taken = self.handlers.lock().on_readable_bytes.take();
        match taken {
            Some(mut handler) => {
                let slices: [&[u8]; 1] = [chunk.as_slice()];
                handler(self, &slices, total, completion);
                let mut guard = self.handlers.lock();
                if guard.on_readable_bytes.is_none() {
                    guard.on_readable_bytes = Some(handler);
                }
            }
            None => completion.complete(),
        }
    }

    pub(crate) fn fire_readable(self: &Arc<Self>, data: Vec<u8>) {
        let taken = self.handlers.lock().on_readable.take();
        if let Some(mut handler) = taken {
            handler(self, data);
            let mut guard = self.handlers.lock();
            if guard.on_readable.is_none() {
                guard.on_readable = Some(handler);
            }
        }
    }

    pub(crate) fn fire_writable_changed(self: &Arc<Self>, writable: bool) {
        let taken = self.handlers.lock().on_writable_changed.take();
        if let Some(mut handler) = taken {
            handler(self, writable);
            let mut guard = self.handlers.lock();
            if guard.on_writable_changed.is_none() {
                guard.on_writable_changed = Some(handler);
            }
        }
    }

    pub(crate) fn fire_sent_bytes(self: &Arc<Self>, sent: usize) {
        let taken = self.handlers.lock().on_sent_bytes.take();
        if let Some(mut handler) = taken {
            handler(self, sent);
            let mut guard = self.handlers.lock();
            if guard.on_sent_bytes.is_none() {
                guard.on_sent_bytes = Some(handler);
            }
        }
    }

    pub(crate) fn fire_read_eof(self: &Arc<Self>) {
        let taken = self.handlers.lock().on_read_eof.take();
        if let Some(mut handler) = taken {
            handler(self);
            let mut guard = self.handlers.lock();
            if guard.on_read_eof.is_none() {
                guard.on_read_eof = Some(handler);
            }
        }
    }

    /// Final upper-side callback; every handler slot is dropped afterwards so
    /// nothing can fire past termination.
    pub(crate) fn fire_terminated(self: &Arc<Self>, reason: TerminationReason) {
        logger::breadcrumb(
            BreadcrumbFlags::CONN,
            format!("{} terminated ({reason:?})", self.info),
        );
        let taken = self.handlers.lock().on_terminated.take();
        if let Some(mut handler) = taken {
            handler(self, reason);
        }
        *self.handlers.lock() = Handlers::default();
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("info", &self.info)
            .field("state", &self.state())
            .field("writable", &self.writable())
            .finish()
    }
}

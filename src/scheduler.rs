//! Global scheduler driving engine execution and delegate dispatch.
//!
//! Two serial contexts exist for process lifetime: *packets* runs every call
//! into the embedded TCP/IP engine, *connections* runs every upper-layer
//! callback. Each context is a dedicated thread fed by an unbounded channel
//! and tagged with a thread-local marker so hops can be skipped when the
//! caller is already on the target context.

use crate::error::fatal;
use crate::logger::{self, BreadcrumbFlags};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContextId {
    Packets,
    Connections,
}

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Context the calling thread is bound to, if any.
pub fn current_context() -> Option<ContextId> {
    CURRENT_CONTEXT.with(|cell| cell.get())
}

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Task),
    At(Instant, Task),
}

struct TimedTask {
    at: Instant,
    seq: u64,
    task: Task,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest deadline
// surfaces first, with the submission sequence breaking ties FIFO.
impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimedTask {}
impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct SerialContext {
    id: ContextId,
    tx: Sender<Job>,
}

impl SerialContext {
    fn spawn(id: ContextId, name: &str) -> Self {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(id, rx))
            .unwrap_or_else(|err| fatal!("failed to spawn {name} context: {err}"));
        Self { id, tx }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        current_context() == Some(self.id)
    }

    /// Run `task` on this context. Runs inline when the caller is already
    /// here, avoiding a redundant hop.
    pub fn perform_async(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            task();
            return;
        }
        let _ = self.tx.send(Job::Run(Box::new(task)));
    }

    /// Run `task` after `delay`, always via the queue.
    pub fn perform_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let _ = self
            .tx
            .send(Job::At(Instant::now() + delay, Box::new(task)));
    }

    /// Run `task` on this context and wait for its result. Runs inline when
    /// already on the context, so nesting cannot deadlock.
    pub fn perform_sync<R, F>(&self, task: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return task();
        }
        let (done_tx, done_rx) = bounded(1);
        let _ = self.tx.send(Job::Run(Box::new(move || {
            let _ = done_tx.send(task());
        })));
        match done_rx.recv() {
            Ok(value) => value,
            Err(_) => fatal!("serial context dropped a synchronous task"),
        }
    }
}

fn run_loop(id: ContextId, rx: Receiver<Job>) {
    CURRENT_CONTEXT.with(|cell| cell.set(Some(id)));
    let mut timers: BinaryHeap<TimedTask> = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|entry| entry.at <= now) {
            let entry = timers.pop().expect("due timer");
            (entry.task)();
        }
        let received = match timers.peek() {
            Some(next) => rx.recv_deadline(next.at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Job::Run(task)) => task(),
            Ok(Job::At(at, task)) => {
                seq += 1;
                timers.push(TimedTask { at, seq, task });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

pub struct Scheduler {
    packets: SerialContext,
    connections: SerialContext,
    timer_running: AtomicBool,
    timer_generation: AtomicU64,
}

static SCHEDULER: Lazy<Scheduler> = Lazy::new(|| Scheduler {
    packets: SerialContext::spawn(ContextId::Packets, "tunforge-packets"),
    connections: SerialContext::spawn(ContextId::Connections, "tunforge-connections"),
    timer_running: AtomicBool::new(false),
    timer_generation: AtomicU64::new(0),
});

impl Scheduler {
    pub fn shared() -> &'static Scheduler {
        &SCHEDULER
    }

    pub fn packets(&self) -> &SerialContext {
        &self.packets
    }

    pub fn connections(&self) -> &SerialContext {
        &self.connections
    }

    pub fn assert_packets_context(&self) {
        if !self.packets.is_current() {
            fatal!("engine touched off the packets context");
        }
    }

    /// Arm the periodic engine tick on the packets context. Idempotent: a
    /// second call while armed is a no-op.
    pub fn start_timer(&'static self, interval: Duration, tick: Arc<dyn Fn() + Send + Sync>) {
        if self.timer_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        logger::breadcrumb(
            BreadcrumbFlags::TIMER,
            format!("timer armed ({} ms)", interval.as_millis()),
        );
        self.schedule_tick(generation, interval, tick);
    }

    /// Disarm the tick. Idempotent. A tick already queued becomes a no-op.
    pub fn stop_timer(&self) {
        if !self.timer_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.timer_generation.fetch_add(1, Ordering::SeqCst);
        logger::breadcrumb(BreadcrumbFlags::TIMER, "timer disarmed");
    }

    fn schedule_tick(
        &'static self,
        generation: u64,
        interval: Duration,
        tick: Arc<dyn Fn() + Send + Sync>,
    ) {
        self.packets.perform_after(interval, move || {
            let scheduler = Scheduler::shared();
            if scheduler.timer_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            tick();
            scheduler.schedule_tick(generation, interval, tick);
        });
    }
}

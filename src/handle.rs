//! Retained handles threaded through the engine's per-PCB argument slots.
//!
//! Ownership contract, mirroring the ext-arg facility:
//! - the owner creates the ref and hands a retained raw pointer to the
//!   registry, which the registry MUST balance with exactly one
//!   `release_raw` when the PCB is destroyed;
//! - `alive` is a logical liveness gate flipped only on the packets context;
//! - the weak target may be gone while the ref itself is still retained by
//!   the engine, so readers re-check `get()` under the packets context.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub struct ObjectRef<T> {
    target: Mutex<Weak<T>>,
    alive: AtomicBool,
}

pub type StackRef = ObjectRef<crate::stack::IpStack>;
pub type ConnRef = ObjectRef<crate::conn::TcpConnection>;

impl<T> ObjectRef<T> {
    pub fn new(target: &Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            target: Mutex::new(Arc::downgrade(target)),
            alive: AtomicBool::new(true),
        })
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Upgrade to the target object; `None` once invalidated or dropped.
    pub fn get(&self) -> Option<Arc<T>> {
        if !self.alive() {
            return None;
        }
        self.target.lock().upgrade()
    }

    /// Mark the ref dead and drop the weak target. Must run on the packets
    /// context; readers elsewhere may observe staleness but re-check there.
    pub fn invalidate(&self) {
        crate::scheduler::Scheduler::shared().assert_packets_context();
        self.alive.store(false, Ordering::Release);
        *self.target.lock() = Weak::new();
    }

    /// Retained raw pointer for the engine slot. Balance with `release_raw`.
    pub fn into_raw(this: &Arc<Self>) -> *const () {
        Arc::into_raw(Arc::clone(this)) as *const ()
    }

    /// Clone the ref back out of a slot without consuming the retain.
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` for this exact `T` and must not have
    /// been released yet.
    pub unsafe fn clone_raw(ptr: *const ()) -> Arc<Self> {
        let this = unsafe { Arc::from_raw(ptr as *const Self) };
        let cloned = Arc::clone(&this);
        std::mem::forget(this);
        cloned
    }

    /// Balance `into_raw`. The sole release point is the registry's destroy
    /// path.
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` for this exact `T`, exactly once.
    pub unsafe fn release_raw(ptr: *const ()) {
        drop(unsafe { Arc::from_raw(ptr as *const Self) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip_balances_refcounts() {
        let target = Arc::new(41usize);
        let handle = ObjectRef::new(&target);
        assert_eq!(Arc::strong_count(&handle), 1);

        let raw = ObjectRef::into_raw(&handle);
        assert_eq!(Arc::strong_count(&handle), 2);

        let cloned = unsafe { ObjectRef::<usize>::clone_raw(raw) };
        assert_eq!(Arc::strong_count(&handle), 3);
        assert_eq!(cloned.get().as_deref(), Some(&41));
        drop(cloned);

        unsafe { ObjectRef::<usize>::release_raw(raw) };
        assert_eq!(Arc::strong_count(&handle), 1);
    }

    #[test]
    fn invalidate_clears_target() {
        let target = Arc::new(string_target());
        let handle = ObjectRef::new(&target);
        assert!(handle.alive());
        assert!(handle.get().is_some());

        crate::scheduler::Scheduler::shared()
            .packets()
            .perform_sync({
                let handle = Arc::clone(&handle);
                move || handle.invalidate()
            });

        assert!(!handle.alive());
        assert!(handle.get().is_none());
        // The target itself outlives the ref's view of it.
        assert_eq!(target.as_str(), "target");
    }

    #[test]
    fn dropped_target_reads_as_nil_while_ref_stays_valid() {
        let target = Arc::new(string_target());
        let handle = ObjectRef::new(&target);
        drop(target);
        assert!(handle.alive());
        assert!(handle.get().is_none());
    }

    fn string_target() -> String {
        "target".to_string()
    }
}

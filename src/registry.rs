//! Thin layer over the engine's per-PCB extra-argument slots.
//!
//! Each PCB carries two fixed slots: slot 0 holds the stack identity, slot 1
//! the connection identity. Binding retains the handle and registers a
//! destroy function; `destroy` is the sole path that balances that retain,
//! and it runs exactly once when the engine tears the PCB down.

use crate::error::fatal;
use crate::handle::{ConnRef, ObjectRef, StackRef};
use rustc_hash::FxHashMap;
use smoltcp::iface::SocketHandle;
use std::sync::Arc;

pub const STACK_SLOT: usize = 0;
pub const CONNECTION_SLOT: usize = 1;
pub const EXT_ARG_SLOTS: usize = 2;

type DestroyFn = unsafe fn(*const ());

struct Slot {
    ptr: *const (),
    destroy: DestroyFn,
}

#[derive(Default)]
pub struct ExtArgRegistry {
    slots: FxHashMap<SocketHandle, [Option<Slot>; EXT_ARG_SLOTS]>,
}

// Slot pointers are retained `Arc<ObjectRef<T>>` values whose targets are
// Send + Sync; the raw form only exists while parked in the registry.
unsafe impl Send for ExtArgRegistry {}

impl ExtArgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_stack(&mut self, pcb: SocketHandle, handle: &Arc<StackRef>) {
        self.bind(pcb, STACK_SLOT, handle);
    }

    pub fn bind_connection(&mut self, pcb: SocketHandle, handle: &Arc<ConnRef>) {
        self.bind(pcb, CONNECTION_SLOT, handle);
    }

    pub fn stack(&self, pcb: SocketHandle) -> Option<Arc<StackRef>> {
        self.get(pcb, STACK_SLOT)
    }

    pub fn connection(&self, pcb: SocketHandle) -> Option<Arc<ConnRef>> {
        self.get(pcb, CONNECTION_SLOT)
    }

    /// Engine teardown for `pcb`: releases every bound slot exactly once.
    pub fn destroy(&mut self, pcb: SocketHandle) {
        if let Some(slots) = self.slots.remove(&pcb) {
            for slot in slots.into_iter().flatten() {
                unsafe { (slot.destroy)(slot.ptr) };
            }
        }
    }

    pub fn bound_pcbs(&self) -> usize {
        self.slots.len()
    }

    fn bind<T>(&mut self, pcb: SocketHandle, idx: usize, handle: &Arc<ObjectRef<T>>) {
        let entry = self.slots.entry(pcb).or_default();
        if entry[idx].is_some() {
            fatal!("ext-arg slot {idx} already bound for {pcb:?}");
        }
        entry[idx] = Some(Slot {
            ptr: ObjectRef::into_raw(handle),
            destroy: release_slot::<T>,
        });
    }

    fn get<T>(&self, pcb: SocketHandle, idx: usize) -> Option<Arc<ObjectRef<T>>> {
        let slot = self.slots.get(&pcb)?[idx].as_ref()?;
        // The typed accessors pin idx 0 to StackRef and idx 1 to ConnRef, so
        // the pointer is known to carry T.
        Some(unsafe { ObjectRef::clone_raw(slot.ptr) })
    }
}

unsafe fn release_slot<T>(ptr: *const ()) {
    unsafe { ObjectRef::<T>::release_raw(ptr) };
}

impl Drop for ExtArgRegistry {
    fn drop(&mut self) {
        let pcbs: Vec<SocketHandle> = self.slots.keys().copied().collect();
        for pcb in pcbs {
            self.destroy(pcb);
        }
    }
}

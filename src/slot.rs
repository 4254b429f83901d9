use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::object::Object;
use crate::thread;

/// An atomically written managed pointer field.
///
/// Every assignment pushes the new target into the calling thread's increment
/// queue before the pointer is exchanged, and pushes the prior value into the
/// decrement queue after, so the collector never observes a reachable pointer
/// whose citation has not been queued. All four operations must run on an
/// attached thread.
#[repr(transparent)]
pub struct Slot {
    p: AtomicPtr<Object>,
}

impl Slot {
    pub const fn null() -> Slot {
        Slot {
            p: AtomicPtr::new(null_mut()),
        }
    }

    /// Builds a slot already citing `p`.
    pub fn new(p: *mut Object) -> Slot {
        if !p.is_null() {
            thread::push_increment(p);
        }
        Slot {
            p: AtomicPtr::new(p),
        }
    }

    #[inline(always)]
    pub fn get(&self) -> *mut Object {
        self.p.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }

    /// Assigns a raw managed pointer.
    pub fn set(&self, p: *mut Object) {
        if !p.is_null() {
            thread::push_increment(p);
        }
        let old = self.p.swap(p, Ordering::SeqCst);
        if !old.is_null() {
            thread::push_decrement(old);
        }
    }

    /// Copy-assigns from another slot.
    pub fn copy_from(&self, other: &Slot) {
        let p = other.p.load(Ordering::SeqCst);
        if !p.is_null() {
            thread::push_increment(p);
        }
        let old = self.p.swap(p, Ordering::SeqCst);
        if !old.is_null() {
            thread::push_decrement(old);
        }
    }

    /// Move-assigns from another slot, transferring the citation without
    /// touching the queues for it.
    pub fn take_from(&self, other: &Slot) {
        if std::ptr::eq(self, other) {
            return;
        }
        let p = other.p.swap(null_mut(), Ordering::SeqCst);
        let old = self.p.swap(p, Ordering::SeqCst);
        if !old.is_null() {
            thread::push_decrement(old);
        }
    }

    /// Clears the slot, discharging its citation.
    pub fn clear(&self) {
        let old = self.p.swap(null_mut(), Ordering::SeqCst);
        if !old.is_null() {
            thread::push_decrement(old);
        }
    }

    // Collector-side accessors; counts are applied directly, never queued.
    #[inline(always)]
    pub(crate) fn raw(&self) -> *mut Object {
        self.p.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn raw_clear(&self) {
        self.p.store(null_mut(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn raw_store(&self, p: *mut Object) {
        self.p.store(p, Ordering::Relaxed);
    }
}

// The pointer word is atomic and every mutation goes through the queue
// protocol above.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

/// A stack-resident slot: dropping it discharges the citation, so a `Local`
/// pins its target for the enclosing scope.
pub struct Local {
    slot: Slot,
}

impl Local {
    pub fn new(p: *mut Object) -> Local {
        Local { slot: Slot::new(p) }
    }

    #[inline(always)]
    pub fn get(&self) -> *mut Object {
        self.slot.get()
    }

    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    pub fn set(&self, p: *mut Object) {
        self.slot.set(p);
    }
}

impl Clone for Local {
    fn clone(&self) -> Local {
        Local::new(self.get())
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::Engine;
use crate::object::Object;
use crate::slot::{Local, Slot};
use crate::thread;

#[repr(C)]
pub(crate) struct Link {
    next: *mut WeakNode,
    previous: *mut WeakNode,
}

// Ring node shared by every weak-handle flavor. `link` must stay first so the
// extension's sentinel `Link` can stand in for a node. A dependent handle is
// a node whose `secondary` slot is armed; a final handle survives the
// non-final clearing at condemnation and is nulled only when its referent's
// extension is destroyed after finalization.
pub(crate) struct WeakNode {
    link: Link,
    target: AtomicPtr<Object>,
    is_final: bool,
    secondary: Slot,
}

/// Side record of an object: the weak-handle ring and the self-citing cycle
/// slot that keeps any weakly-referenced object inside cycle detection, so
/// revival can be arbitrated before condemnation.
pub struct Extension {
    handles: UnsafeCell<Link>,
    cycle: Slot,
    mutex: Mutex<()>,
}

// The ring is only touched under `mutex`; the cycle slot additionally only
// changes under the engine's reviving mutex.
unsafe impl Send for Extension {}
unsafe impl Sync for Extension {}

impl Extension {
    pub(crate) fn new() -> Extension {
        Extension {
            handles: UnsafeCell::new(Link {
                next: null_mut(),
                previous: null_mut(),
            }),
            cycle: Slot::null(),
            mutex: Mutex::new(()),
        }
    }

    pub(crate) fn init_ring(&self) {
        let sentinel = self.sentinel();
        unsafe {
            (*sentinel).link.next = sentinel;
            (*sentinel).link.previous = sentinel;
        }
    }

    fn sentinel(&self) -> *mut WeakNode {
        self.handles.get() as *mut WeakNode
    }

    /// Visits the synthetic outgoing edges: the cycle slot and every
    /// dependent handle's secondary slot.
    pub(crate) fn scan(&self, visit: &mut dyn FnMut(&Slot)) {
        let _guard = self.mutex.lock();
        visit(&self.cycle);
        let sentinel = self.sentinel();
        unsafe {
            let mut p = (*sentinel).link.next;
            while p != sentinel {
                visit(&(*p).secondary);
                p = (*p).link.next;
            }
        }
    }

    /// Clears and unlinks every non-final handle; runs when the referent is
    /// condemned into the finalization path.
    pub(crate) fn detach(&self) {
        let _guard = self.mutex.lock();
        let sentinel = self.sentinel();
        unsafe {
            let mut p = (*sentinel).link.next;
            while p != sentinel {
                let next = (*p).link.next;
                if !(*p).is_final {
                    (*p).target.store(null_mut(), Ordering::Relaxed);
                    (*(*p).link.previous).link.next = (*p).link.next;
                    (*(*p).link.next).link.previous = (*p).link.previous;
                }
                p = next;
            }
        }
    }
}

impl Drop for Extension {
    // The referent is being freed: whatever handles remain, final ones
    // included, lose their target now.
    fn drop(&mut self) {
        let _guard = self.mutex.lock();
        let sentinel = self.sentinel();
        unsafe {
            let mut p = (*sentinel).link.next;
            if p.is_null() {
                // Ring never initialised (lost CAS candidate).
                return;
            }
            while p != sentinel {
                (*p).target.store(null_mut(), Ordering::Relaxed);
                p = (*p).link.next;
            }
        }
    }
}

/// Strong root handle: pins its target for the handle's lifetime.
pub struct NormalHandle {
    target: Local,
}

impl NormalHandle {
    pub fn new(target: *mut Object) -> NormalHandle {
        NormalHandle {
            target: Local::new(target),
        }
    }

    pub fn target(&self) -> Local {
        Local::new(self.target.get())
    }
}

/// Weak handle: observes its target without citing it. `target()` revives
/// the object through the reviving protocol, which forces any pending cycle
/// containing it to be revalidated before condemnation.
///
/// Handles must be created, upgraded, and dropped on attached threads.
pub struct WeakHandle {
    engine: Arc<Engine>,
    node: Box<WeakNode>,
}

// Ring membership is guarded by the extension mutex and every target
// transition by the reviving mutex.
unsafe impl Send for WeakHandle {}
unsafe impl Sync for WeakHandle {}

impl WeakHandle {
    /// `is_final` handles stay non-null until the referent has actually been
    /// finalized and released.
    pub fn new(engine: &Arc<Engine>, target: *mut Object, is_final: bool) -> WeakHandle {
        Self::with_secondary(engine, target, is_final, null_mut())
    }

    fn with_secondary(
        engine: &Arc<Engine>,
        target: *mut Object,
        is_final: bool,
        secondary: *mut Object,
    ) -> WeakHandle {
        let node = Box::new(WeakNode {
            link: Link {
                next: null_mut(),
                previous: null_mut(),
            },
            target: AtomicPtr::new(target),
            is_final,
            secondary: if secondary.is_null() {
                Slot::null()
            } else {
                Slot::new(secondary)
            },
        });
        let handle = WeakHandle {
            engine: Arc::clone(engine),
            node,
        };
        unsafe {
            let armed = {
                let mut reviving = handle.engine.reviving_mutex().lock();
                let armed = handle.attach();
                if !armed.is_null() {
                    // The arming citation is pushed only after every lock is
                    // released (pushes can block on the collector), so the
                    // reviving window covers the in-flight increment.
                    *reviving = true;
                    thread::mark_revive();
                }
                armed
            };
            if !armed.is_null() {
                thread::push_increment(armed);
            }
        }
        handle
    }

    // Links the node onto the target's ring, arming the cycle slot with a
    // self-reference when this is the first handle. Returns the armed target
    // whose increment the caller must push after releasing the locks. Caller
    // holds the reviving mutex; no queue pushes happen here.
    unsafe fn attach(&self) -> *mut Object {
        let target = self.node.target.load(Ordering::Relaxed);
        if target.is_null() {
            return null_mut();
        }
        let ext = (*target).extension();
        let _guard = (*ext).mutex.lock();
        let mut armed = null_mut();
        if (*ext).cycle.raw().is_null() {
            (*ext).cycle.raw_store(target);
            armed = target;
        }
        let sentinel = (*ext).sentinel();
        let node = &*self.node as *const WeakNode as *mut WeakNode;
        (*node).link.previous = (*sentinel).link.previous;
        (*node).link.next = sentinel;
        (*(*node).link.previous).link.next = node;
        (*sentinel).link.previous = node;
        armed
    }

    // Unlinks the node. When the ring empties the cycle slot is cleared
    // in place and the disarmed self-citation is returned, to be discharged
    // by the caller once every lock is released.
    unsafe fn detach(&self) -> Option<*mut Object> {
        let target = self.node.target.load(Ordering::Relaxed);
        if target.is_null() {
            return None;
        }
        let ext = (*target).extension.load(Ordering::Acquire);
        debug_assert!(!ext.is_null());
        let _guard = (*ext).mutex.lock();
        let node = &*self.node as *const WeakNode as *mut WeakNode;
        (*(*node).link.previous).link.next = (*node).link.next;
        (*(*node).link.next).link.previous = (*node).link.previous;
        self.node.target.store(null_mut(), Ordering::Relaxed);
        let sentinel = (*ext).sentinel();
        if (*sentinel).link.next == sentinel {
            let armed = (*ext).cycle.raw();
            (*ext).cycle.raw_clear();
            if !armed.is_null() {
                return Some(armed);
            }
        }
        None
    }

    /// Revives and returns the target, or `None` once it has been condemned
    /// (non-final) or finalized (final).
    ///
    /// The reviving flag and the per-thread revival marker are published
    /// under the reviving mutex before the re-citation is pushed; the
    /// collector keeps the flag up until the marker's queue position has
    /// been consumed, so the target cannot be condemned in between.
    pub fn target(&self) -> Option<Local> {
        let target;
        {
            let mut reviving = self.engine.reviving_mutex().lock();
            target = self.node.target.load(Ordering::Relaxed);
            if target.is_null() {
                return None;
            }
            *reviving = true;
            thread::mark_revive();
        }
        Some(Local::new(target))
    }

    /// Points the handle at a different object. The caller must hold the new
    /// target strongly.
    pub fn retarget(&self, target: *mut Object) {
        unsafe {
            let (disarmed, armed) = {
                let mut reviving = self.engine.reviving_mutex().lock();
                let disarmed = self.detach();
                self.node.target.store(target, Ordering::Relaxed);
                let armed = self.attach();
                if !armed.is_null() {
                    *reviving = true;
                    thread::mark_revive();
                }
                (disarmed, armed)
            };
            if !armed.is_null() {
                thread::push_increment(armed);
            }
            if let Some(p) = disarmed {
                thread::push_decrement(p);
            }
        }
    }

    pub fn is_final(&self) -> bool {
        self.node.is_final
    }
}

impl Drop for WeakHandle {
    fn drop(&mut self) {
        let disarmed = {
            let _reviving = self.engine.reviving_mutex().lock();
            unsafe { self.detach() }
        };
        if let Some(p) = disarmed {
            thread::push_decrement(p);
        }
        self.node.secondary.clear();
    }
}

/// Handle pair: weak in its primary, strong in its secondary for exactly as
/// long as the primary is reachable. The secondary edge is visible to cycle
/// detection through the primary's extension scan.
pub struct DependentHandle {
    inner: WeakHandle,
}

impl DependentHandle {
    pub fn new(
        engine: &Arc<Engine>,
        primary: *mut Object,
        secondary: *mut Object,
    ) -> DependentHandle {
        DependentHandle {
            inner: WeakHandle::with_secondary(engine, primary, false, secondary),
        }
    }

    /// Revives and returns the primary.
    pub fn target(&self) -> Option<Local> {
        self.inner.target()
    }

    /// Current secondary, which the collector clears when the primary dies.
    pub fn secondary(&self) -> *mut Object {
        self.inner.node.secondary.get()
    }
}

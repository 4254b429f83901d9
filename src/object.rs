use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::handles::Extension;
use crate::slot::Slot;
use crate::thread;

/// Collection state of a managed object. Written only by the collector
/// thread; mutators never read it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Color {
    Black,
    Purple,
    Gray,
    Whiting,
    White,
    Orange,
    Red,
}

/// Rank of individually mapped objects, outside the seven segregated classes.
pub(crate) const LARGE_RANK: usize = usize::MAX;

// Object header prepended to every managed allocation. The first two fields
// double as the intrusive links of the purple-root list, so a two-pointer
// sentinel can stand in for an `Object` (see collector.rs). Layout therefore
// must stay repr(C) with `next`/`previous` first.
//
// Ownership of the fields is split:
// - `ty` and `extension` are shared between mutators and the collector.
// - `finalizee` is toggled by the allocating mutator (before publication) and
//   the finalizer thread, and read by the collector.
// - everything else belongs to the collector thread once the object is
//   published, and to the heap while the object sits on a free list (`next`
//   threads free lists, `cyclic` tags chunk lengths).
#[repr(C)]
pub struct Object {
    pub(crate) next: *mut Object,
    pub(crate) previous: *mut Object,
    pub(crate) scan: *mut Object,
    pub(crate) color: Color,
    pub(crate) finalizee: AtomicBool,
    pub(crate) count: usize,
    pub(crate) cyclic: usize,
    pub(crate) rank: usize,
    pub(crate) next_cycle: *mut Object,
    pub(crate) ty: AtomicPtr<Type>,
    pub(crate) extension: AtomicPtr<Extension>,
}

impl Object {
    /// Size of the header prepended to every payload.
    pub const HEADER_SIZE: usize = size_of::<Object>();

    /// Pointer to the payload that follows the header.
    #[inline(always)]
    pub fn data(&self) -> *mut u8 {
        (self as *const Object as usize + size_of::<Object>()) as *mut u8
    }

    /// Typed view of the payload.
    ///
    /// # Safety
    ///
    /// The payload must have been constructed as a `T`.
    #[inline(always)]
    pub unsafe fn payload<T>(&self) -> &T {
        &*self.data().cast::<T>()
    }

    /// The type descriptor, or null until the allocating mutator finishes the
    /// object.
    #[inline(always)]
    pub fn ty(&self) -> *const Type {
        self.ty.load(Ordering::Acquire)
    }

    /// Arms the finalizee bit so the object is handed to the finalizer before
    /// its memory is released.
    pub fn register_finalize(&self) {
        self.finalizee.store(true, Ordering::Relaxed);
    }

    /// Clears the finalizee bit; the finalizer calls this before running the
    /// user callback so a resurrected object is not finalized twice.
    pub fn suppress_finalize(&self) {
        self.finalizee.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_finalizee(&self) -> bool {
        self.finalizee.load(Ordering::Relaxed)
    }

    /// Lazily installs the extension record with a CAS; the loser frees its
    /// candidate.
    pub(crate) fn extension(&self) -> *mut Extension {
        let p = self.extension.load(Ordering::Acquire);
        if !p.is_null() {
            return p;
        }
        let candidate = Box::into_raw(Box::new(Extension::new()));
        unsafe {
            (*candidate).init_ring();
        }
        match self.extension.compare_exchange(
            std::ptr::null_mut(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => candidate,
            Err(existing) => {
                // Candidate never linked anywhere, safe to drop.
                drop(unsafe { Box::from_raw(candidate) });
                existing
            }
        }
    }
}

/// Per-type layout callbacks the collector consumes. Descriptors are plain
/// statics supplied by the embedding runtime; the collector never allocates
/// or frees them.
pub struct Type {
    pub name: &'static str,
    /// Payload size excluding the object header.
    pub size: usize,
    /// Instances are handed to the finalizer before their memory is released.
    pub finalizee: bool,
    /// Visits every managed slot of the payload.
    pub scan: unsafe fn(*mut Object, &mut dyn FnMut(&Slot)),
}

impl Type {
    /// Publishes the descriptor on a freshly constructed object and pushes the
    /// decrement that discharges the allocator's transient citation. Until
    /// this runs the object is reachable only through the allocating mutator
    /// and must not be scanned.
    ///
    /// # Safety
    ///
    /// `p` must point to a fully constructed object of this type, on an
    /// attached thread.
    pub unsafe fn finish(&'static self, p: *mut Object) {
        if self.finalizee {
            (*p).finalizee.store(true, Ordering::Relaxed);
        }
        (*p).ty
            .store(self as *const Type as *mut Type, Ordering::Release);
        thread::push_decrement(p);
    }
}

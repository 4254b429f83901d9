use std::cell::Cell;
use std::ptr::null_mut;
use std::sync::Once;

use crate::engine::Engine;
use crate::object::Object;
use crate::queue::{Decrements, Increments};

// Per-mutator bookkeeping. Owned by the registry (engine.rs); the collector
// walks these while holding the registry mutex, the owning thread touches its
// queues lock-free, and the SIGUSR1 handler touches only the epoch cursors.
pub(crate) struct Internal {
    pub(crate) next: *mut Internal,
    pub(crate) increments: Increments,
    pub(crate) decrements: Decrements,
    /// -1 while the thread runs; counts settling epochs once detached. The
    /// collector unregisters the internal when it reaches 3.
    pub(crate) done: Cell<i32>,
    pub(crate) finalizer: bool,
    /// Queue position of the latest weak-handle revival, cleared by the
    /// collector once the consumer tail has passed it.
    pub(crate) reviving: Cell<Option<usize>>,
    pub(crate) pthread: libc::pthread_t,
    pub(crate) engine: *const Engine,
}

impl Internal {
    pub(crate) fn new(engine: *const Engine, finalizer: bool) -> Internal {
        Internal {
            next: null_mut(),
            increments: Increments::new(),
            decrements: Decrements::new(),
            done: Cell::new(-1),
            finalizer,
            reviving: Cell::new(None),
            pthread: unsafe { libc::pthread_self() },
            engine,
        }
    }

    /// Requests an epoch snapshot from the owning thread and waits for the
    /// handler to post it back.
    pub(crate) unsafe fn request_epoch(&self) {
        if libc::pthread_kill(self.pthread, libc::SIGUSR1) != 0 {
            panic!("pthread_kill failed");
        }
        let sem = (*self.engine).epoch_sem();
        while libc::sem_wait(sem) == -1 {
            debug_assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EINTR));
        }
    }

    /// Self-snapshot taken at detach; no tokens can follow it.
    pub(crate) fn snapshot(&self) {
        self.increments.queue.snapshot();
        self.decrements.queue.snapshot();
    }
}

thread_local! {
    static CURRENT: Cell<*mut Internal> = const { Cell::new(null_mut()) };
}

pub(crate) fn set_current(internal: *mut Internal) {
    CURRENT.with(|c| {
        assert!(c.get().is_null(), "thread is already attached to an engine");
        c.set(internal);
    });
}

pub(crate) fn clear_current() {
    CURRENT.with(|c| c.set(null_mut()));
}

#[inline(always)]
pub(crate) fn current() -> *mut Internal {
    CURRENT.with(|c| c.get())
}

#[inline(always)]
pub(crate) fn push_increment(p: *mut Object) {
    let i = current();
    debug_assert!(!i.is_null(), "managed write on an unattached thread");
    unsafe {
        (*i).increments.queue.push(p, (*(*i).engine).conductor());
    }
}

#[inline(always)]
pub(crate) fn push_decrement(p: *mut Object) {
    let i = current();
    debug_assert!(!i.is_null(), "managed write on an unattached thread");
    unsafe {
        (*i).decrements.queue.push(p, (*(*i).engine).conductor());
    }
}

/// Records the revival window marker: the queue position the next increment
/// will occupy. Must be called under the engine's reviving mutex, before the
/// re-citation is pushed; the collector keeps the reviving flag up until the
/// consumer tail has passed this position.
pub(crate) fn mark_revive() {
    let i = current();
    debug_assert!(!i.is_null());
    unsafe {
        (*i).reviving.set(Some((*i).increments.queue.head()));
    }
}

// The handler runs on the interrupted mutator and performs only
// async-signal-safe work: two atomic stores and a semaphore post.
extern "C" fn epoch_signal(_: libc::c_int) {
    let i = current();
    if !i.is_null() {
        unsafe {
            (*i).snapshot();
            libc::sem_post((*(*i).engine).epoch_sem());
        }
    }
}

extern "C" fn suspend_signal(_: libc::c_int) {}

/// Installs the SIGUSR1/SIGUSR2 handlers once per process. Engines can
/// coexist because the handler reads only the receiving thread's state.
pub(crate) fn install_signals() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = suspend_signal as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGUSR2, &sa, null_mut()) == -1 {
            panic!("sigaction(SIGUSR2) failed");
        }
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = epoch_signal as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, libc::SIGUSR2);
        if libc::sigaction(libc::SIGUSR1, &sa, null_mut()) == -1 {
            panic!("sigaction(SIGUSR1) failed");
        }
    });
}

/// Masks SIGUSR1 around the block-registry critical section so an epoch
/// snapshot cannot be delivered while the registry mutex is held.
pub(crate) struct MaskEpochSignal {
    old: libc::sigset_t,
}

impl MaskEpochSignal {
    pub(crate) fn new() -> MaskEpochSignal {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGUSR1);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
            MaskEpochSignal { old }
        }
    }
}

impl Drop for MaskEpochSignal {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, null_mut());
        }
    }
}

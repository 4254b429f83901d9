use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::collector::Collector;
use crate::heap::{Heap, HeapStatistics};
use crate::object::{Color, Object, Type};
use crate::thread::{self, Internal};

/// Engine options.
#[derive(Clone, Debug)]
pub struct Options {
    /// Dump allocation statistics at shutdown and enforce the
    /// allocated == freed terminal check.
    pub verbose: bool,
    /// Live-object growth over the low-water mark that triggers cycle
    /// detection.
    pub threshold: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            verbose: false,
            threshold: 1024,
        }
    }
}

/// Collector and allocator counters, sampled by [`Engine::statistics`].
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    pub heap: HeapStatistics,
    pub live: usize,
    pub epochs: usize,
    pub ticks: usize,
    pub waits: usize,
    pub cycle_collections: usize,
    pub released: usize,
    pub collected: usize,
}

struct ConductorState {
    running: bool,
    quitting: bool,
    exited: bool,
    round: usize,
    ticks: usize,
    waits: usize,
}

// Wake/sleep coordination between a dedicated thread (collector or
// finalizer) and the threads that prod it. One round = one pass of the
// owning thread's loop.
pub(crate) struct Conductor {
    state: Mutex<ConductorState>,
    wake: Condvar,
    done: Condvar,
}

impl Conductor {
    pub(crate) fn new() -> Conductor {
        Conductor {
            state: Mutex::new(ConductorState {
                running: true,
                quitting: false,
                exited: false,
                round: 0,
                ticks: 0,
                waits: 0,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
        }
    }

    /// Wakes the owning thread without waiting for it.
    pub(crate) fn tick(&self) {
        let mut s = self.state.lock();
        s.ticks += 1;
        if !s.running && !s.exited {
            s.running = true;
            self.wake.notify_one();
        }
    }

    /// Wakes the owning thread and blocks until it completes a full round.
    pub(crate) fn wait(&self) {
        let mut s = self.state.lock();
        s.waits += 1;
        let round = s.round;
        if !s.running && !s.exited {
            s.running = true;
            self.wake.notify_one();
        }
        while s.round == round && !s.exited {
            self.done.wait(&mut s);
        }
    }

    /// Owning-thread side: ends the current round and sleeps until woken.
    /// Returns true once quitting was requested.
    pub(crate) fn next(&self) -> bool {
        let mut s = self.state.lock();
        s.running = false;
        s.round += 1;
        self.done.notify_all();
        while !s.running && !s.quitting {
            self.wake.wait(&mut s);
        }
        s.quitting
    }

    /// Requests shutdown and blocks until the owning thread exits.
    pub(crate) fn quit(&self) {
        let mut s = self.state.lock();
        s.quitting = true;
        if !s.running {
            s.running = true;
            self.wake.notify_one();
        }
        while !s.exited {
            self.done.wait(&mut s);
        }
    }

    pub(crate) fn exit(&self) {
        let mut s = self.state.lock();
        s.exited = true;
        s.round += 1;
        self.done.notify_all();
    }

    pub(crate) fn quitting(&self) -> bool {
        self.state.lock().quitting
    }

    fn counters(&self) -> (usize, usize, usize) {
        let s = self.state.lock();
        (s.round, s.ticks, s.waits)
    }
}

struct Registry {
    head: *mut Internal,
    finalizer_sleeping: bool,
    finalizer_awaken: u32,
}

/// Attachment guard for the current thread. Dropping it detaches the thread:
/// both queues are self-snapshotted, the thread-local free lists are
/// published, and the collector settles the remaining tokens over the next
/// epochs.
pub struct Mutator {
    engine: Arc<Engine>,
    internal: *mut Internal,
}

impl Mutator {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.engine.heap.return_thread_local();
        {
            let _reg = self.engine.threads.lock();
            unsafe {
                (*self.internal).snapshot();
                (*self.internal).done.set(0);
            }
        }
        thread::clear_current();
        self.engine.threads_cond.notify_all();
        self.engine.collector.tick();
    }
}

/// The engine: one size-class heap, a registry of mutator internals, one
/// collector thread, and one finalizer thread attached as a mutator of its
/// own.
pub struct Engine {
    this: Weak<Engine>,
    options: Options,
    heap: Heap,
    threads: Mutex<Registry>,
    threads_cond: Condvar,
    collector: Conductor,
    finalizer: Conductor,
    finalizer_queue: Mutex<VecDeque<usize>>,
    finalize_fn: Mutex<Option<fn(*mut Object)>>,
    reviving: Mutex<bool>,
    epoch_sem: UnsafeCell<libc::sem_t>,
    threshold: AtomicUsize,
    full: Mutex<i32>,
    handles: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    shutting_down: AtomicBool,
    released: AtomicUsize,
    collected: AtomicUsize,
    cycle_collections: AtomicUsize,
}

// All interior raw pointers are guarded by the registry mutex, the conductor
// protocol, or the queue SPSC discipline.
unsafe impl Send for Engine {}
unsafe impl Sync for Engine {}

impl Engine {
    /// Builds an engine and starts its collector and finalizer threads.
    pub fn new(options: Options) -> Arc<Engine> {
        thread::install_signals();
        let engine = Arc::new_cyclic(|this: &Weak<Engine>| {
            let wait = {
                let this = this.clone();
                Box::new(move || {
                    if let Some(engine) = this.upgrade() {
                        engine.wait_epoch();
                    }
                }) as Box<dyn Fn() + Send + Sync>
            };
            Engine {
                this: this.clone(),
                threshold: AtomicUsize::new(options.threshold),
                options,
                heap: Heap::new(wait),
                threads: Mutex::new(Registry {
                    head: null_mut(),
                    finalizer_sleeping: false,
                    finalizer_awaken: 0,
                }),
                threads_cond: Condvar::new(),
                collector: Conductor::new(),
                finalizer: Conductor::new(),
                finalizer_queue: Mutex::new(VecDeque::new()),
                finalize_fn: Mutex::new(None),
                reviving: Mutex::new(false),
                epoch_sem: UnsafeCell::new(unsafe { std::mem::zeroed() }),
                full: Mutex::new(0),
                handles: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                released: AtomicUsize::new(0),
                collected: AtomicUsize::new(0),
                cycle_collections: AtomicUsize::new(0),
            }
        });
        if unsafe { libc::sem_init(engine.epoch_sem(), 0, 0) } == -1 {
            panic!("sem_init failed");
        }
        engine.start();
        engine
    }

    fn start(&self) {
        let this = self.this.upgrade().expect("engine already dropped");
        let collector_engine = Arc::clone(&this);
        let collector = std::thread::Builder::new()
            .name("quasar-collector".into())
            .spawn(move || collector_main(collector_engine))
            .expect("failed to spawn the collector thread");
        let finalizer_engine = Arc::clone(&this);
        let finalizer = std::thread::Builder::new()
            .name("quasar-finalizer".into())
            .spawn(move || finalizer_main(finalizer_engine))
            .expect("failed to spawn the finalizer thread");
        *self.handles.lock() = Some((collector, finalizer));
    }

    /// Registers the current thread as a mutator. Every thread that touches
    /// slots, handles, or `allocate` must hold a `Mutator`.
    pub fn attach(self: &Arc<Engine>) -> Mutator {
        self.attach_internal(false)
    }

    fn attach_internal(self: &Arc<Engine>, finalizer: bool) -> Mutator {
        assert!(
            !self.shutting_down.load(Ordering::SeqCst),
            "attach during shutdown"
        );
        let internal = Box::into_raw(Box::new(Internal::new(Arc::as_ptr(self), finalizer)));
        thread::set_current(internal);
        {
            let mut reg = self.threads.lock();
            unsafe {
                (*internal).next = reg.head;
            }
            reg.head = internal;
        }
        Mutator {
            engine: Arc::clone(self),
            internal,
        }
    }

    /// Allocates a managed object: picks the size class fitting header,
    /// payload, and `extra` trailing bytes, runs `construct` on the raw
    /// payload, and finishes the object with `ty`.
    pub fn allocate(
        &self,
        ty: &'static Type,
        extra: usize,
        construct: impl FnOnce(*mut u8),
    ) -> *mut Object {
        let size = Object::HEADER_SIZE + ty.size + extra;
        let p = self.heap.allocate(size);
        unsafe {
            (*p).next = null_mut();
            (*p).previous = null_mut();
            (*p).scan = null_mut();
            (*p).color = Color::Black;
            (*p).finalizee.store(false, Ordering::Relaxed);
            (*p).count = 1;
            (*p).cyclic = 0;
            (*p).next_cycle = null_mut();
            (*p).ty.store(null_mut(), Ordering::Relaxed);
            (*p).extension.store(null_mut(), Ordering::Relaxed);
            construct((*p).data());
            ty.finish(p);
        }
        p
    }

    /// Forces a synchronous cycle-detection window: the threshold drops to
    /// zero and four epochs are waited out, enough for detection plus
    /// condemnation plus token settling.
    pub fn collect(&self) {
        {
            let mut full = self.full.lock();
            *full += 1;
            if *full == 1 {
                self.threshold.store(0, Ordering::SeqCst);
            }
        }
        for _ in 0..4 {
            self.wait_epoch();
        }
        {
            let mut full = self.full.lock();
            *full -= 1;
            if *full == 0 {
                self.threshold
                    .store(self.options.threshold, Ordering::SeqCst);
            }
        }
    }

    /// Wakes the finalizer and waits for it to drain its queue.
    pub fn finalize(&self) {
        self.finalizer.wait();
    }

    /// Supplies the callback the finalizer runs on each finalizee.
    pub fn set_finalize(&self, f: fn(*mut Object)) {
        *self.finalize_fn.lock() = Some(f);
    }

    /// Quiesces the engine: waits for every mutator to detach, drains all
    /// queues until the live count stabilises, then stops the finalizer and
    /// the collector. The calling thread must already be detached.
    pub fn shutdown(&self) {
        assert!(
            thread::current().is_null(),
            "detach the current thread before shutdown"
        );
        loop {
            let busy = {
                let reg = self.threads.lock();
                let mut p = reg.head;
                let mut busy = false;
                unsafe {
                    while !p.is_null() {
                        if !(*p).finalizer {
                            busy = true;
                            break;
                        }
                        p = (*p).next;
                    }
                }
                busy
            };
            if !busy {
                break;
            }
            self.wait_epoch();
        }
        self.shutting_down.store(true, Ordering::SeqCst);

        {
            let mut full = self.full.lock();
            *full += 1;
            if *full == 1 {
                self.threshold.store(0, Ordering::SeqCst);
            }
        }
        // Drain until every queue is empty and the live count holds still
        // for two consecutive epochs.
        let mut stable = 0;
        let mut last_live = usize::MAX;
        while stable < 2 {
            self.wait_epoch();
            let live = self.live();
            let drained = {
                let reg = self.threads.lock();
                let mut ok = self.finalizer_queue.lock().is_empty();
                let mut p = reg.head;
                unsafe {
                    while ok && !p.is_null() {
                        if !(*p).increments.queue.drained() || !(*p).decrements.queue.drained() {
                            ok = false;
                        }
                        p = (*p).next;
                    }
                }
                ok
            };
            if drained && live == last_live {
                stable += 1;
            } else {
                stable = 0;
            }
            last_live = live;
        }
        {
            let mut full = self.full.lock();
            *full -= 1;
            if *full == 0 {
                self.threshold
                    .store(self.options.threshold, Ordering::SeqCst);
            }
        }

        self.finalizer.quit();
        loop {
            let empty = self.threads.lock().head.is_null();
            if empty {
                break;
            }
            self.wait_epoch();
        }
        self.collector.quit();
        if let Some((collector, finalizer)) = self.handles.lock().take() {
            collector.join().ok();
            finalizer.join().ok();
        }
        unsafe {
            libc::sem_destroy(self.epoch_sem());
        }
        if self.options.verbose {
            self.dump_statistics();
        }
    }

    /// Number of live managed objects.
    pub fn live(&self) -> usize {
        self.heap.live()
    }

    /// Conservative pointer query against the block registry.
    pub fn find(&self, addr: usize) -> Option<*mut Object> {
        self.heap.find(addr)
    }

    pub fn statistics(&self) -> Statistics {
        let (epochs, ticks, waits) = self.collector.counters();
        Statistics {
            heap: self.heap.statistics(),
            live: self.live(),
            epochs,
            ticks,
            waits,
            cycle_collections: self.cycle_collections.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
        }
    }

    fn dump_statistics(&self) {
        let stats = self.statistics();
        let mut allocated = 0;
        let mut freed = 0;
        for (rank, &(grown, rank_allocated, rank_freed)) in stats.heap.ranks.iter().enumerate() {
            tracing::info!(
                rank,
                grown,
                allocated = rank_allocated,
                freed = rank_freed,
                live = rank_allocated - rank_freed,
                "rank statistics"
            );
            allocated += rank_allocated;
            freed += rank_freed;
        }
        allocated += stats.heap.large_allocated;
        freed += stats.heap.large_freed;
        tracing::info!(
            allocated,
            freed,
            live = allocated - freed,
            released = stats.released,
            collected = stats.collected,
            epochs = stats.epochs,
            ticks = stats.ticks,
            waits = stats.waits,
            cycle_collections = stats.cycle_collections,
            "engine statistics"
        );
        if allocated != freed {
            panic!("leaked {} objects at shutdown", allocated - freed);
        }
    }

    /// Waits out one full collector epoch.
    pub(crate) fn wait_epoch(&self) {
        self.collector.wait();
    }

    pub(crate) fn conductor(&self) -> &Conductor {
        &self.collector
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold.load(Ordering::SeqCst)
    }

    pub(crate) fn reviving_mutex(&self) -> &Mutex<bool> {
        &self.reviving
    }

    pub(crate) fn epoch_sem(&self) -> *mut libc::sem_t {
        self.epoch_sem.get()
    }

    pub(crate) fn finalizer_quitting(&self) -> bool {
        self.finalizer.quitting()
    }

    pub(crate) fn finalizer_enqueue(&self, p: *mut Object) {
        self.finalizer_queue.lock().push_back(p as usize);
    }

    pub(crate) fn wake_finalizer(&self) {
        self.finalizer.tick();
    }

    pub(crate) fn note_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_collected(&self) {
        self.collected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_collect_cycle(&self) {
        self.cycle_collections.fetch_add(1, Ordering::Relaxed);
    }

    // One epoch over the registry: snapshot each active mutator through the
    // signal handshake, settle the reviving window, then apply increments
    // before decrements. Detached internals settle over three epochs and are
    // then unregistered.
    unsafe fn epoch(&self, collector: &mut Collector) {
        let mut reg = self.threads.lock();
        let mut pp: *mut *mut Internal = &mut reg.head;
        loop {
            let q = *pp;
            if q.is_null() {
                break;
            }
            let mut active = (*q).done.get() < 0;
            if active && (*q).finalizer {
                active = reg.finalizer_awaken > 0;
                if active && reg.finalizer_sleeping {
                    reg.finalizer_awaken -= 1;
                }
            }
            let tail = (*q).increments.queue.tail();
            if active {
                (*q).request_epoch();
            }
            (*q).increments.flush(&mut |p| collector.increment(p));
            (*q).decrements.flush(&mut |p| collector.decrement(p, self));
            if active {
                // A pending revival marker keeps the global reviving flag up
                // until the tail has consumed the re-citation's position.
                let mut reviving = self.reviving.lock();
                if let Some(mark) = (*q).reviving.get() {
                    let n = (*q).increments.queue.capacity();
                    let consumed = ((*q).increments.queue.tail() + n - tail) % n;
                    let revive = (mark + n - tail) % n;
                    if consumed < revive {
                        *reviving = true;
                    } else {
                        (*q).reviving.set(None);
                    }
                }
                drop(reviving);
            }
            if (*q).done.get() >= 0 {
                (*q).done.set((*q).done.get() + 1);
                if (*q).done.get() >= 3 {
                    *pp = (*q).next;
                    drop(Box::from_raw(q));
                    self.threads_cond.notify_all();
                    continue;
                }
            }
            pp = &mut (*q).next;
        }
    }
}

fn collector_main(engine: Arc<Engine>) {
    debug!("collector starting");
    let mut collector = Collector::new();
    loop {
        if engine.collector.next() {
            break;
        }
        *engine.reviving.lock() = false;
        unsafe {
            engine.epoch(&mut collector);
            collector.collect(&engine);
        }
        engine.heap.flush();
    }
    debug!("collector quitting");
    engine.collector.exit();
}

fn finalizer_main(engine: Arc<Engine>) {
    debug!("finalizer starting");
    let mutator = engine.attach_internal(true);
    loop {
        {
            let mut reg = engine.threads.lock();
            reg.finalizer_sleeping = true;
        }
        if engine.finalizer.next() {
            break;
        }
        {
            let mut reg = engine.threads.lock();
            reg.finalizer_sleeping = false;
            reg.finalizer_awaken = 2;
        }
        loop {
            let p = engine.finalizer_queue.lock().pop_front();
            let Some(p) = p else {
                break;
            };
            let p = p as *mut Object;
            unsafe {
                (*p).suppress_finalize();
                let finalize = *engine.finalize_fn.lock();
                if let Some(finalize) = finalize {
                    finalize(p);
                }
                thread::push_decrement(p);
            }
        }
    }
    drop(mutator);
    debug!("finalizer quitting");
    engine.finalizer.exit();
}

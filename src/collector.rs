use std::ptr::null_mut;
use std::sync::atomic::Ordering;

use crate::engine::Engine;
use crate::object::{Color, Object};

// Two-pointer sentinel standing in for an `Object` at the head of the
// purple-root list; only `next`/`previous` are ever touched through it, which
// is why those fields lead the object header.
#[repr(C)]
struct RootsHead {
    next: *mut Object,
    previous: *mut Object,
}

/// Collector-thread state: the purple-root list, the traversal stack threaded
/// through object `scan` links, the cycle being built, and the list of fully
/// identified cycles awaiting condemnation. Counts and colors are applied
/// exclusively from here.
pub(crate) struct Collector {
    roots: Box<RootsHead>,
    scan_stack: *mut Object,
    cycle: *mut Object,
    cycles: *mut Object,
    lower: usize,
}

impl Collector {
    pub(crate) fn new() -> Collector {
        let mut collector = Collector {
            roots: Box::new(RootsHead {
                next: null_mut(),
                previous: null_mut(),
            }),
            scan_stack: null_mut(),
            cycle: null_mut(),
            cycles: null_mut(),
            lower: usize::MAX,
        };
        let sentinel = collector.sentinel();
        collector.roots.next = sentinel;
        collector.roots.previous = sentinel;
        collector
    }

    fn sentinel(&mut self) -> *mut Object {
        &mut *self.roots as *mut RootsHead as *mut Object
    }

    unsafe fn append_root(&mut self, p: *mut Object) {
        let s = self.sentinel();
        (*p).next = s;
        (*p).previous = (*s).previous;
        (*(*p).previous).next = p;
        (*s).previous = p;
    }

    unsafe fn unlink(&mut self, p: *mut Object) {
        (*(*p).previous).next = (*p).next;
        (*(*p).next).previous = (*p).previous;
        (*p).next = null_mut();
        (*p).previous = null_mut();
    }

    unsafe fn push_scan(&mut self, p: *mut Object) {
        (*p).scan = self.scan_stack;
        self.scan_stack = p;
    }

    // Depth-first traversal: `step` processes one object and pushes
    // discovered neighbours through `push_scan`.
    unsafe fn walk(&mut self, p: *mut Object, step: unsafe fn(&mut Collector, *mut Object)) {
        let mut p = p;
        loop {
            step(self, p);
            let q = self.scan_stack;
            if q.is_null() {
                break;
            }
            self.scan_stack = (*q).scan;
            p = q;
        }
    }

    // Applies `push` to every outgoing edge of `p`: the extension's synthetic
    // slots first, then the payload slots declared by the type descriptor.
    unsafe fn step(&mut self, p: *mut Object, push: unsafe fn(&mut Collector, *mut Object)) {
        let ext = (*p).extension.load(Ordering::Acquire);
        if !ext.is_null() {
            (*ext).scan(&mut |slot| {
                let q = slot.raw();
                if !q.is_null() {
                    push(self, q);
                }
            });
        }
        let ty = (*p).ty();
        debug_assert!(!ty.is_null(), "scanned an unfinished object");
        ((*ty).scan)(p, &mut |slot| {
            let q = slot.raw();
            if !q.is_null() {
                push(self, q);
            }
        });
    }

    pub(crate) unsafe fn increment(&mut self, p: *mut Object) {
        (*p).count += 1;
        (*p).color = Color::Black;
    }

    /// Applies one decrement. A surviving object becomes a purple cycle
    /// candidate; a dead one is released transitively. Members of a pending
    /// cycle are left for condemnation to resolve.
    pub(crate) unsafe fn decrement(&mut self, p: *mut Object, engine: &Engine) {
        debug_assert!((*p).count > 0, "count underflow: token queue corruption");
        (*p).count -= 1;
        if (*p).count > 0 {
            (*p).color = Color::Purple;
            if (*p).next.is_null() {
                self.append_root(p);
            }
        } else if !matches!((*p).color, Color::Orange | Color::Red) {
            self.release(p, engine);
        }
    }

    unsafe fn decrement_push(&mut self, q: *mut Object) {
        debug_assert!((*q).count > 0, "count underflow: token queue corruption");
        (*q).count -= 1;
        if (*q).count > 0 {
            (*q).color = Color::Purple;
            if (*q).next.is_null() {
                self.append_root(q);
            }
        } else if !matches!((*q).color, Color::Orange | Color::Red) {
            self.push_scan(q);
        }
    }

    // Frees `p` and transitively every object whose count its slots were
    // keeping alive. Finalizees are pinned and handed over instead.
    unsafe fn release(&mut self, p: *mut Object, engine: &Engine) {
        let mut p = p;
        loop {
            self.release_step(p, engine);
            let q = self.scan_stack;
            if q.is_null() {
                break;
            }
            self.scan_stack = (*q).scan;
            p = q;
        }
    }

    unsafe fn release_step(&mut self, p: *mut Object, engine: &Engine) {
        if !(*p).next.is_null() {
            self.unlink(p);
        }
        if (*p).is_finalizee() && !engine.finalizer_quitting() {
            (*p).count = 1;
            (*p).color = Color::Black;
            engine.finalizer_enqueue(p);
            engine.wake_finalizer();
            return;
        }
        let ext = (*p).extension.swap(null_mut(), Ordering::Acquire);
        if !ext.is_null() {
            (*ext).scan(&mut |slot| {
                let q = slot.raw();
                if !q.is_null() {
                    self.decrement_push(q);
                    slot.raw_clear();
                }
            });
            drop(Box::from_raw(ext));
        }
        let ty = (*p).ty();
        debug_assert!(!ty.is_null(), "released an unfinished object");
        ((*ty).scan)(p, &mut |slot| {
            let q = slot.raw();
            if !q.is_null() {
                self.decrement_push(q);
                slot.raw_clear();
            }
        });
        engine.heap().free(p);
        engine.note_released();
    }

    /// One cycle-detection pass: condemn last epoch's cycles, then, when the
    /// heap has grown past the threshold since the low-water mark, run
    /// mark-gray / scan-gray / collect-white over the purple roots and
    /// re-count the freshly identified cycles.
    pub(crate) unsafe fn collect(&mut self, engine: &Engine) {
        self.condemn(engine);
        let sentinel = self.sentinel();
        if (*sentinel).next == sentinel {
            return;
        }
        let live = engine.heap().live();
        if live < self.lower {
            self.lower = live;
        }
        if live - self.lower < engine.threshold() {
            return;
        }
        self.lower = live;
        engine.note_collect_cycle();
        tracing::trace!(live, "running cycle detection");

        let mut q = (*sentinel).next;
        while q != sentinel {
            let next = (*q).next;
            debug_assert!((*q).count > 0);
            if (*q).color == Color::Purple {
                self.mark_gray(q);
            } else {
                self.unlink(q);
            }
            q = next;
        }

        let mut p = (*sentinel).next;
        while p != sentinel {
            self.scan_gray(p);
            p = (*p).next;
        }

        while (*sentinel).next != sentinel {
            let p = (*sentinel).next;
            self.unlink(p);
            if (*p).color == Color::White {
                self.collect_white(p);
                (*self.cycle).next_cycle = self.cycles;
                self.cycles = self.cycle;
            }
        }

        self.recount();
    }

    // Phase 1. Colors the graph reachable from a purple root gray, seeding
    // each node's scratch count from its citation count and discharging one
    // unit per internal edge observed.
    unsafe fn mark_gray(&mut self, p: *mut Object) {
        (*p).color = Color::Gray;
        (*p).cyclic = (*p).count;
        self.walk(p, Collector::mark_gray_step);
    }

    unsafe fn mark_gray_step(&mut self, p: *mut Object) {
        self.step(p, Collector::mark_gray_push);
    }

    unsafe fn mark_gray_push(&mut self, q: *mut Object) {
        if (*q).color != Color::Gray {
            (*q).color = Color::Gray;
            (*q).cyclic = (*q).count;
            self.push_scan(q);
        }
        debug_assert!((*q).cyclic > 0);
        (*q).cyclic -= 1;
    }

    // Phase 2. A gray node with surviving external citations resurrects its
    // whole subgraph black; otherwise the subgraph whitens.
    unsafe fn scan_gray(&mut self, p: *mut Object) {
        if (*p).color != Color::Gray {
            return;
        }
        if (*p).cyclic > 0 {
            (*p).color = Color::Black;
            self.walk(p, Collector::scan_black_step);
        } else {
            self.walk(p, Collector::scan_gray_step);
        }
    }

    unsafe fn scan_black_step(&mut self, p: *mut Object) {
        self.step(p, Collector::scan_black_push);
    }

    unsafe fn scan_black_push(&mut self, q: *mut Object) {
        if (*q).color == Color::Black {
            return;
        }
        (*q).color = Color::Black;
        self.push_scan(q);
    }

    unsafe fn scan_gray_step(&mut self, p: *mut Object) {
        if (*p).color == Color::Black {
            self.step(p, Collector::scan_gray_scan_black_push);
        } else {
            (*p).color = Color::White;
            self.step(p, Collector::scan_gray_push);
        }
    }

    unsafe fn scan_gray_scan_black_push(&mut self, q: *mut Object) {
        if (*q).color == Color::Black {
            return;
        }
        if (*q).color != Color::Whiting {
            self.push_scan(q);
        }
        (*q).color = Color::Black;
    }

    unsafe fn scan_gray_push(&mut self, q: *mut Object) {
        if (*q).color != Color::Gray {
            return;
        }
        (*q).color = if (*q).cyclic > 0 {
            Color::Black
        } else {
            Color::Whiting
        };
        self.push_scan(q);
    }

    // Phase 3. Links a white subgraph into one orange ring through the `next`
    // pointers, rooted at `self.cycle`.
    unsafe fn collect_white(&mut self, p: *mut Object) {
        (*p).color = Color::Orange;
        (*p).next = p;
        self.cycle = p;
        self.walk(p, Collector::collect_white_step);
    }

    unsafe fn collect_white_step(&mut self, p: *mut Object) {
        self.step(p, Collector::collect_white_push);
    }

    unsafe fn collect_white_push(&mut self, q: *mut Object) {
        if (*q).color != Color::White {
            return;
        }
        (*q).color = Color::Orange;
        (*q).next = (*self.cycle).next;
        (*self.cycle).next = q;
        self.push_scan(q);
    }

    // Phase 4. Re-derives each ring node's external-citation count: paint the
    // ring red, discharge one unit of `cyclic` per internal edge, and restore
    // orange. Condemnation next epoch aborts on any node left with
    // `cyclic > 0`.
    unsafe fn recount(&mut self) {
        let mut cycle = self.cycles;
        while !cycle.is_null() {
            let mut p = cycle;
            loop {
                (*p).color = Color::Red;
                (*p).cyclic = (*p).count;
                p = (*p).next;
                if p == cycle {
                    break;
                }
            }
            let mut p = cycle;
            loop {
                self.step(p, Collector::scan_red);
                p = (*p).next;
                if p == cycle {
                    break;
                }
            }
            let mut p = cycle;
            loop {
                (*p).color = Color::Orange;
                p = (*p).next;
                if p == cycle {
                    break;
                }
            }
            cycle = (*cycle).next_cycle;
        }
    }

    unsafe fn scan_red(&mut self, q: *mut Object) {
        if (*q).color == Color::Red && (*q).cyclic > 0 {
            (*q).cyclic -= 1;
        }
    }

    // Walks last epoch's pending cycles under the reviving mutex. A cycle
    // whose nodes all stayed orange with no external citations and no armed
    // weak-handle slot during a revival window is condemned; anything else is
    // rerooted.
    unsafe fn condemn(&mut self, engine: &Engine) {
        while !self.cycles.is_null() {
            let reviving = engine.reviving_mutex().lock();
            let cycle = self.cycles;
            self.cycles = (*cycle).next_cycle;

            let mut mutated = false;
            let mut p = cycle;
            loop {
                if (*p).color != Color::Orange || (*p).cyclic > 0 {
                    mutated = true;
                    break;
                }
                if *reviving && !(*p).extension.load(Ordering::Acquire).is_null() {
                    // A revival is in flight somewhere; any weakly-referenced
                    // node makes this cycle suspect until the window closes.
                    mutated = true;
                    break;
                }
                p = (*p).next;
                if p == cycle {
                    break;
                }
            }

            if mutated {
                self.reinsert(cycle, engine);
                drop(reviving);
                continue;
            }

            let mut finalizee = false;
            let mut p = cycle;
            loop {
                if (*p).is_finalizee() {
                    finalizee = true;
                    break;
                }
                p = (*p).next;
                if p == cycle {
                    break;
                }
            }

            if finalizee && !engine.finalizer_quitting() {
                // Dismantle the ring, clear non-final weak handles, and pin
                // every finalizee for the finalizer thread.
                let mut p = cycle;
                loop {
                    let q = (*p).next;
                    let ext = (*p).extension.load(Ordering::Acquire);
                    if !ext.is_null() {
                        (*ext).detach();
                    }
                    (*p).color = Color::Black;
                    (*p).next = null_mut();
                    (*p).previous = null_mut();
                    if (*p).is_finalizee() {
                        (*p).count += 1;
                        engine.finalizer_enqueue(p);
                    }
                    p = q;
                    if p == cycle {
                        break;
                    }
                }
                engine.wake_finalizer();
            } else {
                let mut p = cycle;
                loop {
                    (*p).color = Color::Red;
                    p = (*p).next;
                    if p == cycle {
                        break;
                    }
                }
                let mut p = cycle;
                loop {
                    self.cyclic_decrement(p, engine);
                    p = (*p).next;
                    if p == cycle {
                        break;
                    }
                }
                let mut p = cycle;
                loop {
                    let q = (*p).next;
                    engine.heap().free(p);
                    engine.note_collected();
                    p = q;
                    if p == cycle {
                        break;
                    }
                }
            }
            drop(reviving);
        }
    }

    // Reroots the survivors of an aborted cycle. Nodes whose count reached
    // zero while the cycle was pending are stashed and released only after
    // the ring is dismantled, so the ring walk never follows a freed link.
    unsafe fn reinsert(&mut self, cycle: *mut Object, engine: &Engine) {
        let mut dead = Vec::new();
        let mut first = true;
        let mut p = cycle;
        loop {
            let q = (*p).next;
            (*p).next = null_mut();
            (*p).previous = null_mut();
            if (*p).count == 0 {
                dead.push(p);
            } else if (*p).color == Color::Purple {
                self.append_root(p);
            } else if first && (*p).color == Color::Orange {
                (*p).color = Color::Purple;
                self.append_root(p);
            } else {
                (*p).color = Color::Black;
            }
            first = false;
            p = q;
            if p == cycle {
                break;
            }
        }
        for p in dead {
            self.release(p, engine);
        }
    }

    // Removes one node's outgoing citations while its whole ring dies
    // together: edges into the ring discharge the scratch counts, edges out
    // of it are ordinary decrements.
    unsafe fn cyclic_decrement(&mut self, p: *mut Object, engine: &Engine) {
        let ext = (*p).extension.swap(null_mut(), Ordering::Acquire);
        if !ext.is_null() {
            (*ext).scan(&mut |slot| {
                let q = slot.raw();
                if !q.is_null() {
                    self.cyclic_decrement_push(q, engine);
                    slot.raw_clear();
                }
            });
            drop(Box::from_raw(ext));
        }
        let ty = (*p).ty();
        debug_assert!(!ty.is_null());
        ((*ty).scan)(p, &mut |slot| {
            let q = slot.raw();
            if !q.is_null() {
                self.cyclic_decrement_push(q, engine);
                slot.raw_clear();
            }
        });
    }

    unsafe fn cyclic_decrement_push(&mut self, q: *mut Object, engine: &Engine) {
        match (*q).color {
            Color::Red => {}
            Color::Orange => {
                (*q).count -= 1;
                (*q).cyclic -= 1;
            }
            _ => self.decrement(q, engine),
        }
    }
}

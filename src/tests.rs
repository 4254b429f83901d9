use std::mem::size_of;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handles::{DependentHandle, NormalHandle, WeakHandle};
use crate::object::{Object, Type};
use crate::slot::{Local, Slot};
use crate::{Engine, Options};

#[repr(C)]
struct Node {
    next: Slot,
    previous: Slot,
    value: usize,
}

unsafe fn scan_node(p: *mut Object, visit: &mut dyn FnMut(&Slot)) {
    let node = (*p).payload::<Node>();
    visit(&node.next);
    visit(&node.previous);
}

static NODE: Type = Type {
    name: "node",
    size: size_of::<Node>(),
    finalizee: false,
    scan: scan_node,
};

static FINAL_NODE: Type = Type {
    name: "final-node",
    size: size_of::<Node>(),
    finalizee: true,
    scan: scan_node,
};

fn engine() -> Arc<Engine> {
    Engine::new(Options {
        verbose: false,
        threshold: 16,
    })
}

fn new_node(engine: &Engine, ty: &'static Type, extra: usize, value: usize) -> *mut Object {
    engine.allocate(ty, extra, |raw| unsafe {
        raw.cast::<Node>().write(Node {
            next: Slot::null(),
            previous: Slot::null(),
            value,
        });
    })
}

unsafe fn value_of(p: *mut Object) -> usize {
    (*p).payload::<Node>().value
}

fn lcg(seed: &mut usize) -> usize {
    *seed = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *seed >> 33
}

#[test_log::test]
fn allocate_and_release() {
    let engine = engine();
    let mutator = engine.attach();
    let mut locals = Vec::new();
    for i in 0..10_000 {
        locals.push(Local::new(new_node(&engine, &NODE, 0, i)));
    }
    drop(locals);
    engine.collect();
    assert!(engine.statistics().released >= 10_000);
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
    assert_eq!(engine.live(), 0);
}

#[test_log::test]
fn cyclic_ring_is_collected() {
    let engine = engine();
    let mutator = engine.attach();
    // Mid-size cells: header + payload + slack lands in the 1 KiB class.
    let mut locals = Vec::new();
    for i in 0..1024 {
        locals.push(Local::new(new_node(&engine, &NODE, 600, i)));
    }
    for i in 0..1024 {
        let a = locals[i].get();
        let b = locals[(i + 1) % 1024].get();
        unsafe {
            (*a).payload::<Node>().next.set(b);
            (*b).payload::<Node>().previous.set(a);
        }
    }
    drop(locals);
    engine.collect();
    engine.collect();
    assert_eq!(engine.statistics().collected, 1024);
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn self_cycle_is_collected() {
    let engine = engine();
    let mutator = engine.attach();
    let local = Local::new(new_node(&engine, &NODE, 0, 1));
    unsafe {
        (*local.get()).payload::<Node>().next.set(local.get());
    }
    drop(local);
    engine.collect();
    engine.collect();
    assert_eq!(engine.statistics().collected, 1);
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn normal_handle_pins_its_target() {
    let engine = engine();
    let mutator = engine.attach();
    let handle = {
        let local = Local::new(new_node(&engine, &NODE, 0, 5));
        NormalHandle::new(local.get())
    };
    engine.collect();
    let target = handle.target();
    assert_eq!(unsafe { value_of(target.get()) }, 5);
    drop(target);
    drop(handle);
    engine.collect();
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn weak_handle_is_cleared() {
    let engine = engine();
    let mutator = engine.attach();
    let local = Local::new(new_node(&engine, &NODE, 0, 7));
    let weak = WeakHandle::new(&engine, local.get(), false);
    {
        let strong = weak.target().expect("target still strongly held");
        assert_eq!(unsafe { value_of(strong.get()) }, 7);
    }
    drop(local);
    engine.collect();
    engine.collect();
    assert!(weak.target().is_none());
    drop(weak);
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn weak_revival_pins_the_target() {
    let engine = engine();
    let mutator = engine.attach();
    let local = Local::new(new_node(&engine, &NODE, 0, 11));
    let weak = WeakHandle::new(&engine, local.get(), false);
    drop(local);
    // Revive before the collector gets to condemn the object.
    let revived = weak.target().expect("revival while still pending");
    engine.collect();
    assert_eq!(unsafe { value_of(revived.get()) }, 11);
    assert!(weak.target().is_some());
    drop(revived);
    engine.collect();
    engine.collect();
    assert!(weak.target().is_none());
    drop(weak);
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

static FINALIZED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn record_finalized(p: *mut Object) {
    FINALIZED.lock().push(unsafe { value_of(p) });
}

#[test_log::test]
fn finalizer_sees_each_finalizee_once() {
    const TAG: usize = 0xF1A7;
    let engine = engine();
    engine.set_finalize(record_finalized);
    let mutator = engine.attach();
    let a = Local::new(new_node(&engine, &NODE, 0, 1));
    let b = Local::new(new_node(&engine, &FINAL_NODE, 0, TAG));
    unsafe {
        (*a.get()).payload::<Node>().next.set(b.get());
        (*b.get()).payload::<Node>().next.set(a.get());
    }
    drop(a);
    drop(b);
    engine.collect();
    engine.finalize();
    engine.collect();
    let seen = FINALIZED
        .lock()
        .iter()
        .filter(|&&value| value == TAG)
        .count();
    assert_eq!(seen, 1);
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

static RESCUE: Slot = Slot::null();

fn rescue_finalizee(p: *mut Object) {
    RESCUE.set(p);
}

#[test_log::test]
fn finalizer_resurrection_does_not_double_free() {
    const TAG: usize = 0x5E5C;
    let engine = engine();
    engine.set_finalize(rescue_finalizee);
    let mutator = engine.attach();
    let local = Local::new(new_node(&engine, &FINAL_NODE, 0, TAG));
    drop(local);
    engine.collect();
    engine.finalize();
    engine.collect();
    // The finalizer wrote the object into a surviving slot; it must be alive.
    let rescued = RESCUE.get();
    assert!(!rescued.is_null());
    assert_eq!(unsafe { value_of(rescued) }, TAG);
    RESCUE.clear();
    engine.collect();
    engine.collect();
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn dependent_handle_keeps_secondary_alive() {
    let engine = engine();
    let mutator = engine.attach();
    let primary = Local::new(new_node(&engine, &NODE, 0, 1));
    let secondary = Local::new(new_node(&engine, &NODE, 0, 2));
    let dependent = DependentHandle::new(&engine, primary.get(), secondary.get());
    drop(secondary);
    engine.collect();
    // While the primary is strongly held the secondary stays live.
    assert!(!dependent.secondary().is_null());
    assert_eq!(unsafe { value_of(dependent.secondary()) }, 2);
    assert!(dependent.target().is_some());
    drop(primary);
    engine.collect();
    engine.collect();
    assert!(dependent.target().is_none());
    drop(dependent);
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn pointer_queries_are_exact() {
    let engine = engine();
    let mutator = engine.attach();
    let local = Local::new(new_node(&engine, &NODE, 0, 1));
    let addr = local.get() as usize;
    assert_eq!(engine.find(addr), Some(local.get()));
    assert_eq!(engine.find(addr + 1), None);
    let stack_addr = &mutator as *const _ as usize;
    assert_eq!(engine.find(stack_addr), None);
    drop(local);
    drop(mutator);
    engine.shutdown();
}

#[test_log::test]
fn large_objects_go_through_the_same_lifecycle() {
    let engine = engine();
    let mutator = engine.attach();
    let local = Local::new(new_node(&engine, &NODE, 32 * 1024, 3));
    assert_eq!(engine.find(local.get() as usize), Some(local.get()));
    drop(local);
    engine.collect();
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn concurrent_mutators_transfer_through_shared_slots() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 20_000;
    let engine = engine();
    let slots: Arc<Vec<Slot>> = Arc::new((0..64).map(|_| Slot::null()).collect());

    let mut workers = Vec::new();
    for t in 0..THREADS {
        let engine = Arc::clone(&engine);
        let slots = Arc::clone(&slots);
        workers.push(std::thread::spawn(move || {
            let mutator = engine.attach();
            let mut seed = t.wrapping_mul(0x9E3779B97F4A7C15) + 1;
            for i in 0..PER_THREAD {
                let local = Local::new(new_node(&engine, &NODE, 0, t * PER_THREAD + i));
                let a = lcg(&mut seed) % slots.len();
                let b = lcg(&mut seed) % slots.len();
                slots[a].copy_from(local.slot());
                match lcg(&mut seed) % 3 {
                    0 => slots[b].copy_from(&slots[a]),
                    1 => slots[b].take_from(&slots[a]),
                    _ => slots[b].clear(),
                }
                drop(local);
            }
            drop(mutator);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let mutator = engine.attach();
    engine.collect();
    engine.collect();
    // Every surviving slot target must still read back a value some thread
    // wrote; anything else is a premature free.
    let mut survivors = std::collections::HashSet::new();
    for slot in slots.iter() {
        let p = slot.get();
        if !p.is_null() {
            assert!(unsafe { value_of(p) } < THREADS * PER_THREAD);
            survivors.insert(p as usize);
        }
    }
    drop(mutator);
    assert_eq!(engine.live(), survivors.len());

    let mutator = engine.attach();
    for slot in slots.iter() {
        slot.clear();
    }
    engine.collect();
    drop(mutator);
    assert_eq!(engine.live(), 0);
    engine.shutdown();
}

#[test_log::test]
fn shutdown_drains_everything() {
    let engine = engine();
    let mutator = engine.attach();
    let mut locals = Vec::new();
    for i in 0..256 {
        locals.push(Local::new(new_node(&engine, &NODE, 0, i)));
    }
    // Half of them form cycles, half stay acyclic.
    for pair in locals.chunks(2) {
        if let [a, b] = pair {
            unsafe {
                (*a.get()).payload::<Node>().next.set(b.get());
                (*b.get()).payload::<Node>().next.set(a.get());
            }
        }
    }
    drop(locals);
    drop(mutator);
    engine.shutdown();
    assert_eq!(engine.live(), 0);
}

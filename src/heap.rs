use std::cell::Cell;
use std::collections::BTreeMap;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::mmap;
use crate::object::{Object, LARGE_RANK};
use crate::thread::MaskEpochSignal;

pub(crate) const RANKS: usize = 7;

// Objects per block for each class; stride is 128 << rank, so every block
// except the last two spans 8 MiB down to 128 KiB.
const BLOCK_COUNTS: [usize; RANKS] = [1024 * 64, 1024 * 16, 1024 * 4, 1024, 256, 64, 16];

thread_local! {
    // Per-rank free-list heads. Mutators allocate from their own lists;
    // the collector frees onto its own and publishes them as chunks.
    static HEADS: [Cell<*mut Object>; RANKS] =
        const { [const { Cell::new(null_mut()) }; RANKS] };
}

struct BlockInfo {
    len: usize,
    rank: usize,
}

struct Blocks {
    map: BTreeMap<usize, BlockInfo>,
}

// One segregated class. `chunks` is a lock-free LIFO of free-object chains
// linked through `previous`, each chain's length tagged in its head object's
// `cyclic` field. `returned` and `freed` are written by the collector only.
struct SizeClass {
    rank: usize,
    count: usize,
    chunks: CachePadded<AtomicPtr<Object>>,
    grown: AtomicUsize,
    allocated: AtomicUsize,
    returned: AtomicUsize,
    freed: AtomicUsize,
}

impl SizeClass {
    fn new(rank: usize) -> SizeClass {
        SizeClass {
            rank,
            count: BLOCK_COUNTS[rank],
            chunks: CachePadded::new(AtomicPtr::new(null_mut())),
            grown: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }

    fn stride(&self) -> usize {
        128 << self.rank
    }

    // Pops one chunk, growing a fresh block when permitted. Returns null when
    // the stack is empty and `heap` is None (the intra-collector guard).
    fn pop_chunk(&self, heap: Option<&Heap>) -> *mut Object {
        let mut p = self.chunks.load(Ordering::Acquire);
        while !p.is_null() {
            let prev = unsafe { (*p).previous };
            match self
                .chunks
                .compare_exchange_weak(p, prev, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(q) => p = q,
            }
        }
        if p.is_null() {
            let Some(heap) = heap else {
                return null_mut();
            };
            p = self.grow(heap);
        }
        self.allocated
            .fetch_add(unsafe { (*p).cyclic }, Ordering::Relaxed);
        p
    }

    // Maps a new block, threads its objects into one chunk, and registers it
    // with SIGUSR1 masked so the epoch handler cannot land inside the
    // registry critical section.
    fn grow(&self, heap: &Heap) -> *mut Object {
        let stride = self.stride();
        let len = stride * self.count;
        let block = mmap::map(len);
        unsafe {
            let mut q = block;
            for _ in 1..self.count {
                let obj = q as *mut Object;
                (*obj).next = q.add(stride) as *mut Object;
                (*obj).rank = self.rank;
                q = q.add(stride);
            }
            let last = q as *mut Object;
            (*last).next = null_mut();
            (*last).rank = self.rank;
            let head = block as *mut Object;
            (*head).cyclic = self.count;
            {
                let _mask = MaskEpochSignal::new();
                let mut blocks = heap.blocks.lock();
                blocks.map.insert(
                    block as usize,
                    BlockInfo {
                        len,
                        rank: self.rank,
                    },
                );
            }
            self.grown.fetch_add(self.count, Ordering::Relaxed);
            head
        }
    }

    // Publishes a chain of `n` free objects as one chunk.
    fn push_chunk(&self, head: *mut Object, n: usize) {
        unsafe {
            (*head).cyclic = n;
            let mut prev = self.chunks.load(Ordering::Relaxed);
            loop {
                (*head).previous = prev;
                match self.chunks.compare_exchange_weak(
                    prev,
                    head,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(q) => prev = q,
                }
            }
        }
        self.returned.fetch_add(n, Ordering::Relaxed);
    }

    fn live(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
            - self.returned.load(Ordering::Relaxed)
            - self.freed.load(Ordering::Relaxed)
    }
}

/// Per-class allocation statistics: `(grown, allocated, returned)` for each
/// rank, plus individually mapped totals.
#[derive(Clone, Debug, Default)]
pub struct HeapStatistics {
    pub ranks: [(usize, usize, usize); RANKS],
    pub large_allocated: usize,
    pub large_freed: usize,
}

/// Segregated size-class heap with a block registry for conservative pointer
/// queries.
pub struct Heap {
    classes: [SizeClass; RANKS],
    blocks: Mutex<Blocks>,
    large_allocated: AtomicUsize,
    large_freed: AtomicUsize,
    // Engine-supplied hook: lets an allocating mutator wait out one collector
    // epoch before growth is retried.
    wait: Box<dyn Fn() + Send + Sync>,
}

fn rank_of(size: usize) -> usize {
    let mut n = size >> 7;
    let mut rank = 0;
    while n != 0 {
        n >>= 1;
        rank += 1;
        if rank == RANKS {
            return LARGE_RANK;
        }
    }
    rank
}

impl Heap {
    pub(crate) fn new(wait: Box<dyn Fn() + Send + Sync>) -> Heap {
        Heap {
            classes: std::array::from_fn(SizeClass::new),
            blocks: Mutex::new(Blocks {
                map: BTreeMap::new(),
            }),
            large_allocated: AtomicUsize::new(0),
            large_freed: AtomicUsize::new(0),
            wait,
        }
    }

    /// Allocates a cell whose stride exceeds `size` (header included).
    pub(crate) fn allocate(&self, size: usize) -> *mut Object {
        let rank = rank_of(size);
        if rank == LARGE_RANK {
            return self.allocate_large(size);
        }
        let class = &self.classes[rank];
        HEADS.with(|heads| {
            let head = &heads[rank];
            let mut p = head.get();
            if p.is_null() {
                p = class.pop_chunk(None);
                if p.is_null() {
                    (self.wait)();
                    p = class.pop_chunk(Some(self));
                }
            }
            unsafe {
                head.set((*p).next);
            }
            p
        })
    }

    fn allocate_large(&self, size: usize) -> *mut Object {
        let p = mmap::map(size) as *mut Object;
        unsafe {
            (*p).rank = LARGE_RANK;
        }
        {
            let _mask = MaskEpochSignal::new();
            let mut blocks = self.blocks.lock();
            blocks.map.insert(
                p as usize,
                BlockInfo {
                    len: size,
                    rank: LARGE_RANK,
                },
            );
        }
        self.large_allocated.fetch_add(1, Ordering::Relaxed);
        p
    }

    /// Returns a cell to its class. Collector thread only.
    pub(crate) fn free(&self, p: *mut Object) {
        let rank = unsafe { (*p).rank };
        if rank == LARGE_RANK {
            let len = {
                let mut blocks = self.blocks.lock();
                let info = blocks
                    .map
                    .remove(&(p as usize))
                    .expect("freeing an unregistered large object");
                info.len
            };
            unsafe {
                mmap::unmap(p as *mut u8, len);
            }
            self.large_freed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let class = &self.classes[rank];
        HEADS.with(|heads| unsafe {
            (*p).next = heads[rank].get();
            heads[rank].set(p);
        });
        let freed = class.freed.load(Ordering::Relaxed) + 1;
        class.freed.store(freed, Ordering::Relaxed);
        if freed >= class.count {
            self.flush_rank(rank);
        }
    }

    fn flush_rank(&self, rank: usize) {
        let class = &self.classes[rank];
        let n = class.freed.load(Ordering::Relaxed);
        HEADS.with(|heads| {
            let head = heads[rank].get();
            if head.is_null() {
                return;
            }
            class.push_chunk(head, n);
            heads[rank].set(null_mut());
        });
        class.freed.store(0, Ordering::Relaxed);
    }

    /// Publishes the collector's deferred free lists. Called once per epoch.
    pub(crate) fn flush(&self) {
        for rank in 0..RANKS {
            if self.classes[rank].freed.load(Ordering::Relaxed) > 0 {
                self.flush_rank(rank);
            }
        }
    }

    /// Publishes whatever is left on the calling thread's free lists; used at
    /// mutator detach and shutdown. List lengths are unknown here, so they
    /// are counted by walking.
    pub(crate) fn return_thread_local(&self) {
        HEADS.with(|heads| {
            for rank in 0..RANKS {
                let head = heads[rank].get();
                if head.is_null() {
                    continue;
                }
                let mut n = 0;
                let mut p = head;
                while !p.is_null() {
                    n += 1;
                    p = unsafe { (*p).next };
                }
                self.classes[rank].push_chunk(head, n);
                heads[rank].set(null_mut());
            }
        });
    }

    /// Conservative pointer query: `Some` iff `addr` is the start of a cell
    /// inside a registered block.
    pub(crate) fn find(&self, addr: usize) -> Option<*mut Object> {
        let blocks = self.blocks.lock();
        let (&start, info) = blocks.map.range(..=addr).next_back()?;
        let offset = addr - start;
        if offset >= info.len {
            return None;
        }
        if info.rank == LARGE_RANK {
            return (offset == 0).then_some(addr as *mut Object);
        }
        let stride = 128usize << info.rank;
        (offset % stride == 0).then_some(addr as *mut Object)
    }

    pub(crate) fn live(&self) -> usize {
        self.classes.iter().map(SizeClass::live).sum::<usize>()
            + self.large_allocated.load(Ordering::Relaxed)
            - self.large_freed.load(Ordering::Relaxed)
    }

    pub(crate) fn statistics(&self) -> HeapStatistics {
        let mut stats = HeapStatistics::default();
        for (rank, class) in self.classes.iter().enumerate() {
            stats.ranks[rank] = (
                class.grown.load(Ordering::Relaxed),
                class.allocated.load(Ordering::Relaxed),
                class.returned.load(Ordering::Relaxed) + class.freed.load(Ordering::Relaxed),
            );
        }
        stats.large_allocated = self.large_allocated.load(Ordering::Relaxed);
        stats.large_freed = self.large_freed.load(Ordering::Relaxed);
        stats
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let blocks = self.blocks.get_mut();
        for (&start, info) in blocks.map.iter() {
            unsafe {
                mmap::unmap(start as *mut u8, info.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_selection() {
        assert_eq!(rank_of(1), 0);
        assert_eq!(rank_of(64), 0);
        assert_eq!(rank_of(127), 0);
        assert_eq!(rank_of(128), 1);
        assert_eq!(rank_of(255), 1);
        assert_eq!(rank_of(1000), 3);
        assert_eq!(rank_of(8191), 6);
        assert_eq!(rank_of(8192), LARGE_RANK);
    }

    #[test]
    fn allocate_free_reuse() {
        let heap = Heap::new(Box::new(|| {}));
        let a = heap.allocate(64);
        let b = heap.allocate(64);
        assert_ne!(a, b);
        assert_eq!(heap.live(), BLOCK_COUNTS[0]);
        heap.free(a);
        heap.free(b);
        heap.flush();
        // The freed cells went back to the class; a fresh pop must reuse one.
        let c = heap.allocate(64);
        assert!(c == a || c == b);
        assert_eq!(unsafe { (*c).rank }, 0);
    }

    #[test]
    fn find_is_exact() {
        let heap = Heap::new(Box::new(|| {}));
        let a = heap.allocate(64);
        let addr = a as usize;
        assert_eq!(heap.find(addr), Some(a));
        assert_eq!(heap.find(addr + 1), None);
        assert_eq!(heap.find(addr + 64), None);
        let outside = 0usize;
        assert_eq!(heap.find(outside), None);
        // Next cell in the same block is a valid header address.
        assert_eq!(heap.find(addr + 128), Some((addr + 128) as *mut Object));
    }

    #[test]
    fn large_objects_are_individually_mapped() {
        let heap = Heap::new(Box::new(|| {}));
        let a = heap.allocate(64 * 1024);
        assert_eq!(unsafe { (*a).rank }, LARGE_RANK);
        assert_eq!(heap.find(a as usize), Some(a));
        assert_eq!(heap.find(a as usize + 128), None);
        assert_eq!(heap.live(), 1);
        heap.free(a);
        assert_eq!(heap.live(), 0);
        assert_eq!(heap.find(a as usize), None);
    }
}

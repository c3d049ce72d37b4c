//! Lock-free multi-producer/multi-consumer work queue.
//!
//! [`ConcurrentQueue`] is a Michael–Scott queue: a singly linked chain that
//! always starts with a sentinel node, where `enqueue` links new nodes after
//! the tail with a compare-and-swap and `dequeue` swings the head past the
//! sentinel, turning the first real node into the new sentinel.
//!
//! # Reclamation and the reuse hazard
//!
//! Retired sentinels are not freed or recycled immediately. They are handed
//! to `crossbeam-epoch`, which runs the recycling step only once no pinned
//! thread can still hold a pointer to them; only then does the node return
//! to the queue's [`NodePool`] for reuse.
//!
//! On top of that every node carries a generation that is bumped each time
//! the pool hands it out again, and every pointer stored in `head`, `tail`
//! or a `next` link carries that generation in its low tag bits. Each CAS
//! therefore compares the (pointer, generation) pair, so a recycled node
//! can never be mistaken for the identity it had before.
//!
//! # Contention
//!
//! Failed CAS attempts are retried internally with a short spin
//! ([`crossbeam_utils::Backoff`]); the only caller-visible outcomes are an
//! item or "currently empty". Retries are counted in [`QueueStats`].

use std::fmt;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};

/// Default number of retired nodes kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// Tuning knobs for a [`ConcurrentQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of retired nodes kept in the free-list pool.
    /// Zero disables recycling entirely.
    pub pool_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

/// One link of the chain. Cache-line aligned, which also leaves the low six
/// pointer bits free for the generation tag.
#[repr(C, align(64))]
struct Node<T> {
    /// Initialized while the node sits behind the sentinel; moved out by
    /// the dequeuer that turns it into the sentinel.
    item: MaybeUninit<T>,
    next: Atomic<Node<T>>,
    generation: u64,
}

impl<T> Node<T> {
    fn empty() -> Self {
        Node {
            item: MaybeUninit::uninit(),
            next: Atomic::null(),
            generation: 0,
        }
    }

    /// Mask of the tag bits available for pointers to this node type.
    #[inline]
    fn tag_mask() -> usize {
        mem::align_of::<Node<T>>() - 1
    }
}

/// A retired node waiting in the pool. Its item slot is always vacant.
struct PooledNode<T>(Box<Node<T>>);

// SAFETY: a pooled node carries no live `T` and its `next` link is reset
// before reuse, so moving it between threads moves nothing but memory.
unsafe impl<T: Send> Send for PooledNode<T> {}

/// Free list of retired nodes, shared with the epoch collector's deferred
/// recycling closures (which can outlive the queue itself).
struct NodePool<T> {
    free: SegQueue<PooledNode<T>>,
    len: AtomicUsize,
    capacity: usize,
}

impl<T> NodePool<T> {
    fn new(capacity: usize) -> Self {
        NodePool {
            free: SegQueue::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Hands out a node holding `item`, reusing a pooled one when possible.
    fn acquire(&self, item: T) -> Owned<Node<T>> {
        match self.free.pop() {
            Some(PooledNode(mut node)) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                node.generation = node.generation.wrapping_add(1);
                node.next = Atomic::null();
                node.item = MaybeUninit::new(item);
                Owned::from(node)
            }
            None => Owned::new(Node {
                item: MaybeUninit::new(item),
                ..Node::empty()
            }),
        }
    }

    /// Takes back a retired node, or frees it if the pool is full.
    fn recycle(&self, node: Box<Node<T>>) {
        if self.reserve_slot() {
            self.free.push(PooledNode(node));
        }
    }

    /// Claims one pool slot, failing once the pool is at capacity. The
    /// check and the increment are a single atomic step.
    fn reserve_slot(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

/// Point-in-time counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Successful enqueues.
    pub enqueued: u64,
    /// Successful dequeues.
    pub dequeued: u64,
    /// CAS retries taken by enqueuers.
    pub enqueue_retries: u64,
    /// CAS retries taken by dequeuers.
    pub dequeue_retries: u64,
    /// Dequeue calls that found the queue empty.
    pub empty_polls: u64,
    /// Approximate number of queued items.
    pub len: usize,
    /// Nodes currently waiting in the free-list pool.
    pub pooled: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    enqueue_retries: AtomicU64,
    dequeue_retries: AtomicU64,
    empty_polls: AtomicU64,
    /// Signed so a dequeue that overtakes the matching enqueue's increment
    /// cannot wrap around.
    len: AtomicI64,
}

/// An unbounded lock-free MPMC queue of work items.
///
/// Items come out in the order their enqueue linked them into the chain.
/// No item is ever duplicated or lost, whatever the interleaving.
pub struct ConcurrentQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    pool: Arc<NodePool<T>>,
    counters: CachePadded<Counters>,
}

// SAFETY: items are moved in by one thread and moved out by exactly one
// other (the winner of the head CAS), so `T: Send` is all that is required.
unsafe impl<T: Send> Send for ConcurrentQueue<T> {}
unsafe impl<T: Send> Sync for ConcurrentQueue<T> {}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentQueue<T> {
    /// Creates an empty queue with the default node pool.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Creates an empty queue: a single sentinel that head and tail share.
    pub fn with_config(config: QueueConfig) -> Self {
        let queue = ConcurrentQueue {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            pool: Arc::new(NodePool::new(config.pool_capacity)),
            counters: CachePadded::new(Counters::default()),
        };

        // SAFETY: the queue is not shared yet.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = Owned::new(Node::empty()).into_shared(guard);
            queue.head.store(sentinel, Ordering::Relaxed);
            queue.tail.store(sentinel, Ordering::Relaxed);
        }

        log::trace!("Created concurrent queue (pool capacity {})", config.pool_capacity);
        queue
    }

    /// Appends `item` at the tail.
    pub fn enqueue(&self, item: T) {
        let guard = &epoch::pin();
        let node = self.pool.acquire(item);
        let tag = node.generation as usize;
        let node = node.with_tag(tag).into_shared(guard);
        let backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: head and tail are never null and the guard keeps the
            // node alive.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if tail == self.tail.load(Ordering::Acquire, guard) {
                if next.is_null() {
                    if tail_ref
                        .next
                        .compare_exchange(Shared::null(), node, Ordering::Release, Ordering::Relaxed, guard)
                        .is_ok()
                    {
                        // Linked. Swinging the tail may fail; whoever sees
                        // it lagging fixes it.
                        let _ = self.tail.compare_exchange(
                            tail,
                            node,
                            Ordering::Release,
                            Ordering::Relaxed,
                            guard,
                        );
                        self.counters.len.fetch_add(1, Ordering::Relaxed);
                        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                } else {
                    let _ = self.tail.compare_exchange(
                        tail,
                        next,
                        Ordering::Release,
                        Ordering::Relaxed,
                        guard,
                    );
                }
            }

            self.counters.enqueue_retries.fetch_add(1, Ordering::Relaxed);
            backoff.spin();
        }
    }

    /// Removes the item at the head, or returns `None` if the queue is
    /// currently empty.
    pub fn dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: see `enqueue`.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);

            if head == self.head.load(Ordering::Acquire, guard) {
                // SAFETY: a non-null `next` is protected by the guard.
                match unsafe { next.as_ref() } {
                    None => {
                        self.counters.empty_polls.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                    Some(_) if head == tail => {
                        // Tail is lagging behind a completed link.
                        let _ = self.tail.compare_exchange(
                            tail,
                            next,
                            Ordering::Release,
                            Ordering::Relaxed,
                            guard,
                        );
                    }
                    Some(next_ref) => {
                        if self
                            .head
                            .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                            .is_ok()
                        {
                            // SAFETY: winning the head CAS grants exclusive
                            // ownership of the new sentinel's item, which was
                            // written before the node was published.
                            let item = unsafe { next_ref.item.assume_init_read() };
                            self.retire(head, guard);
                            self.counters.len.fetch_sub(1, Ordering::Relaxed);
                            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                            return Some(item);
                        }
                    }
                }
            }

            self.counters.dequeue_retries.fetch_add(1, Ordering::Relaxed);
            backoff.spin();
        }
    }

    /// Hands a detached former sentinel to the epoch collector, which
    /// recycles it once no pinned thread can still observe it.
    fn retire(&self, node: Shared<'_, Node<T>>, guard: &Guard) {
        let pool = Arc::clone(&self.pool);
        let node = node.with_tag(0);
        // SAFETY: `node` is unreachable from the queue after the head CAS,
        // its item slot is vacant, and the collector defers the closure
        // until every guard that might reference it has been dropped.
        unsafe {
            guard.defer_unchecked(move || pool.recycle(node.into_owned().into_box()));
        }
    }

    /// Enqueues every item of `items`, returning how many were added.
    pub fn enqueue_batch<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut count = 0;
        for item in items {
            self.enqueue(item);
            count += 1;
        }
        count
    }

    /// Dequeues up to `max` items, stopping early if the queue runs dry.
    pub fn dequeue_batch(&self, max: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(max.min(self.len()));
        while items.len() < max {
            match self.dequeue() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    /// Dequeues until the queue is observed empty.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len());
        while let Some(item) = self.dequeue() {
            items.push(item);
        }
        items
    }

    /// Whether the sentinel currently has no successor.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: see `enqueue`.
        unsafe { head.deref() }.next.load(Ordering::Acquire, guard).is_null()
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.counters.len.load(Ordering::Relaxed).max(0) as usize
    }

    /// Fills the node pool with up to `count` fresh nodes, never past its
    /// capacity. Returns how many were added.
    pub fn preallocate(&self, count: usize) -> usize {
        let mut added = 0;
        while added < count && self.pool.reserve_slot() {
            self.pool.free.push(PooledNode(Box::new(Node::empty())));
            added += 1;
        }
        log::debug!("Preallocated {} queue nodes", added);
        added
    }

    /// Frees pooled nodes until at most `target` remain. Returns how many
    /// were freed.
    pub fn trim_pool(&self, target: usize) -> usize {
        let mut freed = 0;
        while self.pool.len() > target {
            match self.pool.free.pop() {
                Some(node) => {
                    self.pool.len.fetch_sub(1, Ordering::Relaxed);
                    drop(node);
                    freed += 1;
                }
                None => break,
            }
        }
        log::debug!("Trimmed {} pooled queue nodes", freed);
        freed
    }

    /// Nodes currently waiting in the pool.
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            enqueue_retries: self.counters.enqueue_retries.load(Ordering::Relaxed),
            dequeue_retries: self.counters.dequeue_retries.load(Ordering::Relaxed),
            empty_polls: self.counters.empty_polls.load(Ordering::Relaxed),
            len: self.len(),
            pooled: self.pool_len(),
        }
    }

    /// Zeroes the throughput and retry counters. The length is left alone.
    pub fn reset_stats(&self) {
        self.counters.enqueued.store(0, Ordering::Relaxed);
        self.counters.dequeued.store(0, Ordering::Relaxed);
        self.counters.enqueue_retries.store(0, Ordering::Relaxed);
        self.counters.dequeue_retries.store(0, Ordering::Relaxed);
        self.counters.empty_polls.store(0, Ordering::Relaxed);
    }

    /// Structural self-check: the sentinel exists, every link carries its
    /// target's generation tag, and the tail is reachable from the head.
    ///
    /// Only conclusive while no other thread is mutating the queue.
    pub fn validate(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        let tail = self.tail.load(Ordering::Acquire, guard);
        if head.is_null() || tail.is_null() {
            log::warn!("Queue validation failed: missing sentinel");
            return false;
        }

        let mut current = head;
        loop {
            // SAFETY: every pointer in the chain is protected by the guard.
            let node = unsafe { current.deref() };
            if current.tag() != (node.generation as usize & Node::<T>::tag_mask()) {
                log::warn!("Queue validation failed: stale generation tag on a link");
                return false;
            }
            if current.as_raw() == tail.as_raw() {
                return true;
            }
            let next = node.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                log::warn!("Queue validation failed: tail not reachable from head");
                return false;
            }
            current = next;
        }
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}

        // SAFETY: we have exclusive access; the remaining sentinel holds no
        // item and nothing else references it.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = self.head.load(Ordering::Relaxed, guard);
            drop(sentinel.with_tag(0).into_owned());
        }
    }
}

impl<T> fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_yields_none() {
        let queue: ConcurrentQueue<u32> = ConcurrentQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.stats().empty_polls, 1);
        assert!(queue.validate());
    }

    #[test]
    fn single_thread_fifo() {
        let queue = ConcurrentQueue::new();
        for i in 0..10 {
            queue.enqueue(i);
        }
        assert_eq!(queue.len(), 10);
        let out: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(out, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert!(queue.validate());
    }

    #[test]
    fn batches() {
        let queue = ConcurrentQueue::new();
        assert_eq!(queue.enqueue_batch(["a", "b", "c", "d"]), 4);
        assert_eq!(queue.dequeue_batch(3), vec!["a", "b", "c"]);
        assert_eq!(queue.dequeue_batch(3), vec!["d"]);
        assert!(queue.dequeue_batch(3).is_empty());
    }

    #[test]
    fn remaining_items_are_dropped_with_the_queue() {
        let marker = std::sync::Arc::new(());
        {
            let queue = ConcurrentQueue::new();
            for _ in 0..5 {
                queue.enqueue(std::sync::Arc::clone(&marker));
            }
            drop(queue.dequeue());
            assert_eq!(std::sync::Arc::strong_count(&marker), 5);
        }
        assert_eq!(std::sync::Arc::strong_count(&marker), 1);
    }

    #[test]
    fn pool_respects_capacity() {
        let queue: ConcurrentQueue<u64> = ConcurrentQueue::with_config(QueueConfig { pool_capacity: 8 });
        assert_eq!(queue.preallocate(20), 8);
        assert_eq!(queue.pool_len(), 8);
        assert_eq!(queue.trim_pool(3), 5);
        assert_eq!(queue.pool_len(), 3);
    }

    #[test]
    fn pooled_nodes_are_reused() {
        let queue = ConcurrentQueue::with_config(QueueConfig { pool_capacity: 4 });
        queue.preallocate(4);
        queue.enqueue(1u8);
        queue.enqueue(2u8);
        assert_eq!(queue.pool_len(), 2);
        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.validate());
    }

    /// Pins and flushes until deferred recycling has refilled the pool.
    fn flush_until_pooled<T>(queue: &ConcurrentQueue<T>, target: usize) -> bool {
        for _ in 0..100_000 {
            if queue.pool_len() >= target {
                return true;
            }
            epoch::pin().flush();
            std::thread::yield_now();
        }
        queue.pool_len() >= target
    }

    #[test]
    fn reused_node_carries_next_generation_in_its_tag() {
        let queue = ConcurrentQueue::with_config(QueueConfig { pool_capacity: 4 });
        assert_eq!(queue.preallocate(1), 1);
        queue.enqueue(7u32);
        assert_eq!(queue.pool_len(), 0);

        let guard = &epoch::pin();
        let head = queue.head.load(Ordering::Acquire, guard);
        let tail = queue.tail.load(Ordering::Acquire, guard);
        // SAFETY: the queue is alive and the guard is pinned.
        let link = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
        assert_eq!(link, tail);
        assert_eq!(tail.tag(), 1);
        assert_eq!(unsafe { tail.deref() }.generation, 1);
        // The sentinel was never pooled.
        assert_eq!(head.tag(), 0);
        assert!(queue.validate());
    }

    #[test]
    fn retired_sentinel_returns_with_a_bumped_generation() {
        let queue = ConcurrentQueue::with_config(QueueConfig { pool_capacity: 4 });
        let sentinel = {
            let guard = &epoch::pin();
            queue.head.load(Ordering::Acquire, guard).as_raw()
        };

        queue.enqueue(1u64);
        assert_eq!(queue.dequeue(), Some(1));
        assert!(flush_until_pooled(&queue, 1), "retired sentinel never reached the pool");

        queue.enqueue(2);
        let guard = &epoch::pin();
        let tail = queue.tail.load(Ordering::Acquire, guard);
        assert_eq!(tail.as_raw(), sentinel);
        assert_eq!(tail.tag(), 1);
        // SAFETY: the queue is alive and the guard is pinned.
        assert_eq!(unsafe { tail.deref() }.generation, 1);
        assert!(queue.validate());
    }

    #[test]
    fn every_reuse_bumps_the_generation() {
        let pool: NodePool<u8> = NodePool::new(2);
        let node = pool.acquire(1);
        assert_eq!(node.generation, 0);
        let addr = &*node as *const Node<u8>;

        pool.recycle(node.into_box());
        let node = pool.acquire(2);
        assert_eq!(&*node as *const Node<u8>, addr);
        assert_eq!(node.generation, 1);

        pool.recycle(node.into_box());
        let node = pool.acquire(3);
        assert_eq!(node.generation, 2);
        assert!(node.next.load(Ordering::Relaxed, &epoch::pin()).is_null());
    }

    #[test]
    fn concurrent_preallocation_stays_within_capacity() {
        let queue: ConcurrentQueue<u32> =
            ConcurrentQueue::with_config(QueueConfig { pool_capacity: 16 });
        let added: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| queue.preallocate(10))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(added, 16);
        assert_eq!(queue.pool_len(), 16);
    }

    #[test]
    fn reset_stats_keeps_length() {
        let queue = ConcurrentQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.reset_stats();
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.len, 2);
    }
}

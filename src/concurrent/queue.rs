// Copyright (c) 2025 RustyDB Contributors
//
// Lock-free queue implementation
//
// This module implements a doubly-linked, sentinel-bounded, lock-free FIFO
// queue of opaque byte payloads. Unlike the classic Michael-Scott queue
// (a single, forward-linked chain with a swinging tail pointer), this queue
// keeps two immortal sentinel nodes `head` and `tail` whose identity never
// changes: enqueue always splices a fresh node immediately before `tail`,
// dequeue always unlinks the node immediately after `head`.
//
// Reference: the per-node spin lock used to designate a unique remover, and
// the splice-before-tail / unlink-after-head shape, are ported from a C
// implementation that protected removal with an immediate free gated by that
// lock. That free is unsound against a concurrent enqueuer that had already
// read the removed node as its own `tail.prev`; this port keeps the lock as
// a linearization aid but defers the actual free to the epoch-based
// reclaimer in `concurrent::epoch`, closing that window.

use super::epoch::Epoch;
use super::Backoff;

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Cache-line padded node. `data` is `None` only for the two sentinels.
#[repr(C, align(64))]
struct Node {
    data: UnsafeCell<Option<Vec<u8>>>,
    prev: AtomicPtr<Node>,
    next: AtomicPtr<Node>,
    /// Linearization/reclamation aid, not a mutual-exclusion primitive: the
    /// head CAS in `dequeue` already designates a unique winner, so at most
    /// one thread ever contends for a given node's lock.
    locked: AtomicBool,
}

impl Node {
    fn new(data: Vec<u8>) -> *mut Node {
        Box::into_raw(Box::new(Node {
            data: UnsafeCell::new(Some(data)),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            locked: AtomicBool::new(false),
        }))
    }

    fn sentinel() -> *mut Node {
        Box::into_raw(Box::new(Node {
            data: UnsafeCell::new(None),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            locked: AtomicBool::new(false),
        }))
    }

    /// Safety: `node` must be a live, unfreed `Node`.
    unsafe fn try_lock(node: *mut Node) -> bool {
        (*node)
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Safety: `node` must be a live, unfreed `Node` whose lock is held by
    /// the caller.
    unsafe fn unlock(node: *mut Node) {
        (*node).locked.store(false, Ordering::Release);
    }
}

/// Lock-free, unbounded FIFO queue of opaque byte payloads.
///
/// `head` and `tail` are immortal sentinels allocated once at construction;
/// their identity never changes. What moves under contention is `head.next`
/// (the logical front) and `tail.prev` (an optimization hint for the logical
/// back, refreshed after every successful enqueue but never authoritative —
/// see [`ByteQueue::is_empty`]).
#[repr(C)]
pub struct ByteQueue {
    head: *mut Node,
    _pad1: [u8; 56],
    tail: *mut Node,
    _pad2: [u8; 56],
    size: AtomicUsize,
    max_size: AtomicUsize,
    enq_ok: AtomicU64,
    deq_ok: AtomicU64,
    enq_retries: AtomicU64,
    deq_retries: AtomicU64,
}

impl ByteQueue {
    /// Construct an empty queue.
    ///
    /// Infallible: the only failure mode in the source (`malloc` returning
    /// `NULL`) has no analogue here, since Rust's global allocator aborts
    /// the process on allocation failure rather than returning an error.
    pub fn new() -> Self {
        let head = Node::sentinel();
        let tail = Node::sentinel();
        unsafe {
            (*head).prev.store(ptr::null_mut(), Ordering::Release);
            (*head).next.store(tail, Ordering::Release);
            (*tail).prev.store(head, Ordering::Release);
            (*tail).next.store(ptr::null_mut(), Ordering::Release);
        }
        Self {
            head,
            _pad1: [0; 56],
            tail,
            _pad2: [0; 56],
            size: AtomicUsize::new(0),
            max_size: AtomicUsize::new(0),
            enq_ok: AtomicU64::new(0),
            deq_ok: AtomicU64::new(0),
            enq_retries: AtomicU64::new(0),
            deq_retries: AtomicU64::new(0),
        }
    }

    /// Append `data` to the logical end of the queue.
    ///
    /// Always completes. The source's "invalid argument" failure modes
    /// (null queue, null data with nonzero length) have no analogue in a
    /// typed Rust API: `&self` guarantees a live queue, and `Vec<u8>` is
    /// always a valid buffer, empty or not.
    pub fn enqueue(&self, data: Vec<u8>) {
        let node = Node::new(data);
        // Fresh node: nothing else can reference it yet, so this cannot fail.
        let locked = unsafe { Node::try_lock(node) };
        debug_assert!(locked, "freshly allocated node must be lockable");

        // Protects the dereference of `p` below against a concurrent
        // dequeuer that unlinks and defers-frees the same node.
        let _guard = Epoch::pin();
        let mut backoff = Backoff::new();

        loop {
            let p = unsafe { (*self.tail).prev.load(Ordering::Acquire) };

            unsafe {
                (*node).next.store(self.tail, Ordering::Relaxed);
                (*node).prev.store(p, Ordering::Relaxed);
            }
            // `node`'s fields must be visible before it is published below.
            fence(Ordering::Release);

            let cas = unsafe {
                (*p).next
                    .compare_exchange(self.tail, node, Ordering::Release, Ordering::Acquire)
            };

            match cas {
                Ok(_) => {
                    unsafe { (*self.tail).prev.store(node, Ordering::Release) };

                    let new_size = self.size.fetch_add(1, Ordering::Relaxed) + 1;
                    let mut current_max = self.max_size.load(Ordering::Relaxed);
                    while new_size > current_max {
                        match self.max_size.compare_exchange_weak(
                            current_max,
                            new_size,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => break,
                            Err(observed) => current_max = observed,
                        }
                    }

                    self.enq_ok.fetch_add(1, Ordering::Relaxed);
                    unsafe { Node::unlock(node) };
                    return;
                }
                Err(_) => {
                    self.enq_retries.fetch_add(1, Ordering::Relaxed);
                    backoff.spin();
                }
            }
        }
    }

    /// Remove and return the payload at the logical front.
    ///
    /// Returns `None` iff the queue is observed empty. This collapses the
    /// source's `bool` return plus two out-parameters into one `Option`,
    /// the idiomatic Rust shape for "maybe a value" — the empty/non-empty
    /// distinction a caller can actually observe is unchanged.
    pub fn dequeue(&self) -> Option<Vec<u8>> {
        let _guard = Epoch::pin();
        let mut backoff = Backoff::new();

        loop {
            let f = unsafe { (*self.head).next.load(Ordering::Acquire) };
            if f == self.tail {
                return None;
            }

            if !unsafe { Node::try_lock(f) } {
                self.deq_retries.fetch_add(1, Ordering::Relaxed);
                backoff.spin();
                continue;
            }

            let x = unsafe { (*f).next.load(Ordering::Acquire) };

            let cas = unsafe {
                (*self.head)
                    .next
                    .compare_exchange(f, x, Ordering::Release, Ordering::Acquire)
            };

            match cas {
                Ok(_) => {
                    let data = unsafe { (*(*f).data.get()).take() }.unwrap_or_default();

                    if x != self.tail {
                        unsafe { (*x).prev.store(self.head, Ordering::Release) };
                    } else {
                        unsafe { (*self.tail).prev.store(self.head, Ordering::Release) };
                    }

                    self.size.fetch_sub(1, Ordering::Relaxed);
                    self.deq_ok.fetch_add(1, Ordering::Relaxed);

                    unsafe { Node::unlock(f) };
                    // Deferred, not inline: a concurrent enqueuer may already
                    // have read `f` as its `tail.prev` and not yet performed
                    // its own CAS.
                    Epoch::defer(f);

                    return Some(data);
                }
                Err(_) => {
                    unsafe { Node::unlock(f) };
                    self.deq_retries.fetch_add(1, Ordering::Relaxed);
                    backoff.spin();
                }
            }
        }
    }

    /// True iff the queue holds no payload nodes.
    ///
    /// Checks both `head.next == tail` and `tail.prev == head` to avoid
    /// reporting empty during the brief window in `enqueue` between the
    /// successful CAS on `prev.next` and the refresh of `tail.prev`.
    pub fn is_empty(&self) -> bool {
        let first = unsafe { (*self.head).next.load(Ordering::Acquire) };
        let tail_prev = unsafe { (*self.tail).prev.load(Ordering::Acquire) };
        first == self.tail && tail_prev == self.head
    }

    /// Approximate current size. Not a synchronization primitive.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// High-water mark of [`ByteQueue::len`] over the queue's lifetime.
    pub fn max_len(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Snapshot of the six contention/throughput counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            size: self.size.load(Ordering::Acquire),
            max_size: self.max_size.load(Ordering::Acquire),
            enq_ok: self.enq_ok.load(Ordering::Acquire),
            deq_ok: self.deq_ok.load(Ordering::Acquire),
            enq_retries: self.enq_retries.load(Ordering::Acquire),
            deq_retries: self.deq_retries.load(Ordering::Acquire),
        }
    }

    /// Walk the queue front-to-back, invoking `f` once per live payload.
    ///
    /// Diagnostic use only: not guaranteed consistent with concurrent
    /// mutation. The walk pins an epoch for its duration, which is a
    /// strictly stronger safety guarantee than the source's unguarded
    /// pointer walk (a node freed mid-walk here is merely not observed,
    /// never a dangling dereference) — but, like the source, it does not
    /// take a node's lock, so a payload read here may race a concurrent
    /// dequeuer's removal of the same node. Call only when no mutation is
    /// in flight if a torn read must be ruled out.
    pub fn for_each<F: FnMut(&[u8])>(&self, mut f: F) {
        let _guard = Epoch::pin();
        let mut current = unsafe { (*self.head).next.load(Ordering::Acquire) };
        while current != self.tail {
            if let Some(bytes) = unsafe { (*(*current).data.get()).as_ref() } {
                f(bytes);
            }
            current = unsafe { (*current).next.load(Ordering::Acquire) };
        }
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ByteQueue {
    fn drop(&mut self) {
        // Drain so every remaining payload's `Vec<u8>` drops normally and
        // every unlinked node goes through the same deferred-reclaim path
        // as a live dequeue.
        while self.dequeue().is_some() {}

        // Safety: `&mut self` means no other thread can be observing the
        // queue; the sentinels were linked through plain `AtomicPtr`s (not
        // an auto-freeing smart pointer), so freeing them directly here
        // cannot double-free or cascade into each other.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}

// Safety: all shared mutable state goes through atomics with the orderings
// documented above; `Node::data` is only ever touched by the thread that
// holds that node's lock.
unsafe impl Send for ByteQueue {}
unsafe impl Sync for ByteQueue {}

/// Snapshot of queue contention and throughput counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub enq_ok: u64,
    pub deq_ok: u64,
    pub enq_retries: u64,
    pub deq_retries: u64,
}

impl QueueStats {
    /// Net successful operations (`enq_ok - deq_ok`); should equal `size`
    /// at any point where no operation is mid-flight.
    pub fn net_ops(&self) -> i64 {
        self.enq_ok as i64 - self.deq_ok as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_empty() {
        let q = ByteQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        assert_eq!(q.max_len(), 0);
    }

    /// Every dequeue (and the drain loop in `Drop`) hands its unlinked node
    /// to `Epoch::defer` instead of freeing it inline. This asserts the
    /// other half of that contract actually holds: the deferred garbage is
    /// not merely parked in a thread-local bag forever, but gets reclaimed
    /// once no thread can still be observing it.
    #[test]
    fn deferred_nodes_are_eventually_reclaimed() {
        use super::super::epoch::{self, Epoch};

        let q = ByteQueue::new();
        for i in 0..200u32 {
            q.enqueue(i.to_le_bytes().to_vec());
        }
        while q.dequeue().is_some() {}
        assert!(q.is_empty());

        // Drive the global epoch forward until every one of the three
        // per-epoch garbage bags has been swept. Polled rather than a fixed
        // iteration count because the epoch is process-global and shared
        // with any other test thread that happens to be pinned concurrently.
        let mut pending = epoch::pending_garbage_count();
        for _ in 0..1000 {
            if pending == 0 {
                break;
            }
            Epoch::force_collect();
            pending = epoch::pending_garbage_count();
        }

        assert_eq!(
            pending, 0,
            "epoch reclaimer must not leak deferred nodes once no thread can still observe them"
        );
    }

    #[test]
    fn fifo_order_single_thread() {
        let q = ByteQueue::new();
        for v in [10u32, 20, 30, 40, 50] {
            q.enqueue(v.to_le_bytes().to_vec());
        }
        assert_eq!(q.len(), 5);

        for v in [10u32, 20, 30, 40, 50] {
            let data = q.dequeue().expect("value expected");
            assert_eq!(u32::from_le_bytes(data.try_into().unwrap()), v);
        }
        assert_eq!(q.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn byte_strings_round_trip() {
        let q = ByteQueue::new();
        for s in [b"Hello\0".to_vec(), b"World\0".to_vec(), b"Queue\0".to_vec(), b"Test\0".to_vec()] {
            q.enqueue(s);
        }
        assert_eq!(q.dequeue().unwrap(), b"Hello\0".to_vec());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn mixed_length_payloads() {
        let q = ByteQueue::new();
        q.enqueue(42i32.to_le_bytes().to_vec());
        q.enqueue(b"Mixed\0".to_vec());

        let first = q.dequeue().unwrap();
        assert_eq!(first.len(), 4);
        let second = q.dequeue().unwrap();
        assert_eq!(second.len(), 6);
    }

    #[test]
    fn empty_payload_round_trips() {
        let q = ByteQueue::new();
        q.enqueue(Vec::new());
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue(), Some(Vec::new()));
    }

    #[test]
    fn idempotent_empty_dequeue() {
        let q = ByteQueue::new();
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn stats_track_successful_operations() {
        let q = ByteQueue::new();
        q.enqueue(vec![1]);
        q.enqueue(vec![2]);
        q.dequeue();

        let stats = q.stats();
        assert_eq!(stats.enq_ok, 2);
        assert_eq!(stats.deq_ok, 1);
        assert_eq!(stats.net_ops(), stats.size as i64);
        assert_eq!(stats.max_size, 2);
    }

    #[test]
    fn max_size_is_monotonic_high_water_mark() {
        let q = ByteQueue::new();
        q.enqueue(vec![1]);
        q.enqueue(vec![2]);
        q.enqueue(vec![3]);
        q.dequeue();
        q.dequeue();
        assert_eq!(q.len(), 1);
        assert_eq!(q.max_len(), 3);
    }

    #[test]
    fn for_each_visits_front_to_back() {
        let q = ByteQueue::new();
        q.enqueue(vec![1]);
        q.enqueue(vec![2]);
        q.enqueue(vec![3]);

        let mut seen = Vec::new();
        q.for_each(|bytes| seen.push(bytes.to_vec()));
        assert_eq!(seen, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn concurrent_enqueue_dequeue_conserves_multiset() {
        let queue = Arc::new(ByteQueue::new());
        let dequeued_count = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();

        const THREADS: u32 = 10;
        const PER_THREAD: u32 = 100;

        for tid in 0..THREADS {
            let q = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let value = tid * 1000 + i;
                    q.enqueue(value.to_le_bytes().to_vec());
                }
            }));
        }
        for handle in handles.drain(..) {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), (THREADS * PER_THREAD) as usize);

        let seen: Arc<std::sync::Mutex<HashSet<u32>>> = Arc::new(std::sync::Mutex::new(HashSet::new()));
        for _ in 0..THREADS {
            let q = queue.clone();
            let seen = seen.clone();
            let count = dequeued_count.clone();
            handles.push(thread::spawn(move || loop {
                match q.dequeue() {
                    Some(bytes) => {
                        let value = u32::from_le_bytes(bytes.try_into().unwrap());
                        seen.lock().unwrap().insert(value);
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(queue.is_empty());
        assert_eq!(dequeued_count.load(Ordering::Relaxed), (THREADS * PER_THREAD) as usize);

        let stats = queue.stats();
        assert_eq!(stats.enq_ok, (THREADS * PER_THREAD) as u64);
        assert_eq!(stats.deq_ok, (THREADS * PER_THREAD) as u64);
        assert!(stats.max_size <= (THREADS * PER_THREAD) as usize);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), (THREADS * PER_THREAD) as usize);
        for tid in 0..THREADS {
            for i in 0..PER_THREAD {
                assert!(seen.contains(&(tid * 1000 + i)));
            }
        }
    }
}

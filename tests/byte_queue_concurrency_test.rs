// Integration coverage of concurrent producer/consumer traffic against the
// public `ByteQueue` API: every enqueued payload is accounted for exactly
// once, and contention actually exercises the CAS retry paths.

use rusty_queue::ByteQueue;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn concurrent_producers_and_consumers_conserve_the_multiset() {
    const NUM_PRODUCERS: usize = 10;
    const ITEMS_PER_PRODUCER: usize = 100;

    let queue = Arc::new(ByteQueue::new());

    let producers: Vec<_> = (0..NUM_PRODUCERS)
        .map(|producer_id| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..ITEMS_PER_PRODUCER {
                    queue.enqueue(format!("{}:{}", producer_id, i).into_bytes());
                }
            })
        })
        .collect();

    for handle in producers {
        handle.join().expect("producer thread panicked");
    }

    assert_eq!(queue.len(), NUM_PRODUCERS * ITEMS_PER_PRODUCER);
    assert_eq!(queue.stats().enq_ok as usize, NUM_PRODUCERS * ITEMS_PER_PRODUCER);

    let consumed = Arc::new(std::sync::Mutex::new(Vec::new()));
    const NUM_CONSUMERS: usize = 10;
    let consumers: Vec<_> = (0..NUM_CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                let mut local = Vec::new();
                while let Some(item) = queue.dequeue() {
                    local.push(item);
                }
                consumed.lock().unwrap().extend(local);
            })
        })
        .collect();

    for handle in consumers {
        handle.join().expect("consumer thread panicked");
    }

    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);

    let consumed = consumed.lock().unwrap();
    assert_eq!(consumed.len(), NUM_PRODUCERS * ITEMS_PER_PRODUCER);

    let unique: HashSet<_> = consumed.iter().cloned().collect();
    assert_eq!(
        unique.len(),
        NUM_PRODUCERS * ITEMS_PER_PRODUCER,
        "every item must be dequeued exactly once"
    );

    let stats = queue.stats();
    assert_eq!(stats.deq_ok as usize, NUM_PRODUCERS * ITEMS_PER_PRODUCER);
    assert_eq!(stats.net_ops(), 0);
    assert_eq!(stats.max_size, NUM_PRODUCERS * ITEMS_PER_PRODUCER);
}

#[test]
fn interleaved_producers_and_consumers_never_lose_or_duplicate_items() {
    const NUM_WORKERS: usize = 8;
    const ITEMS_PER_WORKER: usize = 150;

    let queue = Arc::new(ByteQueue::new());
    let consumed = Arc::new(std::sync::Mutex::new(Vec::new()));

    let workers: Vec<_> = (0..NUM_WORKERS)
        .map(|worker_id| {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                let mut local = Vec::new();
                for i in 0..ITEMS_PER_WORKER {
                    queue.enqueue(format!("{}:{}", worker_id, i).into_bytes());
                    if let Some(item) = queue.dequeue() {
                        local.push(item);
                    }
                }
                consumed.lock().unwrap().extend(local);
            })
        })
        .collect();

    for handle in workers {
        handle.join().expect("worker thread panicked");
    }

    while let Some(item) = queue.dequeue() {
        consumed.lock().unwrap().push(item);
    }

    assert!(queue.is_empty());

    let consumed = consumed.lock().unwrap();
    assert_eq!(consumed.len(), NUM_WORKERS * ITEMS_PER_WORKER);

    let unique: HashSet<_> = consumed.iter().cloned().collect();
    assert_eq!(unique.len(), NUM_WORKERS * ITEMS_PER_WORKER);

    let stats = queue.stats();
    assert_eq!(stats.enq_ok, stats.deq_ok);
}

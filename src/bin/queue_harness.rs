// Load-test / demonstration harness for the lock-free byte queue.
//
// Spawns `num_threads` workers against one shared queue. Each worker enqueues
// `items_per_thread` payloads, then drains as many as it can back out,
// sleeping a short random interval between operations so producers and
// consumers interleave instead of racing in lockstep.

use chrono::Local;
use rusty_queue::{ByteQueue, DbError, Result};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

const DEFAULT_NUM_THREADS: usize = 10;
const DEFAULT_ITEMS_PER_THREAD: usize = 100;
const DEFAULT_MUTEX_TIMEOUT_SEC: u64 = 30;

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

macro_rules! tprintln {
    ($($arg:tt)*) => {{
        println!("[{}] {}", timestamp(), format!($($arg)*));
    }};
}

fn print_usage(program: &str) {
    tprintln!("Usage: {} [num_threads] [items_per_thread] [mutex_timeout_sec]", program);
    tprintln!("Parameters:");
    tprintln!("  num_threads        Number of worker threads to create (default: {})", DEFAULT_NUM_THREADS);
    tprintln!("  items_per_thread   Number of payloads per thread (default: {})", DEFAULT_ITEMS_PER_THREAD);
    tprintln!("  mutex_timeout_sec  Accepted for compatibility, unused (default: {})", DEFAULT_MUTEX_TIMEOUT_SEC);
    tprintln!("Examples:");
    tprintln!("  {}                 # defaults: {} threads, {} items", program, DEFAULT_NUM_THREADS, DEFAULT_ITEMS_PER_THREAD);
    tprintln!("  {} 20              # 20 threads, {} items", program, DEFAULT_ITEMS_PER_THREAD);
    tprintln!("  {} 20 200          # 20 threads, 200 items", program);
}

fn wants_help(args: &[String]) -> bool {
    matches!(
        args.get(0).map(String::as_str),
        Some("?") | Some("help") | Some("-h") | Some("--help")
    )
}

fn parse_args(args: &[String]) -> Result<(usize, usize, u64)> {
    if args.len() > 3 {
        return Err(DbError::InvalidArgument(
            "too many arguments, pass '?' for help".to_string(),
        ));
    }

    let num_threads = match args.get(0) {
        Some(s) => s
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| DbError::InvalidArgument(format!("invalid number of threads: {}", s)))?,
        None => DEFAULT_NUM_THREADS,
    };

    let items_per_thread = match args.get(1) {
        Some(s) => s
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| DbError::InvalidArgument(format!("invalid item count: {}", s)))?,
        None => DEFAULT_ITEMS_PER_THREAD,
    };

    let mutex_timeout_sec = match args.get(2) {
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| DbError::InvalidArgument(format!("invalid mutex timeout: {}", s)))?,
        None => DEFAULT_MUTEX_TIMEOUT_SEC,
    };

    Ok((num_threads, items_per_thread, mutex_timeout_sec))
}

fn worker(queue: Arc<ByteQueue>, thread_id: usize, items_per_thread: usize) {
    tprintln!(
        "Worker thread {}: started (will process {} items)",
        thread_id,
        items_per_thread
    );

    let mut enqueued = 0usize;
    for _ in 0..items_per_thread {
        let payload = format!("{}:{}", thread_id, enqueued).into_bytes();
        queue.enqueue(payload);
        enqueued += 1;
        thread::sleep(Duration::from_micros(rand::random::<u64>() % 1000));
    }
    tprintln!("Worker thread {}: enqueued {} items", thread_id, enqueued);

    let mut dequeued = 0usize;
    for _ in 0..items_per_thread {
        match queue.dequeue() {
            Some(_) => dequeued += 1,
            None => break,
        }
        thread::sleep(Duration::from_micros(rand::random::<u64>() % 100));
    }
    tprintln!(
        "Worker thread {}: completed - enqueued: {}, dequeued: {}",
        thread_id,
        enqueued,
        dequeued
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tprintln!("Queue Harness");
    tprintln!("=============");
    tprintln!("");

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let program = std::env::args().next().unwrap_or_else(|| "queue-harness".to_string());

    if wants_help(&raw_args) {
        print_usage(&program);
        std::process::exit(0);
    }

    let (num_threads, items_per_thread, mutex_timeout_sec) = match parse_args(&raw_args) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("{}", e);
            eprintln!("[{}] {}", timestamp(), e);
            std::process::exit(1);
        }
    };

    info!(
        num_threads,
        items_per_thread, mutex_timeout_sec, "starting queue harness"
    );
    tprintln!(
        "mutex_timeout_sec = {} (accepted for compatibility, not used by this design)",
        mutex_timeout_sec
    );

    let queue = Arc::new(ByteQueue::new());
    tprintln!("Initialized queue");
    tprintln!(
        "Creating {} worker threads, each processing {} items...",
        num_threads,
        items_per_thread
    );
    tprintln!("");

    let mut handles = Vec::with_capacity(num_threads);
    tprintln!("Starting worker threads...");
    for thread_id in 0..num_threads {
        let queue = Arc::clone(&queue);
        handles.push(thread::spawn(move || worker(queue, thread_id, items_per_thread)));
    }
    tprintln!("All {} worker threads started.", num_threads);
    tprintln!("");

    tprintln!("Waiting for all worker threads to complete...");
    for (thread_id, handle) in handles.into_iter().enumerate() {
        if handle.join().is_err() {
            error!(thread_id, "worker thread panicked");
        }
    }
    tprintln!("All worker threads completed.");
    tprintln!("");

    let stats = queue.stats();
    tprintln!("Queue statistics:");
    tprintln!("  size            = {}", stats.size);
    tprintln!("  max_size        = {}", stats.max_size);
    tprintln!("  enqueue_ok      = {}", stats.enq_ok);
    tprintln!("  dequeue_ok      = {}", stats.deq_ok);
    tprintln!("  enqueue_retries = {}", stats.enq_retries);
    tprintln!("  dequeue_retries = {}", stats.deq_retries);
    tprintln!("  net_ops         = {}", stats.net_ops());
}

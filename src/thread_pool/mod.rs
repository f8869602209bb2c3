use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::error;

mod blocking;
mod lock_free;

pub use self::blocking::BlockingQueue;
pub use self::lock_free::LockFreeQueue;

/// An opaque unit of work for the pool.
pub type Task = Box<dyn FnOnce() + Send>;

#[cfg(not(feature = "lockfree-pool"))]
type PoolQueue = BlockingQueue<Task>;
#[cfg(feature = "lockfree-pool")]
type PoolQueue = LockFreeQueue<Task>;

/// Fixed-size worker pool over a FIFO task queue.
///
/// The queue implementation is selected at build time: the bounded blocking
/// queue by default, the lock-free queue with the `lockfree-pool` feature
/// (workers then spin with `yield_now` instead of blocking). Each producer's
/// tasks run in submission order; ordering across producers is unspecified.
pub struct ThreadPool {
    name: String,
    queue: Arc<PoolQueue>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    thread_init_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ThreadPool {
    pub fn new(name: &str) -> ThreadPool {
        ThreadPool {
            name: name.to_owned(),
            queue: Arc::new(PoolQueue::new()),
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            thread_init_callback: None,
        }
    }

    /// Bound the queue; producers block once `max_size` tasks are pending
    /// (0 means unbounded). Only meaningful for the blocking queue; the
    /// lock-free queue is always unbounded.
    pub fn set_max_queue_size(&self, max_size: usize) {
        #[cfg(not(feature = "lockfree-pool"))]
        self.queue.set_max_size(max_size);
        #[cfg(feature = "lockfree-pool")]
        let _ = max_size;
    }

    /// Runs on each worker thread before it serves tasks.
    pub fn set_thread_init_callback<F: Fn() + Send + Sync + 'static>(&mut self, callback: F) {
        assert!(self.threads.is_empty(), "init callback set after start");
        self.thread_init_callback = Some(Arc::new(callback));
    }

    pub fn start(&mut self, num_threads: usize) {
        assert!(self.threads.is_empty(), "ThreadPool started twice");
        self.running.store(true, Ordering::Release);
        self.threads.reserve(num_threads);
        for i in 0..num_threads {
            let name = format!("{}{}", self.name, i + 1);
            let queue = self.queue.clone();
            let running = self.running.clone();
            let init = self.thread_init_callback.clone();
            let thread = thread::Builder::new()
                .name(name)
                .spawn(move || worker(queue, running, init))
                .expect("spawn pool worker");
            self.threads.push(thread);
        }
        if num_threads == 0 {
            if let Some(init) = &self.thread_init_callback {
                init();
            }
        }
    }

    /// Let in-flight tasks finish, discard the rest, join the workers.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        #[cfg(not(feature = "lockfree-pool"))]
        self.queue.stop();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("pool worker of {:?} panicked", self.name);
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a task. With zero workers the task runs inline on the caller.
    pub fn run<F: FnOnce() + Send + 'static>(&self, task: F) {
        if self.threads.is_empty() {
            task();
        } else {
            self.put(Box::new(task));
        }
    }

    #[cfg(not(feature = "lockfree-pool"))]
    fn put(&self, task: Task) {
        self.queue.put(task);
    }

    #[cfg(feature = "lockfree-pool")]
    fn put(&self, task: Task) {
        self.queue.push(task);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

#[cfg(not(feature = "lockfree-pool"))]
fn worker(
    queue: Arc<PoolQueue>,
    _running: Arc<AtomicBool>,
    init: Option<Arc<dyn Fn() + Send + Sync>>,
) {
    if let Some(init) = init {
        init();
    }
    // `take` returns None exactly when the queue stopped.
    while let Some(task) = queue.take() {
        run_task(task);
    }
}

#[cfg(feature = "lockfree-pool")]
fn worker(
    queue: Arc<PoolQueue>,
    running: Arc<AtomicBool>,
    init: Option<Arc<dyn Fn() + Send + Sync>>,
) {
    if let Some(init) = init {
        init();
    }
    // Checking the flag before popping means stop() abandons whatever is
    // still queued, like the blocking variant.
    while running.load(Ordering::Acquire) {
        match queue.pop() {
            Some(task) => run_task(task),
            None => thread::yield_now(),
        }
    }
}

/// Workers are not expected to panic; abort to preserve the evidence
/// instead of silently losing the thread.
fn run_task(task: Task) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
        error!("task panicked in pool worker; aborting");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn runs_tasks_on_workers() {
        let mut pool = ThreadPool::new("test");
        pool.start(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done, finished) = mpsc::channel();
        for _ in 0..100 {
            let counter = counter.clone();
            let done = done.clone();
            pool.run(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                done.send(()).unwrap();
            });
        }
        for _ in 0..100 {
            finished.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        pool.stop();
    }

    #[test]
    fn zero_workers_runs_inline() {
        let mut pool = ThreadPool::new("inline");
        pool.start(0);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        pool.run(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let mut pool = ThreadPool::new("order");
        pool.start(1);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            pool.run(move || seen.lock().unwrap().push(i));
        }
        pool.stop();
        let seen = seen.lock().unwrap();
        // One worker, one producer: strict submission order, though `stop`
        // may discard a tail of the queue.
        assert!(seen.windows(2).all(|w| w[0] + 1 == w[1]));
    }
}

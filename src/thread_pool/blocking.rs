use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    queue: VecDeque<T>,
    max_size: usize,
    running: bool,
}

/// Bounded blocking FIFO queue: one mutex, two condition variables.
///
/// `max_size == 0` means `put` never blocks. After `stop`, `put` is a no-op
/// and `take` returns `None` even while items remain queued; pending work is
/// deliberately discarded.
pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> BlockingQueue<T> {
        BlockingQueue::with_max_size(0)
    }

    pub fn with_max_size(max_size: usize) -> BlockingQueue<T> {
        BlockingQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                max_size,
                running: true,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Block while the queue is full and running, then enqueue.
    pub fn put(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.max_size != 0 {
            while inner.queue.len() >= inner.max_size && inner.running {
                inner = self.not_full.wait(inner).unwrap();
            }
        }
        if !inner.running {
            return;
        }
        inner.queue.push_back(item);
        self.not_empty.notify_one();
    }

    /// Block while the queue is empty and running. `None` means stopped.
    pub fn take(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.is_empty() && inner.running {
            inner = self.not_empty.wait(inner).unwrap();
        }
        if !inner.running {
            return None;
        }
        let item = inner.queue.pop_front();
        self.not_full.notify_one();
        item
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_max_size(&self, max_size: usize) {
        self.inner.lock().unwrap().max_size = max_size;
        self.not_full.notify_all();
    }

    /// Release every blocked producer and consumer.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.running = false;
        }
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> BlockingQueue<T> {
        BlockingQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = BlockingQueue::new();
        for i in 0..10 {
            queue.put(i);
        }
        for i in 0..10 {
            assert_eq!(queue.take(), Some(i));
        }
    }

    #[test]
    fn bounded_put_blocks_until_taken() {
        let queue = Arc::new(BlockingQueue::with_max_size(2));
        queue.put(1);
        queue.put(2);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.put(3))
        };
        assert_eq!(queue.take(), Some(1));
        producer.join().unwrap();
        assert_eq!(queue.take(), Some(2));
        assert_eq!(queue.take(), Some(3));
    }

    #[test]
    fn stop_releases_blocked_takers() {
        let queue: Arc<BlockingQueue<i32>> = Arc::new(BlockingQueue::new());
        let taker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take())
        };
        queue.stop();
        assert_eq!(taker.join().unwrap(), None);
        // put after stop is a no-op
        queue.put(1);
        assert!(queue.is_empty());
    }
}

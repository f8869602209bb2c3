use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::error;

use crate::event_loop::{EventLoop, LoopHandle};

/// Runs before the loop starts, on the loop's own thread.
pub type ThreadInitCallback = Box<dyn FnOnce(&EventLoop) + Send>;

/// A thread that owns one [`EventLoop`] for its whole lifetime.
///
/// The loop lives on the spawned thread's stack; [`start_loop`] blocks until
/// the thread has constructed it and published a [`LoopHandle`]. Dropping
/// the `EventLoopThread` quits the loop and joins the thread.
///
/// [`start_loop`]: EventLoopThread::start_loop
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<JoinHandle<()>>,
    handle: Option<LoopHandle>,
}

impl EventLoopThread {
    pub fn new(name: &str) -> EventLoopThread {
        EventLoopThread {
            name: name.to_owned(),
            init: None,
            thread: None,
            handle: None,
        }
    }

    pub fn with_init<F>(name: &str, init: F) -> EventLoopThread
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        EventLoopThread {
            name: name.to_owned(),
            init: Some(Box::new(init)),
            thread: None,
            handle: None,
        }
    }

    /// Spawn the thread and wait for its loop to come up.
    pub fn start_loop(&mut self) -> io::Result<LoopHandle> {
        assert!(self.thread.is_none(), "EventLoopThread started twice");

        type Published = (Mutex<Option<io::Result<LoopHandle>>>, Condvar);
        let published: Arc<Published> = Arc::new((Mutex::new(None), Condvar::new()));
        let publisher = published.clone();
        let init = self.init.take();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => {
                        let (lock, condvar) = &*publisher;
                        *lock.lock().unwrap() = Some(Ok(event_loop.handle()));
                        condvar.notify_one();
                        event_loop
                    }
                    Err(err) => {
                        let (lock, condvar) = &*publisher;
                        *lock.lock().unwrap() = Some(Err(err));
                        condvar.notify_one();
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&event_loop);
                }
                event_loop.run();
            })?;
        self.thread = Some(thread);

        let (lock, condvar) = &*published;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = condvar.wait(slot).unwrap();
        }
        let handle = slot.take().unwrap()?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("loop thread {:?} panicked", self.name);
            }
        }
    }
}

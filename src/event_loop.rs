use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::{new_default_poller, Poller};
use crate::timer::{next_timer_id, TimerId, TimerQueue};
use crate::waker::Waker;

const POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<LoopInner>>> = RefCell::new(None);
}

/// A single-threaded reactor.
///
/// One loop per thread, at most: construction registers the loop in a
/// thread-local and a second construction on the same thread panics. The
/// loop owns its poller, timer queue and wakeup channel; every channel
/// registered with it is dispatched on the thread that calls [`run`].
///
/// `EventLoop` is deliberately `!Send`: it can only be driven by the thread
/// that created it. Other threads interact through a [`LoopHandle`].
///
/// [`run`]: EventLoop::run
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

/// Cross-thread face of an [`EventLoop`]: clone-able, `Send + Sync`, and
/// valid for the lifetime of the process (posts to a dead loop are dropped).
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

/// State shared with other threads.
pub(crate) struct LoopShared {
    pending: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    waker: Waker,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    thread: ThreadId,
}

/// State confined to the loop's thread.
pub(crate) struct LoopInner {
    shared: Arc<LoopShared>,
    poller: RefCell<Box<dyn Poller>>,
    timers: RefCell<Option<Rc<TimerQueue>>>,
    wakeup_channel: RefCell<Option<Rc<Channel>>>,
    /// Tasks queued by the loop thread itself (deferred work such as
    /// destroying the channel currently being dispatched).
    local_pending: RefCell<Vec<Box<dyn FnOnce()>>>,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    iteration: Cell<u64>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let already = CURRENT_LOOP
            .with(|current| current.borrow().as_ref().and_then(Weak::upgrade).is_some());
        if already {
            panic!(
                "another EventLoop already exists in thread {:?}",
                thread::current().id()
            );
        }

        let shared = Arc::new(LoopShared {
            pending: Mutex::new(Vec::new()),
            waker: Waker::new()?,
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            thread: thread::current().id(),
        });
        let inner = Rc::new(LoopInner {
            shared: shared.clone(),
            poller: RefCell::new(new_default_poller()?),
            timers: RefCell::new(None),
            wakeup_channel: RefCell::new(None),
            local_pending: RefCell::new(Vec::new()),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            iteration: Cell::new(0),
        });
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Some(Rc::downgrade(&inner)));

        *inner.timers.borrow_mut() = Some(TimerQueue::new(&inner)?);

        let wakeup_channel = Channel::new(&inner, shared.waker.as_raw_fd());
        let wake_shared = shared.clone();
        wakeup_channel.set_read_callback(move |_| wake_shared.waker.drain());
        wakeup_channel.enable_reading();
        *inner.wakeup_channel.borrow_mut() = Some(wakeup_channel);

        trace!("EventLoop created in thread {:?}", shared.thread);
        Ok(EventLoop { inner })
    }

    /// Run the reactor until [`quit`] is observed.
    ///
    /// Each iteration polls with a timeout bounded by the nearest timer,
    /// dispatches the ready channels with the poll-return instant, then
    /// drains the pending-task lists.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        let inner = &self.inner;
        inner.assert_in_loop_thread();
        assert!(!inner.looping.get(), "EventLoop::run called reentrantly");
        inner.looping.set(true);
        // A quit that raced in before run() is honored, not reset.
        trace!("EventLoop starts looping");

        let mut active_channels: Vec<Rc<Channel>> = Vec::new();
        while !inner.shared.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let timeout_ms = inner.poll_timeout();
            let receive_time = inner
                .poller
                .borrow_mut()
                .poll(timeout_ms, &mut active_channels);
            inner.iteration.set(inner.iteration.get() + 1);

            inner.event_handling.set(true);
            for channel in &active_channels {
                channel.handle_event(receive_time);
            }
            inner.event_handling.set(false);

            inner.run_pending_tasks();
        }

        inner.looping.set(false);
        trace!("EventLoop stops looping");
    }

    /// Ask the loop to return from [`run`](EventLoop::run) once the current
    /// iteration completes.
    pub fn quit(&self) {
        self.inner.shared.quit.store(true, Ordering::Release);
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.inner.shared.clone(),
        }
    }

    /// Run `task` now. Present for symmetry with [`LoopHandle::run_in_loop`];
    /// an `EventLoop` reference implies being on the loop thread already.
    pub fn run_in_loop<F: FnOnce() + 'static>(&self, task: F) {
        self.inner.assert_in_loop_thread();
        task();
    }

    /// Defer `task` until after the current dispatch, keeping it on this
    /// thread. Unlike the handle's version the task need not be `Send`.
    pub fn queue_in_loop<F: FnOnce() + 'static>(&self, task: F) {
        self.inner.queue_local(Box::new(task));
    }

    pub fn run_at<F: FnMut() + 'static>(&self, when: Instant, callback: F) -> TimerId {
        self.inner.assert_in_loop_thread();
        self.inner
            .timer_queue()
            .add_timer(when, None, Box::new(callback))
    }

    pub fn run_after<F: FnMut() + 'static>(&self, delay: Duration, callback: F) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    pub fn run_every<F: FnMut() + 'static>(&self, interval: Duration, callback: F) -> TimerId {
        self.inner.assert_in_loop_thread();
        self.inner
            .timer_queue()
            .add_timer(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    pub fn cancel(&self, id: TimerId) {
        self.inner.assert_in_loop_thread();
        self.inner.timer_queue().cancel(id);
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.inner.assert_in_loop_thread();
    }

    /// Completed poll iterations; diagnostic only.
    pub fn iteration(&self) -> u64 {
        self.inner.iteration.get()
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        trace!("EventLoop in thread {:?} destructs", self.inner.shared.thread);
        if let Some(channel) = self.inner.wakeup_channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
        if let Some(timers) = self.inner.timers.borrow_mut().take() {
            timers.shutdown();
        }
        CURRENT_LOOP.with(|current| *current.borrow_mut() = None);
    }
}

impl LoopInner {
    pub(crate) fn current() -> Option<Rc<LoopInner>> {
        CURRENT_LOOP.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by thread {:?} was used from thread {:?}",
                self.shared.thread,
                thread::current().id()
            );
        }
    }

    pub(crate) fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel.clone());
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    #[allow(dead_code)]
    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    /// Queue a task from the loop thread itself.
    pub(crate) fn queue_local(&self, task: Box<dyn FnOnce()>) {
        self.assert_in_loop_thread();
        self.local_pending.borrow_mut().push(task);
        // Queued during the drain phase: the task will only be seen next
        // iteration, so keep the poll from blocking.
        if self.shared.calling_pending.load(Ordering::Acquire) {
            if let Err(err) = self.shared.waker.wake() {
                error!("wake loop: {}", err);
            }
        }
    }

    pub(crate) fn timer_queue(&self) -> Rc<TimerQueue> {
        self.timers
            .borrow()
            .as_ref()
            .expect("timer queue initialised at loop construction")
            .clone()
    }

    pub(crate) fn run_after(&self, delay: Duration, callback: Box<dyn FnMut()>) -> TimerId {
        self.assert_in_loop_thread();
        self.timer_queue()
            .add_timer(Instant::now() + delay, None, callback)
    }

    fn poll_timeout(&self) -> i32 {
        match self.timer_queue().next_expiration() {
            Some(next) => {
                // Round up so a sub-millisecond deadline does not spin.
                let delta = next.saturating_duration_since(Instant::now());
                let ms = delta
                    .checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(delta)
                    .as_millis();
                ms.min(POLL_TIMEOUT_MS as u128) as i32
            }
            None => POLL_TIMEOUT_MS,
        }
    }

    fn run_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = mem::take(&mut *self.shared.pending.lock().unwrap());
        let local = self.local_pending.take();
        for task in tasks {
            task();
        }
        for task in local {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Run `task` on the loop's thread: immediately when already there,
    /// queued (and the loop woken) otherwise.
    pub fn run_in_loop<F: FnOnce() + Send + 'static>(&self, task: F) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Append `task` to the loop's pending list. Tasks posted by one thread
    /// run in the order that thread posted them.
    pub fn queue_in_loop<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.shared.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            if let Err(err) = self.shared.waker.wake() {
                error!("wake loop: {}", err);
            }
        }
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            if let Err(err) = self.shared.waker.wake() {
                error!("wake loop: {}", err);
            }
        }
    }

    pub fn run_at<F: FnMut() + Send + 'static>(&self, when: Instant, callback: F) -> TimerId {
        self.schedule(when, None, callback)
    }

    pub fn run_after<F: FnMut() + Send + 'static>(&self, delay: Duration, callback: F) -> TimerId {
        self.schedule(Instant::now() + delay, None, callback)
    }

    pub fn run_every<F: FnMut() + Send + 'static>(
        &self,
        interval: Duration,
        callback: F,
    ) -> TimerId {
        self.schedule(Instant::now() + interval, Some(interval), callback)
    }

    /// Cancel a timer. If its callback has not started on the loop thread
    /// when the cancellation is serviced there, it never will; a periodic
    /// timer cancelled mid-fire does not re-arm.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(inner) = LoopInner::current() {
                inner.timer_queue().cancel(id);
            }
        });
    }

    fn schedule<F: FnMut() + Send + 'static>(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: F,
    ) -> TimerId {
        let id = next_timer_id();
        self.run_in_loop(move || {
            if let Some(inner) = LoopInner::current() {
                inner
                    .timer_queue()
                    .add_timer_with_id(id, when, interval, Box::new(callback));
            }
        });
        id
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::channel::Channel;
use crate::event_loop::LoopInner;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to a scheduled timer, usable from any thread for
/// cancellation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) fn next_timer_id() -> TimerId {
    TimerId(NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

struct TimerEntry {
    callback: Box<dyn FnMut()>,
    interval: Option<Duration>,
}

/// Ordered timer set, fired through a `timerfd` channel on the owning loop.
///
/// Keys are (expiration, sequence) so timers with equal deadlines fire in
/// creation order. All methods run on the loop thread; the `EventLoop` /
/// `LoopHandle` wrappers marshal cross-thread callers.
pub(crate) struct TimerQueue {
    timer_fd: OwnedFd,
    channel: Rc<Channel>,
    timers: RefCell<BTreeMap<(Instant, u64), TimerEntry>>,
    /// sequence -> scheduled expiration, for cancellation lookups.
    active: RefCell<HashMap<u64, Instant>>,
    /// Cancelled while their callbacks were running this round; consulted
    /// before a periodic re-insert.
    canceling: RefCell<HashSet<u64>>,
    calling_expired: Cell<bool>,
}

impl TimerQueue {
    pub(crate) fn new(event_loop: &Rc<LoopInner>) -> io::Result<Rc<TimerQueue>> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        // SAFETY: `timerfd_create(2)` ensures the fd is valid.
        let timer_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let channel = Channel::new(event_loop, timer_fd.as_raw_fd());
        let queue = Rc::new(TimerQueue {
            timer_fd,
            channel,
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(HashMap::new()),
            canceling: RefCell::new(HashSet::new()),
            calling_expired: Cell::new(false),
        });
        let weak = Rc::downgrade(&queue);
        queue.channel.set_read_callback(move |_| {
            if let Some(queue) = weak.upgrade() {
                queue.handle_read();
            }
        });
        queue.channel.enable_reading();
        Ok(queue)
    }

    pub(crate) fn add_timer(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) -> TimerId {
        let id = next_timer_id();
        self.add_timer_with_id(id, when, interval, callback);
        id
    }

    /// Insert a timer whose id was allocated up front (the cross-thread
    /// scheduling path hands the id back before the insertion runs here).
    pub(crate) fn add_timer_with_id(
        &self,
        id: TimerId,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) {
        let earliest_changed = {
            let mut timers = self.timers.borrow_mut();
            let earliest = timers.keys().next().map(|key| key.0);
            timers.insert((when, id.0), TimerEntry { callback, interval });
            earliest.map_or(true, |earliest| when < earliest)
        };
        self.active.borrow_mut().insert(id.0, when);
        if earliest_changed {
            self.reset_timerfd(when);
        }
    }

    pub(crate) fn cancel(&self, id: TimerId) {
        if let Some(expiration) = self.active.borrow_mut().remove(&id.0) {
            self.timers.borrow_mut().remove(&(expiration, id.0));
        } else if self.calling_expired.get() {
            // Currently firing: suppress the periodic re-insert.
            self.canceling.borrow_mut().insert(id.0);
        }
    }

    pub(crate) fn next_expiration(&self) -> Option<Instant> {
        self.timers.borrow().keys().next().map(|key| key.0)
    }

    /// Deregister the timerfd channel; part of loop teardown.
    pub(crate) fn shutdown(&self) {
        self.channel.disable_all();
        self.channel.remove();
    }

    fn handle_read(&self) {
        self.read_timerfd();
        let now = Instant::now();
        let mut expired = self.take_expired(now);

        self.canceling.borrow_mut().clear();
        self.calling_expired.set(true);
        for (_, entry) in expired.iter_mut() {
            (entry.callback)();
        }
        self.calling_expired.set(false);

        self.restart_periodic(expired);
        if let Some(next) = self.next_expiration() {
            self.reset_timerfd(next);
        }
    }

    fn take_expired(&self, now: Instant) -> Vec<((Instant, u64), TimerEntry)> {
        let mut timers = self.timers.borrow_mut();
        let future = timers.split_off(&(now, u64::MAX));
        let expired: Vec<_> = mem::replace(&mut *timers, future).into_iter().collect();
        drop(timers);

        let mut active = self.active.borrow_mut();
        for ((_, sequence), _) in &expired {
            active.remove(sequence);
        }
        expired
    }

    fn restart_periodic(&self, expired: Vec<((Instant, u64), TimerEntry)>) {
        for ((expiration, sequence), entry) in expired {
            let interval = match entry.interval {
                Some(interval) => interval,
                None => continue,
            };
            if self.canceling.borrow().contains(&sequence) {
                continue;
            }
            // Drift-free: the next deadline advances from the scheduled
            // expiration, not from now. A stalled loop fires back-to-back
            // until the schedule is current.
            let next = expiration + interval;
            self.timers.borrow_mut().insert((next, sequence), entry);
            self.active.borrow_mut().insert(sequence, next);
        }
    }

    fn read_timerfd(&self) {
        let mut buf = [0u8; 8];
        let res = syscall!(read(
            self.timer_fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        ));
        match res {
            Ok(8) => trace!("timerfd ticked {} times", u64::from_ne_bytes(buf)),
            Ok(n) => warn!("timerfd read {} bytes instead of 8", n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("timerfd read: {}", err),
        }
    }

    fn reset_timerfd(&self, when: Instant) {
        let mut delta = when.saturating_duration_since(Instant::now());
        if delta < Duration::from_micros(1) {
            delta = Duration::from_micros(1);
        }
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delta.as_secs() as libc::time_t,
                tv_nsec: delta.subsec_nanos() as libc::c_long,
            },
        };
        if let Err(err) = syscall!(timerfd_settime(
            self.timer_fd.as_raw_fd(),
            0,
            &new_value,
            ptr::null_mut(),
        )) {
            warn!("timerfd_settime: {}", err);
        }
    }
}

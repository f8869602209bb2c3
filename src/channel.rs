use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::{trace, warn};

use crate::event_loop::LoopInner;

const NONE_EVENT: libc::c_short = 0;
const READ_EVENT: libc::c_short = libc::POLLIN | libc::POLLPRI;
const WRITE_EVENT: libc::c_short = libc::POLLOUT;

/// A selectable I/O channel: the per-fd dispatcher of one event loop.
///
/// A `Channel` never owns its file descriptor; the owning object (acceptor,
/// connection, timer queue, waker) controls the fd's lifetime and must
/// deregister the channel before closing it. All methods are loop-thread
/// only.
pub(crate) struct Channel {
    event_loop: Weak<LoopInner>,
    fd: RawFd,
    events: Cell<libc::c_short>,
    revents: Cell<libc::c_short>,
    // Poller bookkeeping: slot index for poll(2), registration state for
    // epoll.
    index: Cell<i32>,
    log_hup: Cell<bool>,
    tie: RefCell<Option<Weak<dyn Any>>>,
    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    read_callback: RefCell<Option<Box<dyn FnMut(Instant)>>>,
    write_callback: RefCell<Option<Box<dyn FnMut()>>>,
    close_callback: RefCell<Option<Box<dyn FnMut()>>>,
    error_callback: RefCell<Option<Box<dyn FnMut()>>>,
}

impl Channel {
    pub(crate) fn new(event_loop: &Rc<LoopInner>, fd: RawFd) -> Rc<Channel> {
        Rc::new(Channel {
            event_loop: Rc::downgrade(event_loop),
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            index: Cell::new(-1),
            log_hup: Cell::new(true),
            tie: RefCell::new(None),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> libc::c_short {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: libc::c_short) {
        self.revents.set(revents);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.get()
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    pub(crate) fn set_read_callback<F: FnMut(Instant) + 'static>(&self, cb: F) {
        *self.read_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub(crate) fn set_write_callback<F: FnMut() + 'static>(&self, cb: F) {
        *self.write_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback<F: FnMut() + 'static>(&self, cb: F) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub(crate) fn set_error_callback<F: FnMut() + 'static>(&self, cb: F) {
        *self.error_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Drop all callbacks, releasing whatever they captured.
    pub(crate) fn clear_callbacks(&self) {
        *self.read_callback.borrow_mut() = None;
        *self.write_callback.borrow_mut() = None;
        *self.close_callback.borrow_mut() = None;
        *self.error_callback.borrow_mut() = None;
    }

    /// Tie this channel to its owner. `handle_event` upgrades the weak
    /// reference and keeps the owner alive for the duration of the dispatch;
    /// if the upgrade fails the dispatch is skipped entirely.
    pub(crate) fn tie(&self, owner: &Rc<dyn Any>) {
        *self.tie.borrow_mut() = Some(Rc::downgrade(owner));
    }

    pub(crate) fn do_not_log_hup(&self) {
        self.log_hup.set(false);
    }

    pub(crate) fn enable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    pub(crate) fn disable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    pub(crate) fn enable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    pub(crate) fn disable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub(crate) fn disable_all(self: &Rc<Self>) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    fn update(self: &Rc<Self>) {
        self.added_to_loop.set(true);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Deregister from the poller. Must be called with an empty interest
    /// set, before the owner drops the channel.
    pub(crate) fn remove(&self) {
        assert!(self.is_none_event());
        self.added_to_loop.set(false);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    pub(crate) fn handle_event(self: &Rc<Self>, receive_time: Instant) {
        let tie = self.tie.borrow().clone();
        match tie {
            Some(tie) => {
                // Hold the owner across the dispatch so a callback that
                // drops the last user-visible reference cannot free it
                // mid-dispatch.
                if let Some(_guard) = tie.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        self.event_handling.set(true);
        let revents = self.revents.get();
        trace!("fd={} handling {{{}}}", self.fd, events_to_string(revents));

        if revents & libc::POLLNVAL != 0 {
            warn!("fd={} POLLNVAL", self.fd);
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            if let Some(cb) = self.error_callback.borrow_mut().as_mut() {
                cb();
            }
        }
        if revents & libc::POLLHUP != 0 && revents & libc::POLLIN == 0 {
            if self.log_hup.get() {
                warn!("fd={} POLLHUP", self.fd);
            }
            if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
                cb();
            }
        }
        if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) != 0 {
            if let Some(cb) = self.read_callback.borrow_mut().as_mut() {
                cb(receive_time);
            }
        }
        if revents & libc::POLLOUT != 0 {
            if let Some(cb) = self.write_callback.borrow_mut().as_mut() {
                cb();
            }
        }
        self.event_handling.set(false);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.get());
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &events_to_string(self.events.get()))
            .finish()
    }
}

pub(crate) fn events_to_string(events: libc::c_short) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (libc::POLLIN, "IN"),
        (libc::POLLPRI, "PRI"),
        (libc::POLLOUT, "OUT"),
        (libc::POLLHUP, "HUP"),
        (libc::POLLRDHUP, "RDHUP"),
        (libc::POLLERR, "ERR"),
        (libc::POLLNVAL, "NVAL"),
    ] {
        if events & bit != 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
        }
    }
    out
}

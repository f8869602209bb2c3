use std::env;
use std::io;
use std::rc::Rc;
use std::time::Instant;

use crate::channel::Channel;

mod epoll;
mod poll;

pub(crate) use self::epoll::EpollPoller;
pub(crate) use self::poll::PollPoller;

/// The readiness multiplexer behind one event loop.
///
/// A poller does not own the channels it watches; owners deregister a
/// channel before destroying it. Every method must be called on the owning
/// loop's thread.
pub(crate) trait Poller {
    /// Block for at most `timeout_ms` waiting for readiness, fill
    /// `active_channels` with the ready channels (their `revents` set), and
    /// return the instant the kernel call returned.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Instant;

    /// Register or re-register `channel` with its current interest set.
    fn update_channel(&mut self, channel: Rc<Channel>);

    /// Forget `channel`. Its interest set must already be empty.
    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

/// epoll unless `EVIO_USE_POLL` is set in the environment.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    if env::var_os("EVIO_USE_POLL").is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        Ok(Box::new(EpollPoller::new()?))
    }
}

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::Poller;

/// `poll(2)`-backed poller.
///
/// Keeps a `pollfd` vector parallel to the channel map; each channel stores
/// its slot index. A channel with an empty interest set stays in the vector
/// with its fd negated so the kernel ignores the slot.
pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, n_events: usize, active_channels: &mut Vec<Rc<Channel>>) {
        let mut left = n_events;
        for pollfd in &self.pollfds {
            if left == 0 {
                break;
            }
            if pollfd.revents > 0 {
                left -= 1;
                let channel = &self.channels[&pollfd.fd];
                channel.set_revents(pollfd.revents);
                active_channels.push(channel.clone());
            }
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Instant {
        let res = syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms,
        ));
        let now = Instant::now();
        match res {
            Ok(n_events) if n_events > 0 => {
                trace!("{} events happened", n_events);
                self.fill_active_channels(n_events as usize, active_channels);
            }
            Ok(_) => trace!("nothing happened"),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("poll: {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: Rc<Channel>) {
        let fd = channel.fd();
        trace!("update fd={} events={:#x}", fd, channel.events());
        if channel.index() < 0 {
            // A new channel: append a slot.
            debug_assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events(),
                revents: 0,
            });
            channel.set_index((self.pollfds.len() - 1) as i32);
            self.channels.insert(fd, channel);
        } else {
            debug_assert!(self.has_channel(&channel));
            let index = channel.index() as usize;
            let pollfd = &mut self.pollfds[index];
            debug_assert!(pollfd.fd == fd || pollfd.fd == -fd - 1);
            pollfd.events = channel.events();
            pollfd.revents = 0;
            // Negating the fd makes the kernel skip this slot.
            pollfd.fd = if channel.is_none_event() { -fd - 1 } else { fd };
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("remove fd={}", fd);
        debug_assert!(self.has_channel(channel));
        assert!(channel.is_none_event());
        let index = channel.index() as usize;
        self.channels.remove(&fd);
        if index == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            // Swap-pop, then patch the displaced channel's slot index.
            let moved_fd = self.pollfds.last().expect("pollfds empty").fd;
            self.pollfds.swap_remove(index);
            let moved_fd = if moved_fd < 0 { -moved_fd - 1 } else { moved_fd };
            self.channels[&moved_fd].set_index(index as i32);
        }
        channel.set_index(-1);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |stored| std::ptr::eq(Rc::as_ptr(stored), channel))
    }
}

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

use log::{error, trace};

use crate::channel::{events_to_string, Channel};
use crate::poller::Poller;

// Channel registration states kept in `Channel::index`.
const NEW: i32 = -1;
const ADDED: i32 = 1;
const DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// `epoll(7)`-backed poller.
///
/// `Channel::index` tracks whether the fd is *new* (never added), *added*
/// (in the kernel interest set and the map), or *deleted* (known to the map
/// but removed from the kernel set because its interest went empty).
pub(crate) struct EpollPoller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollPoller {
            ep,
            events: Vec::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    fn fill_active_channels(&self, n_events: usize, active_channels: &mut Vec<Rc<Channel>>) {
        debug_assert!(n_events <= self.events.len());
        for event in &self.events[..n_events] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(event.events as libc::c_short);
                active_channels.push(channel.clone());
            }
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.events() as u16 as u32,
            u64: channel.fd() as u64,
        };
        let op_name = match op {
            libc::EPOLL_CTL_ADD => "ADD",
            libc::EPOLL_CTL_MOD => "MOD",
            _ => "DEL",
        };
        trace!(
            "epoll_ctl {} fd={} {{{}}}",
            op_name,
            channel.fd(),
            events_to_string(channel.events())
        );
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, channel.fd(), &mut event)) {
            if op == libc::EPOLL_CTL_ADD {
                panic!("epoll_ctl ADD fd={}: {}", channel.fd(), err);
            }
            error!("epoll_ctl {} fd={}: {}", op_name, channel.fd(), err);
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Instant {
        trace!("epoll watching {} fds", self.channels.len());
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = Instant::now();
        match res {
            Ok(n_events) => {
                let n_events = n_events as usize;
                // This is safe because `epoll_wait` ensures that `n_events`
                // entries are assigned.
                unsafe { self.events.set_len(n_events) };
                if n_events > 0 {
                    trace!("{} events happened", n_events);
                    self.fill_active_channels(n_events, active_channels);
                    if n_events == self.events.capacity() {
                        self.events.reserve(self.events.capacity());
                    }
                } else {
                    trace!("nothing happened");
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait: {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: Rc<Channel>) {
        let index = channel.index();
        let fd = channel.fd();
        trace!(
            "update fd={} events={{{}}} index={}",
            fd,
            events_to_string(channel.events()),
            index
        );
        if index == NEW || index == DELETED {
            if index == NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                debug_assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, &channel);
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            debug_assert_eq!(index, ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, &channel);
                channel.set_index(DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, &channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("remove fd={}", fd);
        debug_assert!(self.has_channel(channel));
        assert!(channel.is_none_event());
        let index = channel.index();
        self.channels.remove(&fd);
        if index == ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |stored| std::ptr::eq(Rc::as_ptr(stored), channel))
    }
}

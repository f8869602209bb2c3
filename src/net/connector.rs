use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::net::socket;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// Client-side connect state machine with exponential backoff.
///
/// A non-blocking `connect(2)` mostly returns `EINPROGRESS`; the socket is
/// then watched for writability and `SO_ERROR` decides the outcome. Refused
/// or unreachable destinations retry with a doubling delay capped at 30s;
/// hard errors stop the connector.
pub(crate) struct Connector {
    event_loop: Rc<LoopInner>,
    server_addr: SocketAddr,
    connect: Cell<bool>,
    state: Cell<State>,
    init_retry_delay: Cell<Duration>,
    max_retry_delay: Cell<Duration>,
    retry_delay: Cell<Duration>,
    channel: RefCell<Option<Rc<Channel>>>,
    socket: RefCell<Option<OwnedFd>>,
    new_connection_callback: RefCell<Option<Box<dyn FnMut(OwnedFd)>>>,
}

impl Connector {
    pub(crate) fn new(event_loop: Rc<LoopInner>, server_addr: SocketAddr) -> Rc<Connector> {
        Rc::new(Connector {
            event_loop,
            server_addr,
            connect: Cell::new(false),
            state: Cell::new(State::Disconnected),
            init_retry_delay: Cell::new(INIT_RETRY_DELAY),
            max_retry_delay: Cell::new(MAX_RETRY_DELAY),
            retry_delay: Cell::new(INIT_RETRY_DELAY),
            channel: RefCell::new(None),
            socket: RefCell::new(None),
            new_connection_callback: RefCell::new(None),
        })
    }

    /// Tune the backoff window; applies from the next (re)start.
    pub(crate) fn set_retry_delay(&self, initial: Duration, max: Duration) {
        self.init_retry_delay.set(initial);
        self.max_retry_delay.set(max.max(initial));
        self.retry_delay.set(initial);
    }

    pub(crate) fn set_new_connection_callback<F: FnMut(OwnedFd) + 'static>(&self, callback: F) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub(crate) fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub(crate) fn start(self: &Rc<Self>) {
        self.connect.set(true);
        self.start_in_loop();
    }

    /// Abort a pending connect or retry.
    pub(crate) fn stop(self: &Rc<Self>) {
        self.connect.set(false);
        if self.state.get() == State::Connecting {
            self.state.set(State::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel() {
                self.retry(socket);
            }
        }
    }

    /// Re-arm after a lost connection, starting from the initial delay.
    pub(crate) fn restart(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.state.set(State::Disconnected);
        self.retry_delay.set(self.init_retry_delay.get());
        self.connect.set(true);
        self.start_in_loop();
    }

    fn start_in_loop(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state.get(), State::Disconnected);
        if !self.connect.get() {
            debug!("Connector: do not connect");
            return;
        }
        let socket = match socket::new_stream_socket(socket::domain_for(&self.server_addr)) {
            Ok(socket) => socket,
            Err(err) => {
                error!("Connector: socket: {}", err);
                return;
            }
        };
        let errno = match socket::connect(socket.as_raw_fd(), &self.server_addr) {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(libc::EINVAL),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH
            | libc::ETIMEDOUT => self.retry(socket),

            _ => {
                error!(
                    "Connector: connect to {}: {}",
                    self.server_addr,
                    io::Error::from_raw_os_error(errno)
                );
            }
        }
    }

    fn connecting(self: &Rc<Self>, socket: OwnedFd) {
        self.state.set(State::Connecting);
        let channel = Channel::new(&self.event_loop, socket.as_raw_fd());
        *self.socket.borrow_mut() = Some(socket);
        let this = Rc::downgrade(self);
        channel.set_write_callback(move || {
            if let Some(connector) = this.upgrade() {
                connector.handle_write();
            }
        });
        let this = Rc::downgrade(self);
        channel.set_error_callback(move || {
            if let Some(connector) = this.upgrade() {
                connector.handle_error();
            }
        });
        channel.enable_writing();
        *self.channel.borrow_mut() = Some(channel);
    }

    /// Detach the watch channel and recover the socket. The channel object
    /// itself is released by a queued task because this runs from inside
    /// its own event dispatch.
    fn remove_and_reset_channel(self: &Rc<Self>) -> Option<OwnedFd> {
        if let Some(channel) = self.channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
            self.event_loop.queue_local(Box::new(move || drop(channel)));
        }
        self.socket.borrow_mut().take()
    }

    fn handle_write(self: &Rc<Self>) {
        debug!("Connector::handle_write state={:?}", self.state.get());
        if self.state.get() != State::Connecting {
            assert_eq!(self.state.get(), State::Disconnected);
            return;
        }
        let socket = match self.remove_and_reset_channel() {
            Some(socket) => socket,
            None => return,
        };
        let err = socket::socket_error(socket.as_raw_fd());
        if err != 0 {
            warn!(
                "Connector: SO_ERROR = {}",
                io::Error::from_raw_os_error(err)
            );
            self.retry(socket);
        } else if socket::is_self_connect(socket.as_raw_fd()) {
            warn!("Connector: self connect");
            self.retry(socket);
        } else {
            self.state.set(State::Connected);
            if self.connect.get() {
                if let Some(callback) = self.new_connection_callback.borrow_mut().as_mut() {
                    callback(socket);
                }
            }
        }
    }

    fn handle_error(self: &Rc<Self>) {
        error!("Connector::handle_error state={:?}", self.state.get());
        if self.state.get() == State::Connecting {
            if let Some(socket) = self.remove_and_reset_channel() {
                let err = socket::socket_error(socket.as_raw_fd());
                debug!("SO_ERROR = {}", io::Error::from_raw_os_error(err));
                self.retry(socket);
            }
        }
    }

    /// Close the failed socket and schedule another attempt, backing off
    /// exponentially up to the cap.
    fn retry(self: &Rc<Self>, socket: OwnedFd) {
        drop(socket);
        self.state.set(State::Disconnected);
        if !self.connect.get() {
            debug!("Connector: do not connect");
            return;
        }
        let delay = self.retry_delay.get();
        info!(
            "Connector: retry connecting to {} in {:?}",
            self.server_addr, delay
        );
        let this = Rc::downgrade(self);
        self.event_loop.run_after(
            delay,
            Box::new(move || {
                if let Some(connector) = this.upgrade() {
                    if connector.connect.get() && connector.state.get() == State::Disconnected {
                        connector.start_in_loop();
                    }
                }
            }),
        );
        self.retry_delay.set((delay * 2).min(self.max_retry_delay.get()));
    }
}

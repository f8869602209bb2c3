use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{LoopHandle, LoopInner};
use crate::net::socket;
use crate::net::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Connections pinned to this loop thread, keyed by id.
    ///
    /// This table holds the strong self-reference that keeps a connection
    /// (and its buffers) alive from `connect_established` until
    /// `connect_destroyed`, independent of any user-held references; it also
    /// lets a `ConnectionHandle` find the connection from a marshalled task.
    static LOCAL_CONNECTIONS: RefCell<HashMap<u64, TcpConnectionPtr>> =
        RefCell::new(HashMap::new());
}

/// Shared reference to a connection; confined to the connection's loop
/// thread. For cross-thread use take a [`ConnectionHandle`].
pub type TcpConnectionPtr = Rc<TcpConnection>;

pub(crate) type CloseCallback = Box<dyn Fn(&TcpConnectionPtr)>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One established TCP connection, pinned to one loop.
///
/// Created by `TcpServer` on accept or `TcpClient` on connect; user code
/// only ever sees it through callbacks. All methods must run on the owning
/// loop's thread.
pub struct TcpConnection {
    event_loop: Rc<LoopInner>,
    id: u64,
    name: String,
    state: Cell<State>,
    reading: Cell<bool>,
    destroyed: Cell<bool>,
    socket: OwnedFd,
    channel: Rc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    high_water_mark: Cell<usize>,
    connection_callback: RefCell<Option<ConnectionCallback>>,
    message_callback: RefCell<Option<MessageCallback>>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_callback: RefCell<Option<HighWaterMarkCallback>>,
    close_callback: RefCell<Option<CloseCallback>>,
    context: RefCell<Option<Box<dyn Any>>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Rc<LoopInner>,
        name: String,
        socket: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let fd = socket.as_raw_fd();
        let conn = Rc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let channel = Channel::new(&event_loop, fd);
            let this = weak.clone();
            channel.set_read_callback(move |receive_time| {
                if let Some(conn) = this.upgrade() {
                    conn.handle_read(receive_time);
                }
            });
            let this = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = this.upgrade() {
                    conn.handle_write();
                }
            });
            let this = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = this.upgrade() {
                    conn.handle_close();
                }
            });
            let this = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = this.upgrade() {
                    conn.handle_error();
                }
            });
            TcpConnection {
                event_loop,
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                name,
                state: Cell::new(State::Connecting),
                reading: Cell::new(false),
                destroyed: Cell::new(false),
                socket,
                channel,
                local_addr,
                peer_addr,
                input_buffer: RefCell::new(Buffer::new()),
                output_buffer: RefCell::new(Buffer::new()),
                high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
                connection_callback: RefCell::new(None),
                message_callback: RefCell::new(None),
                write_complete_callback: RefCell::new(None),
                high_water_mark_callback: RefCell::new(None),
                close_callback: RefCell::new(None),
                context: RefCell::new(None),
            }
        });
        trace!("TcpConnection::new [{}] fd={}", conn.name, fd);
        if let Err(err) = socket::set_keep_alive(fd, true) {
            warn!("SO_KEEPALIVE on [{}]: {}", conn.name, err);
        }
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.get() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state.get() == State::Disconnected
    }

    /// Buffered output not yet on the wire.
    pub fn output_bytes(&self) -> usize {
        self.output_buffer.borrow().readable_bytes()
    }

    /// Arbitrary per-connection user state, e.g. a protocol decoder.
    pub fn context(&self) -> RefMut<'_, Option<Box<dyn Any>>> {
        self.context.borrow_mut()
    }

    /// A `Send + Sync` handle addressing this connection through its loop.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            event_loop: self.event_loop.handle(),
            id: self.id,
        }
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.borrow_mut() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.borrow_mut() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.borrow_mut() = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.set(mark);
        *self.high_water_mark_callback.borrow_mut() = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.borrow_mut() = Some(callback);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = socket::set_tcp_no_delay(self.socket.as_raw_fd(), on) {
            warn!("TCP_NODELAY on [{}]: {}", self.name, err);
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(err) = socket::set_keep_alive(self.socket.as_raw_fd(), on) {
            warn!("SO_KEEPALIVE on [{}]: {}", self.name, err);
        }
    }

    /// Send `data`, guaranteed contiguous on the wire. When nothing is
    /// buffered the write is attempted directly; the remainder is buffered
    /// and write interest enabled. Crossing the high-water mark queues that
    /// callback once.
    pub fn send(self: &Rc<Self>, data: &[u8]) {
        if self.state.get() != State::Connected {
            warn!("[{}] disconnected, give up writing", self.name);
            return;
        }
        self.event_loop.assert_in_loop_thread();
        self.send_in_loop(data);
    }

    fn send_in_loop(self: &Rc<Self>, data: &[u8]) {
        let fd = self.socket.as_raw_fd();
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        if !self.channel.is_writing() && self.output_buffer.borrow().readable_bytes() == 0 {
            match socket::write(fd, data) {
                Ok(n) => {
                    nwrote = n;
                    remaining -= n;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("[{}] send: {}", self.name, err);
                    if let Some(libc::EPIPE) | Some(libc::ECONNRESET) = err.raw_os_error() {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = self.output_buffer.borrow().readable_bytes();
            let mark = self.high_water_mark.get();
            if old_len + remaining >= mark && old_len < mark {
                if let Some(callback) = self.high_water_mark_callback.borrow().clone() {
                    let conn = self.clone();
                    let total = old_len + remaining;
                    self.event_loop
                        .queue_local(Box::new(move || callback(&conn, total)));
                }
            }
            self.output_buffer.borrow_mut().append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close: no more writes from this side, the peer drains what is
    /// buffered and then reads EOF.
    pub fn shutdown(self: &Rc<Self>) {
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnecting);
            self.shutdown_in_loop();
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = socket::shutdown_write(self.socket.as_raw_fd()) {
                error!("[{}] shutdown: {}", self.name, err);
            }
        }
    }

    /// Close without waiting for buffered output; runs after the current
    /// dispatch.
    pub fn force_close(self: &Rc<Self>) {
        if let State::Connected | State::Disconnecting = self.state.get() {
            self.state.set(State::Disconnecting);
            let conn = self.clone();
            self.event_loop.queue_local(Box::new(move || {
                if let State::Connected | State::Disconnecting = conn.state.get() {
                    conn.handle_close();
                }
            }));
        }
    }

    pub fn force_close_with_delay(self: &Rc<Self>, delay: Duration) {
        if let State::Connected | State::Disconnecting = self.state.get() {
            self.state.set(State::Disconnecting);
            let this = Rc::downgrade(self);
            self.event_loop.run_after(
                delay,
                Box::new(move || {
                    if let Some(conn) = this.upgrade() {
                        conn.force_close();
                    }
                }),
            );
        }
    }

    pub fn start_read(self: &Rc<Self>) {
        if !self.reading.get() || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.set(true);
        }
    }

    pub fn stop_read(self: &Rc<Self>) {
        if self.reading.get() || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.set(false);
        }
    }

    /// Connecting -> Connected: tie the channel, enable reading, register
    /// the loop-local strong reference, and announce the connection.
    pub(crate) fn connect_established(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state.get(), State::Connecting);
        self.state.set(State::Connected);
        let owner: Rc<dyn Any> = self.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();
        self.reading.set(true);

        LOCAL_CONNECTIONS.with(|table| table.borrow_mut().insert(self.id, self.clone()));

        if let Some(callback) = self.connection_callback.borrow().clone() {
            callback(self);
        }
    }

    /// The final teardown step: deregister the channel and release the
    /// loop-local self reference. Always reached through a queued task, so
    /// any in-flight dispatch has completed.
    pub(crate) fn connect_destroyed(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.destroyed.replace(true) {
            return;
        }
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnected);
            self.channel.disable_all();
            if let Some(callback) = self.connection_callback.borrow().clone() {
                callback(self);
            }
        }
        self.channel.remove();
        self.channel.clear_callbacks();
        LOCAL_CONNECTIONS.with(|table| table.borrow_mut().remove(&self.id));
    }

    /// Defer `connect_destroyed` until after the current dispatch.
    pub(crate) fn queue_destroy(self: &Rc<Self>) {
        let conn = self.clone();
        self.event_loop
            .queue_local(Box::new(move || conn.connect_destroyed()));
    }

    fn handle_read(self: &Rc<Self>, receive_time: Instant) {
        self.event_loop.assert_in_loop_thread();
        let mut input = self.input_buffer.borrow_mut();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                // A lone POLLHUP may already have closed us this dispatch.
                if self.state.get() != State::Disconnected {
                    self.handle_close();
                }
            }
            Ok(_) => {
                let callback = self.message_callback.borrow().clone();
                if let Some(callback) = callback {
                    callback(self, &mut *input, receive_time);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!("[{}] read: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("[{}] is down, no more writing", self.name);
            return;
        }
        let mut output = self.output_buffer.borrow_mut();
        match socket::write(self.channel.fd(), output.peek()) {
            Ok(n) => {
                output.consume(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state.get() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("[{}] write: {}", self.name, err),
        }
    }

    fn queue_write_complete(self: &Rc<Self>) {
        if let Some(callback) = self.write_complete_callback.borrow().clone() {
            let conn = self.clone();
            self.event_loop
                .queue_local(Box::new(move || callback(&conn)));
        }
    }

    fn handle_close(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        trace!("[{}] handle_close state={:?}", self.name, self.state.get());
        assert!(matches!(
            self.state.get(),
            State::Connected | State::Disconnecting
        ));
        self.state.set(State::Disconnected);
        self.channel.disable_all();

        if let Some(callback) = self.connection_callback.borrow().clone() {
            callback(self);
        }
        // The registry's close callback removes us and queues
        // connect_destroyed.
        let callback = self.close_callback.borrow();
        if let Some(callback) = callback.as_ref() {
            callback(self);
        }
    }

    fn handle_error(&self) {
        let err = socket::socket_error(self.socket.as_raw_fd());
        error!(
            "[{}] SO_ERROR = {}",
            self.name,
            io::Error::from_raw_os_error(err)
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state.get()
        );
    }
}

/// Cross-thread face of a [`TcpConnection`].
///
/// Operations marshal onto the connection's loop and become no-ops once the
/// connection has been destroyed, so a stale handle is harmless.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    event_loop: LoopHandle,
    id: u64,
}

impl ConnectionHandle {
    fn with_connection<F>(&self, f: F)
    where
        F: FnOnce(&TcpConnectionPtr) + Send + 'static,
    {
        let id = self.id;
        self.event_loop.run_in_loop(move || {
            let conn = LOCAL_CONNECTIONS.with(|table| table.borrow().get(&id).cloned());
            if let Some(conn) = conn {
                f(&conn);
            }
        });
    }

    /// Copy `data` and send it from the connection's loop. One call's bytes
    /// stay contiguous on the wire; the interleaving of concurrent callers
    /// is unspecified.
    pub fn send(&self, data: &[u8]) {
        let data = data.to_vec();
        self.with_connection(move |conn| conn.send(&data));
    }

    pub fn shutdown(&self) {
        self.with_connection(|conn| conn.shutdown());
    }

    pub fn force_close(&self) {
        self.with_connection(|conn| conn.force_close());
    }

    /// Tear the connection down regardless of state; used when its server
    /// or client goes away.
    pub(crate) fn destroy(&self) {
        self.with_connection(|conn| conn.queue_destroy());
    }
}

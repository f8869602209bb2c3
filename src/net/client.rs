use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, info};

use crate::buffer::Buffer;
use crate::event_loop::{EventLoop, LoopInner};
use crate::net::connection::{TcpConnection, TcpConnectionPtr};
use crate::net::connector::Connector;
use crate::net::{
    default_connection_callback, default_message_callback, socket, ConnectionCallback,
    MessageCallback, WriteCompleteCallback,
};

/// A TCP client: one connector, at most one live connection, both pinned to
/// the loop that created the client.
pub struct TcpClient {
    event_loop: Rc<LoopInner>,
    connector: Rc<Connector>,
    name: String,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    retry: Cell<bool>,
    connect: Cell<bool>,
    next_conn_id: Cell<u64>,
    connection: RefCell<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    pub fn new(event_loop: &EventLoop, server_addr: SocketAddr, name: &str) -> Rc<TcpClient> {
        let inner = event_loop.inner().clone();
        let connector = Connector::new(inner.clone(), server_addr);
        let client = Rc::new(TcpClient {
            event_loop: inner,
            connector,
            name: name.to_owned(),
            connection_callback: RefCell::new(default_connection_callback()),
            message_callback: RefCell::new(default_message_callback()),
            write_complete_callback: RefCell::new(None),
            retry: Cell::new(false),
            connect: Cell::new(false),
            next_conn_id: Cell::new(1),
            connection: RefCell::new(None),
        });
        let weak = Rc::downgrade(&client);
        client.connector.set_new_connection_callback(move |socket| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(socket);
            }
        });
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connector.server_addr()
    }

    /// The live connection, if established.
    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.borrow().clone()
    }

    /// Reconnect automatically after a lost connection.
    pub fn enable_retry(&self) {
        self.retry.set(true);
    }

    /// Connect backoff window: first delay and its doubling cap.
    pub fn set_retry_delay(&self, initial: Duration, max: Duration) {
        self.connector.set_retry_delay(initial, max);
    }

    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.connection_callback.borrow_mut() = std::sync::Arc::new(callback);
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        *self.message_callback.borrow_mut() = std::sync::Arc::new(callback);
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.write_complete_callback.borrow_mut() = Some(std::sync::Arc::new(callback));
    }

    pub fn connect(self: &Rc<Self>) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.connector.server_addr()
        );
        self.connect.set(true);
        self.connector.start();
    }

    /// Graceful close: half-close the connection once its output drains.
    pub fn disconnect(&self) {
        self.connect.set(false);
        if let Some(conn) = self.connection.borrow().as_ref() {
            conn.shutdown();
        }
    }

    /// Abort a pending connect or retry.
    pub fn stop(&self) {
        self.connect.set(false);
        self.connector.stop();
    }

    fn new_connection(self: &Rc<Self>, socket: OwnedFd) {
        self.event_loop.assert_in_loop_thread();
        let peer_addr = match socket::peer_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpClient::new_connection getpeername: {}", err);
                return;
            }
        };
        let local_addr = match socket::local_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpClient::new_connection getsockname: {}", err);
                return;
            }
        };
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(
            self.event_loop.clone(),
            conn_name,
            socket,
            local_addr,
            peer_addr,
        );
        conn.set_connection_callback(self.connection_callback.borrow().clone());
        conn.set_message_callback(self.message_callback.borrow().clone());
        if let Some(callback) = self.write_complete_callback.borrow().clone() {
            conn.set_write_complete_callback(callback);
        }
        let this = Rc::downgrade(self);
        conn.set_close_callback(Box::new(move |conn: &TcpConnectionPtr| {
            if let Some(client) = this.upgrade() {
                client.remove_connection(conn);
            } else {
                conn.queue_destroy();
            }
        }));
        *self.connection.borrow_mut() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        *self.connection.borrow_mut() = None;
        conn.queue_destroy();
        if self.retry.get() && self.connect.get() {
            info!(
                "TcpClient::connect [{}] - reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.connector.stop();
        // A connection outliving its client tears itself down on close.
        if let Some(conn) = self.connection.borrow_mut().take() {
            conn.set_close_callback(Box::new(|conn: &TcpConnectionPtr| {
                conn.queue_destroy();
            }));
            conn.force_close();
        }
    }
}

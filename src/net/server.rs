use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::buffer::Buffer;
use crate::event_loop::{EventLoop, LoopInner};
use crate::event_loop_pool::EventLoopThreadPool;
use crate::net::acceptor::Acceptor;
use crate::net::connection::{ConnectionHandle, TcpConnection, TcpConnectionPtr};
use crate::net::{
    default_connection_callback, default_message_callback, socket, ConnectionCallback,
    MessageCallback, WriteCompleteCallback,
};
use std::time::Instant;

/// A multi-loop TCP server.
///
/// The acceptor runs on the loop that created the server; connections are
/// distributed round-robin over the pool's I/O loops (or stay on the base
/// loop with zero threads) and live there until closed. The name registry
/// maps each connection to a cross-thread handle so teardown can reach it
/// from any thread.
pub struct TcpServer {
    event_loop: Rc<LoopInner>,
    ip_port: String,
    name: String,
    acceptor: Rc<Acceptor>,
    pool: RefCell<EventLoopThreadPool>,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    thread_init_callback: RefCell<Option<Arc<dyn Fn() + Send + Sync>>>,
    started: Cell<bool>,
    next_conn_id: Cell<u64>,
    connections: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
}

impl TcpServer {
    pub fn new(
        event_loop: &EventLoop,
        listen_addr: &SocketAddr,
        name: &str,
    ) -> io::Result<Rc<TcpServer>> {
        let inner = event_loop.inner().clone();
        let acceptor = Acceptor::new(&inner, listen_addr)?;
        let ip_port = acceptor.listen_addr().to_string();
        let pool = EventLoopThreadPool::new(event_loop.handle(), name);

        let server = Rc::new(TcpServer {
            event_loop: inner,
            ip_port,
            name: name.to_owned(),
            acceptor,
            pool: RefCell::new(pool),
            connection_callback: RefCell::new(default_connection_callback()),
            message_callback: RefCell::new(default_message_callback()),
            write_complete_callback: RefCell::new(None),
            thread_init_callback: RefCell::new(None),
            started: Cell::new(false),
            next_conn_id: Cell::new(1),
            connections: Arc::new(Mutex::new(HashMap::new())),
        });
        let weak = Rc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            });
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The bound address; useful when listening on port 0.
    pub fn listen_addr(&self) -> SocketAddr {
        self.acceptor.listen_addr()
    }

    /// Number of dedicated I/O loop threads. 0 (the default) keeps all
    /// connections on the base loop. Must be called before `start`.
    pub fn set_thread_num(&self, thread_num: usize) {
        assert!(!self.started.get(), "set_thread_num after start");
        self.pool.borrow_mut().set_thread_num(thread_num);
    }

    pub fn set_thread_init_callback<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.thread_init_callback.borrow_mut() = Some(Arc::new(callback));
    }

    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.connection_callback.borrow_mut() = Arc::new(callback);
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync + 'static,
    {
        *self.message_callback.borrow_mut() = Arc::new(callback);
    }

    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        *self.write_complete_callback.borrow_mut() = Some(Arc::new(callback));
    }

    /// Start the loop pool and begin accepting. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if !self.started.replace(true) {
            self.pool
                .borrow_mut()
                .start_with_init(self.thread_init_callback.borrow().clone())?;
            self.acceptor.listen()?;
        }
        Ok(())
    }

    fn new_connection(&self, socket: OwnedFd, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.pool.borrow_mut().get_next_loop();
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );
        let local_addr = match socket::local_addr(socket.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpServer::new_connection getsockname: {}", err);
                return;
            }
        };

        let connection_callback = self.connection_callback.borrow().clone();
        let message_callback = self.message_callback.borrow().clone();
        let write_complete_callback = self.write_complete_callback.borrow().clone();
        let registry = self.connections.clone();

        // Build the connection on its own loop so every touch of it stays
        // loop-confined.
        io_loop.run_in_loop(move || {
            let inner = match LoopInner::current() {
                Some(inner) => inner,
                None => return,
            };
            let conn = TcpConnection::new(inner, conn_name.clone(), socket, local_addr, peer_addr);
            conn.set_connection_callback(connection_callback);
            conn.set_message_callback(message_callback);
            if let Some(callback) = write_complete_callback {
                conn.set_write_complete_callback(callback);
            }
            let close_registry = registry.clone();
            let close_name = conn_name.clone();
            conn.set_close_callback(Box::new(move |conn: &TcpConnectionPtr| {
                info!("TcpServer - connection [{}] closed", close_name);
                close_registry.lock().unwrap().remove(&close_name);
                conn.queue_destroy();
            }));
            registry.lock().unwrap().insert(conn_name, conn.handle());
            conn.connect_established();
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let handles: Vec<ConnectionHandle> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.destroy();
        }
    }
}

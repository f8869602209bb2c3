//! Reactor-style non-blocking TCP networking for Linux.
//!
//! `evio` runs one single-threaded event loop per thread and scales by
//! running many of them. Each [`EventLoop`] owns a readiness multiplexer
//! (epoll by default, `poll(2)` when `EVIO_USE_POLL` is set), a timer queue
//! backed by a timerfd, and an eventfd wakeup through which other threads
//! inject work.
//!
//! On top of the loops sit the TCP pieces: [`TcpServer`] accepts on one loop
//! and pins each connection to an I/O loop picked round-robin from an
//! [`EventLoopThreadPool`]; [`TcpClient`] maintains a single connection with
//! retry backoff; [`TcpConnection`] is the per-connection state machine with
//! buffered output, half-close support and a high-water mark on the output
//! buffer. Everything that touches a file descriptor runs on the fd's
//! owning loop; cross-thread callers go through [`LoopHandle`] or
//! [`ConnectionHandle`], which marshal closures onto the right thread.
//!
//! The crate also carries the supporting pieces such a deployment needs: a
//! worker [`ThreadPool`](thread_pool::ThreadPool) over a bounded blocking or
//! lock-free task queue, and an asynchronous, double-buffered logging
//! backend ([`logging::AsyncLogging`]) that decouples log-producing threads
//! from file I/O.
//!
//! # Example
//!
//! An echo server:
//!
//! ```no_run
//! use evio::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let addr = "127.0.0.1:2007".parse().unwrap();
//!     let server = TcpServer::new(&event_loop, &addr, "echo")?;
//!     server.set_message_callback(|conn, buffer, _when| {
//!         let data = buffer.take_all();
//!         conn.send(&data);
//!     });
//!     server.start()?;
//!     event_loop.run();
//!     Ok(())
//! }
//! ```

#![cfg(target_os = "linux")]

// Macros to ease system calls; must come before the modules using them.
#[macro_use]
mod macros;

mod buffer;
mod channel;
mod event_loop;
mod event_loop_pool;
mod event_loop_thread;
mod poller;
mod timer;
mod waker;

pub mod logging;
pub mod net;
pub mod thread_pool;

pub use buffer::Buffer;
pub use event_loop::{EventLoop, LoopHandle};
pub use event_loop_pool::EventLoopThreadPool;
pub use event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use net::{
    ConnectionCallback, ConnectionHandle, HighWaterMarkCallback, MessageCallback, TcpClient,
    TcpConnection, TcpConnectionPtr, TcpServer, WriteCompleteCallback,
};
pub use thread_pool::ThreadPool;
pub use timer::TimerId;

use std::sync::Arc;
use std::time::Instant;

use log::info;

use crate::buffer::Buffer;

pub(crate) mod acceptor;
mod client;
mod connection;
mod connector;
mod server;
pub(crate) mod socket;

pub use self::client::TcpClient;
pub use self::connection::{ConnectionHandle, TcpConnection, TcpConnectionPtr};
pub use self::server::TcpServer;

/// Connection up/down notification.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Bytes arrived; the callback may consume the buffer partially.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
/// The output buffer drained completely.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Buffered output crossed the configured threshold (passed along).
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

pub(crate) fn default_connection_callback() -> ConnectionCallback {
    Arc::new(|conn: &TcpConnectionPtr| {
        info!(
            "{} -> {} is {}",
            conn.local_addr(),
            conn.peer_addr(),
            if conn.connected() { "UP" } else { "DOWN" },
        );
    })
}

pub(crate) fn default_message_callback() -> MessageCallback {
    Arc::new(|_conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant| {
        buffer.consume_all();
    })
}

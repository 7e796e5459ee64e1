//! User-facing callback type aliases.
//!
//! Per-event callbacks on a [`crate::channel::Channel`] are move-only,
//! single-consumer sinks (`Box<dyn FnMut>`). These, by contrast, are
//! copyable (`Arc<dyn Fn>`) so a server can fan the same callback out to
//! every connection it owns.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::tcp_connection::TcpConnection;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback =
    Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

pub(crate) fn default_connection_callback() -> ConnectionCallback {
    Arc::new(|_conn| {})
}

pub(crate) fn default_message_callback() -> MessageCallback {
    Arc::new(|_conn, buf, _ts| {
        // No user-installed consumer: drop whatever arrived so the buffer
        // doesn't grow unbounded.
        buf.retrieve_all();
    })
}

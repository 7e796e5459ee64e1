//! A non-blocking, reactor-based TCP networking core: one event loop per
//! thread, a fixed I/O thread pool, and per-connection state machines with
//! decoupled read/write buffering.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor_core::{EventLoop, InetAddress, TcpServer};
//!
//! let event_loop = EventLoop::new();
//! let addr = InetAddress::new(9981, false);
//! let server = TcpServer::new(event_loop.clone(), &addr, "echo", false).unwrap();
//! server.start(None);
//! event_loop.run();
//! ```

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod macros;
mod net;
mod poller;
mod tcp_connection;
mod tcp_server;

pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
pub use event_loop::EventLoop;
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use net::{InetAddress, Socket};
pub use tcp_connection::{TcpConnection, DEFAULT_HIGH_WATER_MARK};
pub use tcp_server::TcpServer;

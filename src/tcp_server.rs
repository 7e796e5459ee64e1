//! Binds an acceptor to a thread pool, owns the connection map, issues
//! new/remove.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::info;

use crate::acceptor::{Acceptor, SharedAcceptor};
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    MessageCallback, WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::net::{InetAddress, Socket};
use crate::tcp_connection::TcpConnection;

type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

pub struct TcpServer {
    event_loop: EventLoop,
    name: String,
    ip_port: String,
    acceptor: SharedAcceptor,
    thread_pool: Mutex<EventLoopThreadPool>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_connid: AtomicU64,
    started: AtomicBool,

    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
}

impl TcpServer {
    pub fn new(
        event_loop: EventLoop,
        listen_addr: &InetAddress,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop.clone(), listen_addr, reuse_port)?;

        let server = Arc::new_cyclic(|weak: &Weak<TcpServer>| {
            let weak = weak.clone();
            acceptor
                .lock()
                .unwrap()
                .set_new_connection_callback(Box::new(move |sock, peer| {
                    if let Some(server) = weak.upgrade() {
                        server.new_connection(sock, peer);
                    }
                }));

            TcpServer {
                thread_pool: Mutex::new(EventLoopThreadPool::new(event_loop.clone(), 0)),
                event_loop,
                ip_port: listen_addr.to_ip_port(),
                name,
                acceptor,
                connections: Mutex::new(HashMap::new()),
                next_connid: AtomicU64::new(1),
                started: AtomicBool::new(false),
                connection_callback: Mutex::new(default_connection_callback()),
                message_callback: Mutex::new(default_message_callback()),
                write_complete_callback: Mutex::new(None),
            }
        });

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The listening socket's bound address, resolved via `getsockname`,
    /// useful when constructed with port 0 and the caller needs the
    /// kernel-assigned port.
    pub fn local_addr(&self) -> io::Result<InetAddress> {
        self.acceptor.lock().unwrap().local_addr()
    }

    /// Must be called before `start()`.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.event_loop.assert_in_loop_thread();
        *self.thread_pool.lock().unwrap() = EventLoopThreadPool::new(self.event_loop.clone(), num_threads);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock().unwrap() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(cb);
    }

    /// Idempotent: starts the thread pool with the given init callback and
    /// queues the acceptor's `listen()` on the base loop.
    pub fn start(self: &Arc<Self>, thread_init: Option<ThreadInitCallback>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.thread_pool.lock().unwrap().start(thread_init);

        let acceptor = self.acceptor.clone();
        let ip_port = self.ip_port.clone();
        self.event_loop.run_in_loop(move || {
            info!("TcpServer listening on {ip_port}");
            acceptor.lock().unwrap().listen().expect("acceptor listen failed");
        });
    }

    fn new_connection(self: &Arc<Self>, conn_socket: Socket, peer_addr: InetAddress) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.thread_pool.lock().unwrap().next_loop();

        let conn_id = self.next_connid.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        let local_addr = match conn_socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("getsockname failed for new connection: {e}");
                return;
            }
        };

        info!("TcpServer accepted new connection [{conn_name}] from {peer_addr}");

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), conn_socket, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.message_callback.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let self_weak = Arc::downgrade(self);
        conn.set_close_callback(Box::new(move |c| {
            if let Some(server) = self_weak.upgrade() {
                server.remove_connection(c);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        io_loop.run_in_loop(move || TcpConnection::connect_established(&conn));
    }

    /// Hops to the base loop to mutate the connection map, then queues
    /// `connect_destroyed` on the connection's own I/O loop; queued, not
    /// run, to extend the connection's lifetime across the in-progress
    /// callback stack (e.g. the close callback that triggered this).
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let conn = conn.clone();
        let server = self.clone();
        self.event_loop.run_in_loop(move || {
            server.remove_connection_in_loop(conn);
        });
    }

    fn remove_connection_in_loop(&self, conn: Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();
        self.connections.lock().unwrap().remove(conn.name());
        let io_loop = conn.event_loop().clone();
        io_loop.queue_in_loop(move || TcpConnection::connect_destroyed(&conn));
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.event_loop.assert_in_loop_thread();
        for (_, conn) in self.connections.lock().unwrap().drain() {
            let io_loop = conn.event_loop().clone();
            io_loop.queue_in_loop(move || TcpConnection::connect_destroyed(&conn));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// `start()` is a no-op past the first call; the worker pool's own
    /// called-once assertion would panic if `start` ever reached it twice.
    #[test]
    fn start_is_idempotent_across_repeated_calls() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new();
            let addr = InetAddress::new(0, true);
            let server = TcpServer::new(event_loop.clone(), &addr, "idempotent-start-test", false).unwrap();
            server.set_thread_num(2);

            server.start(None);
            server.start(None);
            server.start(None);

            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });

        let event_loop = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(50));
        event_loop.quit();
        handle.join().unwrap();
    }
}

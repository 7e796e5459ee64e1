//! Per-connection state machine, read/write buffers, user callbacks.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{error, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::SharedChannel;
use crate::event_loop::EventLoop;
use crate::net::{InetAddress, Socket};

/// Output-buffer size, in bytes, at which [`HighWaterMarkCallback`] fires.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub(crate) type CloseCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// A single established TCP connection, driven entirely on its owning I/O
/// loop's thread. Held by `TcpServer`'s connection map and, briefly, by any
/// in-flight queued task that captured a strong reference; the last
/// holder's drop closes the socket.
pub struct TcpConnection {
    event_loop: EventLoop,
    name: String,
    state: Mutex<State>,
    socket: Socket,
    channel: SharedChannel,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    reading: AtomicBool,

    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: EventLoop,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();
        if let Err(e) = socket.set_keep_alive(true) {
            warn!("failed to set SO_KEEPALIVE on connection {name}: {e}");
        }
        let channel = event_loop.new_channel(fd);

        let conn = Arc::new_cyclic(|weak| {
            let weak_for_read = weak.clone();
            let weak_for_write = weak.clone();
            let weak_for_close = weak.clone();
            let weak_for_error = weak.clone();
            {
                let mut c = channel.lock().unwrap();
                c.set_read_callback(Box::new(move |ts| {
                    if let Some(conn) = weak_for_read.upgrade() {
                        TcpConnection::handle_read(&conn, ts);
                    }
                }));
                c.set_write_callback(Box::new(move || {
                    if let Some(conn) = weak_for_write.upgrade() {
                        TcpConnection::handle_write(&conn);
                    }
                }));
                c.set_close_callback(Box::new(move || {
                    if let Some(conn) = weak_for_close.upgrade() {
                        TcpConnection::handle_close(&conn);
                    }
                }));
                c.set_error_callback(Box::new(move || {
                    if let Some(conn) = weak_for_error.upgrade() {
                        TcpConnection::handle_error(&conn);
                    }
                }));
            }

            TcpConnection {
                event_loop,
                name,
                state: Mutex::new(State::Connecting),
                socket,
                channel,
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                reading: AtomicBool::new(false),
                connection_callback: Mutex::new(default_connection_callback()),
                message_callback: Mutex::new(default_message_callback()),
                write_complete_callback: Mutex::new(None),
                high_water_mark_callback: Mutex::new(None),
                close_callback: Mutex::new(None),
            }
        });

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
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

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.lock().unwrap() = Some(cb);
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(cb);
    }

    /// Toggles `TCP_NODELAY` (Nagle's algorithm) on the underlying socket.
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Connecting → Connected. Ties the channel to `self` so readiness
    /// dispatch stops once this connection is gone, enables reading, and
    /// invokes the user connection callback.
    pub(crate) fn connect_established(conn: &Arc<TcpConnection>) {
        assert_eq!(conn.state(), State::Connecting);
        *conn.state.lock().unwrap() = State::Connected;
        conn.channel
            .lock()
            .unwrap()
            .tie(Arc::downgrade(conn) as std::sync::Weak<dyn std::any::Any + Send + Sync>);
        conn.channel.lock().unwrap().enable_reading();
        conn.reading.store(true, Ordering::SeqCst);
        let cb = conn.connection_callback.lock().unwrap().clone();
        cb(conn);
    }

    /// Idempotent across the two teardown paths (close callback vs. server
    /// shutdown): only acts if still `Connected`.
    pub(crate) fn connect_destroyed(conn: &Arc<TcpConnection>) {
        let mut state = conn.state.lock().unwrap();
        if *state == State::Connected {
            *state = State::Disconnected;
            drop(state);
            conn.channel.lock().unwrap().disable_all();
            let cb = conn.connection_callback.lock().unwrap().clone();
            cb(conn);
        } else {
            drop(state);
        }
        conn.channel.lock().unwrap().remove();
    }

    fn handle_read(conn: &Arc<TcpConnection>, receive_time: Instant) {
        let result = conn.input_buffer.lock().unwrap().read_fd(conn.socket.as_raw_fd());
        match result {
            Ok(0) => TcpConnection::handle_close(conn),
            Ok(_) => {
                let cb = conn.message_callback.lock().unwrap().clone();
                cb(conn, &mut conn.input_buffer.lock().unwrap(), receive_time);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => TcpConnection::handle_error_with(conn, e),
        }
    }

    fn handle_write(conn: &Arc<TcpConnection>) {
        if !conn.channel.lock().unwrap().is_writing() {
            warn!("connection {} fd is down, no more writing", conn.name);
            return;
        }
        let (written, remaining) = {
            let mut output = conn.output_buffer.lock().unwrap();
            match output.write_fd(conn.socket.as_raw_fd()) {
                Ok(n) => {
                    output.retrieve(n);
                    (n, output.readable_bytes())
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => (0, output.readable_bytes()),
                Err(e) => {
                    warn!("TcpConnection::handle_write failed for {}: {e}", conn.name);
                    return;
                }
            }
        };
        let _ = written;

        if remaining == 0 {
            conn.channel.lock().unwrap().disable_writing();
            if let Some(cb) = conn.write_complete_callback.lock().unwrap().clone() {
                let conn_for_task = conn.clone();
                conn.event_loop.queue_in_loop(move || cb(&conn_for_task));
            }
            if conn.state() == State::Disconnecting {
                TcpConnection::shutdown_in_loop(conn);
            }
        }
    }

    fn handle_close(conn: &Arc<TcpConnection>) {
        let state = conn.state();
        assert!(state == State::Connected || state == State::Disconnecting);
        *conn.state.lock().unwrap() = State::Disconnected;
        conn.channel.lock().unwrap().disable_all();

        let cb = conn.connection_callback.lock().unwrap().clone();
        cb(conn);
        if let Some(close_cb) = conn.close_callback.lock().unwrap().as_ref() {
            close_cb(conn);
        }
    }

    fn handle_error(conn: &Arc<TcpConnection>) {
        let err = conn.socket.socket_error();
        match err {
            Ok(errno) => error!(
                "TcpConnection {} SO_ERROR = {errno} ({})",
                conn.name,
                io::Error::from_raw_os_error(errno)
            ),
            Err(e) => error!("TcpConnection {} failed to read SO_ERROR: {e}", conn.name),
        }
    }

    fn handle_error_with(conn: &Arc<TcpConnection>, e: io::Error) {
        error!("TcpConnection {} read error: {e}", conn.name);
        TcpConnection::handle_error(conn);
    }

    /// Sends `data`. Writes directly if called from the I/O loop; otherwise
    /// copies the bytes and hands off via `queue_in_loop`.
    pub fn send(conn: &Arc<TcpConnection>, data: &[u8]) {
        if conn.event_loop.is_in_loop_thread() {
            TcpConnection::send_in_loop(conn, data);
        } else {
            let owned = data.to_vec();
            let conn_for_task = conn.clone();
            conn.event_loop
                .queue_in_loop(move || TcpConnection::send_in_loop(&conn_for_task, &owned));
        }
    }

    fn send_in_loop(conn: &Arc<TcpConnection>, data: &[u8]) {
        if conn.state() == State::Disconnected {
            warn!("connection {} is disconnected, give up writing", conn.name);
            return;
        }

        let mut remaining = data;
        let mut fault = false;

        let already_writing = conn.channel.lock().unwrap().is_writing();
        let output_empty = conn.output_buffer.lock().unwrap().readable_bytes() == 0;
        if !already_writing && output_empty {
            match conn.socket_write(data) {
                Ok(n) => {
                    remaining = &data[n..];
                    if remaining.is_empty() {
                        if let Some(cb) = conn.write_complete_callback.lock().unwrap().clone() {
                            let conn_for_task = conn.clone();
                            conn.event_loop.queue_in_loop(move || cb(&conn_for_task));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    let os_err = e.raw_os_error();
                    if os_err == Some(libc::EPIPE) || os_err == Some(libc::ECONNRESET) {
                        warn!("connection {} write failed: {e}", conn.name);
                        fault = true;
                    } else {
                        error!("connection {} write failed: {e}", conn.name);
                    }
                }
            }
        }

        if fault || remaining.is_empty() {
            return;
        }

        let mut output = conn.output_buffer.lock().unwrap();
        let before = output.readable_bytes();
        let high_water_mark = conn.high_water_mark.load(Ordering::SeqCst);
        output.append(remaining);
        let after = output.readable_bytes();
        if before < high_water_mark && after >= high_water_mark {
            if let Some(cb) = conn.high_water_mark_callback.lock().unwrap().clone() {
                let conn_for_task = conn.clone();
                conn.event_loop
                    .queue_in_loop(move || cb(&conn_for_task, after));
            }
        }
        drop(output);

        if !conn.channel.lock().unwrap().is_writing() {
            conn.channel.lock().unwrap().enable_writing();
        }
    }

    fn socket_write(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.write(data)
    }

    /// Half-closes the write side. Deferred to the drain path in
    /// `handle_write` if writes are still pending.
    pub fn shutdown(conn: &Arc<TcpConnection>) {
        if conn.state() == State::Connected {
            *conn.state.lock().unwrap() = State::Disconnecting;
            let conn_for_task = conn.clone();
            conn.event_loop
                .run_in_loop(move || TcpConnection::shutdown_in_loop(&conn_for_task));
        }
    }

    fn shutdown_in_loop(conn: &Arc<TcpConnection>) {
        if !conn.channel.lock().unwrap().is_writing() {
            let _ = conn.socket.shutdown_write();
        }
    }
}

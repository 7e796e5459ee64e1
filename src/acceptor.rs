//! Listening socket: emits `(connfd, peer_addr)` on readiness.

use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::channel::SharedChannel;
use crate::event_loop::EventLoop;
use crate::net::{InetAddress, Socket};

type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress) + Send>;
pub(crate) type SharedAcceptor = Arc<Mutex<Acceptor>>;

pub(crate) struct Acceptor {
    event_loop: EventLoop,
    listen_socket: Socket,
    channel: SharedChannel,
    new_connection_callback: Option<NewConnectionCallback>,
    /// Reserved fd evicted on `EMFILE`/`ENFILE` so the acceptor can still
    /// `accept4` the offending connection and immediately drop it,
    /// preventing the listening socket from spinning at 100% CPU.
    idle_fd: Option<File>,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: EventLoop,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> io::Result<SharedAcceptor> {
        let listen_socket = Socket::new_tcp()?;
        listen_socket.set_reuse_addr(true)?;
        if reuse_port {
            listen_socket.set_reuse_port(true)?;
        }
        listen_socket.bind(listen_addr)?;

        let channel = event_loop.new_channel(listen_socket.as_raw_fd());
        let idle_fd = File::open("/dev/null").ok();

        let acceptor = Arc::new(Mutex::new(Acceptor {
            event_loop,
            listen_socket,
            channel,
            new_connection_callback: None,
            idle_fd,
        }));

        {
            let handler = Arc::downgrade(&acceptor);
            let a = acceptor.lock().unwrap();
            a.channel
                .clone()
                .lock()
                .unwrap()
                .set_read_callback(Box::new(move |_ts| {
                    if let Some(strong) = handler.upgrade() {
                        strong.lock().unwrap().handle_read();
                    }
                }));
        }

        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&mut self, cb: NewConnectionCallback) {
        self.new_connection_callback = Some(cb);
    }

    /// The bound address, resolved via `getsockname`, useful when the
    /// caller bound to port 0 and needs the kernel-assigned port.
    pub(crate) fn local_addr(&self) -> io::Result<InetAddress> {
        self.listen_socket.local_addr()
    }

    pub(crate) fn listen(&mut self) -> io::Result<()> {
        self.listen_socket.listen(1024)?;
        self.channel.lock().unwrap().enable_reading();
        Ok(())
    }

    fn handle_read(&mut self) {
        self.event_loop.assert_in_loop_thread();
        match self.listen_socket.accept() {
            Ok((conn_socket, peer_addr)) => {
                if let Some(cb) = self.new_connection_callback.as_mut() {
                    cb(conn_socket, peer_addr);
                }
                // else: conn_socket drops here, closing the fd.
            }
            Err(e) => {
                let raw_os_error = e.raw_os_error();
                if raw_os_error == Some(libc::EMFILE) || raw_os_error == Some(libc::ENFILE) {
                    warn!("accept4 failed with {e}, evicting a reserved fd to keep accepting");
                    self.idle_fd.take();
                    let _ = self.listen_socket.accept();
                    self.idle_fd = File::open("/dev/null").ok();
                } else if e.kind() != io::ErrorKind::WouldBlock {
                    error!("accept4 failed: {e}");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let mut c = self.channel.lock().unwrap();
        c.disable_all();
        c.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// With no new-connection callback registered, an accepted socket has
    /// nowhere to go but dropped immediately, closing its fd and presenting
    /// the peer with a clean EOF rather than a hung connection.
    #[test]
    fn accept_with_no_callback_closes_the_connection() {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new();
            let addr = InetAddress::new(0, true);
            let acceptor = Acceptor::new(event_loop.clone(), &addr, false).unwrap();
            let bound = acceptor.lock().unwrap().local_addr().unwrap();
            acceptor.lock().unwrap().listen().unwrap();
            tx.send((event_loop.clone(), bound)).unwrap();
            event_loop.run();
        });

        let (event_loop, bound) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let mut client = connect_with_retry(bound.to_ip_port());

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).expect("client read failed");
        assert_eq!(n, 0, "peer should see EOF when no callback claims the connection");

        event_loop.quit();
        handle.join().unwrap();
    }

    fn connect_with_retry(addr: String) -> TcpStream {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(&addr) {
                return stream;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("failed to connect to {addr}");
    }
}


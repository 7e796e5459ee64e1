//! Scenario 2: sending from a thread that is neither the base loop's thread
//! nor the connection's own I/O loop thread must still deliver exactly once,
//! via `TcpConnection::send`'s `queue_in_loop` hand-off.

use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor_core::{EventLoop, InetAddress, TcpConnection, TcpServer};

#[test]
fn send_from_a_non_io_thread_is_delivered_once() {
    env_logger::try_init().ok();

    let connected: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let connected_for_cb = connected.clone();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr = InetAddress::new(0, true);
        let server = TcpServer::new(event_loop.clone(), &addr, "cross-thread-test", false).unwrap();
        server.set_thread_num(2);
        server.set_connection_callback(Arc::new(move |conn| {
            *connected_for_cb.lock().unwrap() = Some(conn.clone());
        }));

        server.start(None);
        let bound = server.local_addr().unwrap();
        tx.send((event_loop.clone(), bound)).unwrap();
        event_loop.run();
    });

    let (event_loop, bound) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = connect_with_retry(bound.to_ip_port());

    let conn = wait_for_connection(&connected);

    // Send from this test thread: neither the base loop's thread nor any
    // worker I/O thread.
    let conn_for_send = conn.clone();
    thread::spawn(move || {
        TcpConnection::send(&conn_for_send, b"hello");
    })
    .join()
    .unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    // No further bytes should arrive.
    client.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut extra = [0u8; 1];
    match client.read(&mut extra) {
        Ok(0) => {}
        Ok(_) => panic!("received unexpected extra bytes"),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => panic!("unexpected read error: {e}"),
    }

    drop(client);
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

fn wait_for_connection(slot: &Arc<Mutex<Option<Arc<TcpConnection>>>>) -> Arc<TcpConnection> {
    for _ in 0..100 {
        if let Some(conn) = slot.lock().unwrap().clone() {
            return conn;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("connection callback never fired");
}

//! Scenario 4: `shutdown()` while a large backlog is still buffered must
//! deliver every byte before the half-close (FIN) takes effect.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_core::{EventLoop, InetAddress, TcpConnection, TcpServer};

const PAYLOAD_MIN: usize = 512 * 1024;
const PAYLOAD_MAX: usize = 2 * 1024 * 1024;

#[test]
fn shutdown_drains_buffered_writes_before_half_close() {
    env_logger::try_init().ok();

    let payload_size = rand::random_range(PAYLOAD_MIN..=PAYLOAD_MAX);
    let connection_events = Arc::new(AtomicUsize::new(0));
    let events_for_cb = connection_events.clone();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr = InetAddress::new(0, true);
        let server = TcpServer::new(event_loop.clone(), &addr, "half-close-test", false).unwrap();

        server.set_connection_callback(Arc::new(move |conn| {
            events_for_cb.fetch_add(1, Ordering::SeqCst);
            TcpConnection::send(conn, &vec![9u8; payload_size]);
            TcpConnection::shutdown(conn);
            // A second call while already Disconnecting must be a no-op.
            TcpConnection::shutdown(conn);
        }));

        server.start(None);
        let bound = server.local_addr().unwrap();
        tx.send((event_loop.clone(), bound)).unwrap();
        event_loop.run();
    });

    let (event_loop, bound) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = connect_with_retry(bound.to_ip_port());

    let mut total = 0usize;
    let mut buf = [0u8; 65536];
    loop {
        let n = client.read(&mut buf).expect("client read failed");
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, payload_size, "peer must receive the full backlog before FIN");

    // Close our end so the server's read side sees EOF and completes its
    // own teardown (the server only half-closed its write side above).
    drop(client);

    wait_for(
        || connection_events.load(Ordering::SeqCst) == 2,
        "expected exactly a Connected then a Disconnected connection-callback invocation",
    );

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

fn wait_for(mut pred: impl FnMut() -> bool, msg: &str) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("{msg}");
}

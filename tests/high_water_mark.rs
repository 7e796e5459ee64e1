//! Scenario 3: a low high-water-mark threshold crossed upward by a single
//! large write, followed by write-complete once the peer drains it.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor_core::{EventLoop, InetAddress, TcpConnection, TcpServer};

const THRESHOLD: usize = 1024;
// Randomized within a range comfortably larger than any realistic kernel
// socket buffer on loopback, so the write reliably buffers past THRESHOLD
// regardless of the exact size picked.
const PAYLOAD_MIN: usize = 6 * 1024 * 1024;
const PAYLOAD_MAX: usize = 10 * 1024 * 1024;

#[test]
fn high_water_mark_fires_once_then_write_complete_after_drain() {
    env_logger::try_init().ok();

    let payload_size = rand::random_range(PAYLOAD_MIN..=PAYLOAD_MAX);
    let high_water_hits = Arc::new(AtomicUsize::new(0));
    let high_water_sizes: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let write_complete_hits = Arc::new(AtomicUsize::new(0));

    let hw_hits_for_conn_cb = high_water_hits.clone();
    let hw_sizes_for_conn_cb = high_water_sizes.clone();
    let wc_hits_for_conn_cb = write_complete_hits.clone();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr = InetAddress::new(0, true);
        let server = TcpServer::new(event_loop.clone(), &addr, "high-water-test", false).unwrap();

        server.set_connection_callback(Arc::new(move |conn| {
            let hw_hits = hw_hits_for_conn_cb.clone();
            let hw_sizes = hw_sizes_for_conn_cb.clone();
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn, size| {
                    hw_hits.fetch_add(1, Ordering::SeqCst);
                    hw_sizes.lock().unwrap().push(size);
                }),
                THRESHOLD,
            );

            let wc_hits = wc_hits_for_conn_cb.clone();
            conn.set_write_complete_callback(Arc::new(move |_conn| {
                wc_hits.fetch_add(1, Ordering::SeqCst);
            }));

            // Push a payload far larger than any kernel send buffer in one
            // call so most of it lands in the output buffer rather than
            // going out directly, crossing the threshold.
            TcpConnection::send(conn, &vec![7u8; payload_size]);
        }));

        server.start(None);
        let bound = server.local_addr().unwrap();
        tx.send((event_loop.clone(), bound)).unwrap();
        event_loop.run();
    });

    let (event_loop, bound) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = connect_with_retry(bound.to_ip_port());

    // Give the server a moment to push the write before we start draining,
    // so the buffered backlog actually builds up.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        high_water_hits.load(Ordering::SeqCst),
        1,
        "high-water-mark callback should fire exactly once"
    );
    assert!(high_water_sizes.lock().unwrap()[0] >= THRESHOLD);

    let mut total = 0usize;
    let mut buf = [0u8; 65536];
    while total < payload_size {
        let n = client.read(&mut buf).expect("client read failed");
        assert!(n > 0, "connection closed early after {total} bytes");
        total += n;
    }
    assert_eq!(total, payload_size);

    wait_for(|| write_complete_hits.load(Ordering::SeqCst) == 1, "write-complete callback never fired");
    assert_eq!(high_water_hits.load(Ordering::SeqCst), 1, "no repeat high-water-mark firing");

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

fn wait_for(mut pred: impl FnMut() -> bool, msg: &str) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("{msg}");
}

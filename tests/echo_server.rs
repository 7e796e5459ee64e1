//! Scenario 1 from the design's testable-properties section: a plain echo
//! server, verified end to end with a real client socket.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_core::{EventLoop, InetAddress, TcpConnection, TcpServer};

#[test]
fn echoes_input_and_observes_client_disconnect() {
    env_logger::try_init().ok();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr = InetAddress::new(0, true);
        let server = TcpServer::new(event_loop.clone(), &addr, "echo-test", false).unwrap();

        server.set_message_callback(Arc::new(|conn, buf, _ts| {
            let data = buf.retrieve_all();
            TcpConnection::send(conn, &data);
        }));

        server.start(None);
        let bound = server.local_addr().unwrap();
        tx.send((event_loop.clone(), bound)).unwrap();
        event_loop.run();
    });

    let (event_loop, bound) = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut client = connect_with_retry(bound.to_ip_port());
    client.write_all(b"ping").unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    drop(client);
    thread::sleep(Duration::from_millis(100));

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

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loopnet::{EventLoop, TcpServer};

/// A connection whose peer never reads queues writes in its output buffer;
/// once that queue crosses the configured threshold the high-water-mark
/// callback must fire exactly once.
#[test]
fn fires_when_output_buffer_crosses_threshold() {
    common::init_logging();
    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", common::random_port()).parse().unwrap();
    let base_loop = EventLoop::new().expect("base loop");
    let server = TcpServer::new(base_loop.clone(), "test-hwm", addr, 1).expect("server");
    server.set_high_water_mark(1024);

    let crossed = Arc::new(AtomicBool::new(false));
    {
        let crossed = crossed.clone();
        server.set_high_water_mark_callback(move |_conn, _len| {
            crossed.store(true, Ordering::SeqCst);
        });
    }

    server.set_connection_callback(move |conn| {
        if conn.connected() {
            // Flood far past the 1024-byte threshold; the peer below
            // never reads, so most of this sits in the output buffer.
            let payload = vec![b'x'; 64 * 1024];
            conn.send(&payload);
        }
    });

    server.start().expect("start");
    std::thread::spawn(move || {
        let _ = base_loop.run();
    });
    std::thread::sleep(Duration::from_millis(100));

    let stream = TcpStream::connect(addr).expect("connect");
    // Deliberately never read from `stream`; keep it alive so the socket
    // stays open and the kernel send buffer plus our own output buffer
    // both fill up.
    std::thread::sleep(Duration::from_millis(300));
    drop(stream);

    assert!(crossed.load(Ordering::SeqCst), "high water mark callback never fired");
}

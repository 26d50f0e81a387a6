mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use loopnet::buffer::Buffer;
use loopnet::{EventLoop, TcpServer};

fn spawn_echo_server() -> std::net::SocketAddr {
    common::init_logging();
    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", common::random_port()).parse().unwrap();
    let base_loop = EventLoop::new().expect("base loop");
    let server = TcpServer::new(base_loop.clone(), "test-echo", addr, 1).expect("server");

    server.set_message_callback(|conn, buf: &mut Buffer, _time| {
        let data = buf.retrieve_as_vec(buf.readable_bytes());
        conn.send(&data);
    });

    server.start().expect("start");
    std::thread::spawn(move || {
        let _ = base_loop.run();
    });
    std::thread::sleep(Duration::from_millis(100));
    addr
}

#[test]
fn echoes_back_what_it_receives() {
    let addr = spawn_echo_server();
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.write_all(b"hello world").expect("write");

    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"hello world");
}

#[test]
fn handles_several_small_writes_in_sequence() {
    let addr = spawn_echo_server();
    let mut stream = TcpStream::connect(addr).expect("connect");

    for chunk in [b"abc" as &[u8], b"defgh", b"ij"] {
        stream.write_all(chunk).expect("write");
        let mut buf = vec![0u8; chunk.len()];
        stream.read_exact(&mut buf).expect("read");
        assert_eq!(buf, chunk);
    }
}

#[test]
fn multiple_clients_each_get_their_own_echo() {
    let addr = spawn_echo_server();

    let mut a = TcpStream::connect(addr).expect("connect a");
    let mut b = TcpStream::connect(addr).expect("connect b");

    a.write_all(b"from-a").unwrap();
    b.write_all(b"from-b").unwrap();

    let mut buf_a = [0u8; 6];
    let mut buf_b = [0u8; 6];
    a.read_exact(&mut buf_a).unwrap();
    b.read_exact(&mut buf_b).unwrap();

    assert_eq!(&buf_a, b"from-a");
    assert_eq!(&buf_b, b"from-b");
}

//! Echo server demo: writes back every byte it reads, built entirely on
//! the public `TcpServer` API.

use clap::Parser;

use loopnet::asynclog::{self, AsyncLog};
use loopnet::buffer::Buffer;
use loopnet::config::CliArgs;
use loopnet::{EventLoop, Timestamp};

fn main() {
    let args = CliArgs::parse();
    let config = args.resolve().unwrap_or_else(|e| {
        eprintln!("config error: {e}");
        std::process::exit(1);
    });

    let log = AsyncLog::new(
        format!("{}-echo", config.log_basename),
        config.log_roll_size,
        config.log_flush_interval(),
    );
    asynclog::init(log, config.log_level());

    let addr = config.listen_addr().unwrap_or_else(|e| {
        log::error!("{e}");
        std::process::exit(1);
    });

    let base_loop = EventLoop::new().expect("failed to create base event loop");
    let server = loopnet::TcpServer::new(base_loop.clone(), "echo", addr, config.worker_threads)
        .expect("failed to create server");
    server.set_high_water_mark(config.high_water_mark);

    server.set_connection_callback(|conn| {
        if conn.connected() {
            log::info!("{} connected from {}", conn.name(), conn.peer_addr());
        } else {
            log::info!("{} disconnected", conn.name());
        }
    });

    server.set_message_callback(|conn, buf: &mut Buffer, _time: Timestamp| {
        let data = buf.retrieve_as_vec(buf.readable_bytes());
        conn.send(&data);
    });

    server.start().expect("failed to start listening");
    log::info!("echo server listening on {addr}");
    base_loop.run().expect("event loop exited with error");
}

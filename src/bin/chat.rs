//! Chat server demo: broadcasts each newline-terminated line to every other
//! connected client.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;

use loopnet::asynclog::{self, AsyncLog};
use loopnet::buffer::Buffer;
use loopnet::config::CliArgs;
use loopnet::{EventLoop, TcpConnection, Timestamp};

fn main() {
    let args = CliArgs::parse();
    let config = args.resolve().unwrap_or_else(|e| {
        eprintln!("config error: {e}");
        std::process::exit(1);
    });

    let log = AsyncLog::new(
        format!("{}-chat", config.log_basename),
        config.log_roll_size,
        config.log_flush_interval(),
    );
    asynclog::init(log, config.log_level());

    let addr = config.listen_addr().unwrap_or_else(|e| {
        log::error!("{e}");
        std::process::exit(1);
    });

    let base_loop = EventLoop::new().expect("failed to create base event loop");
    let server = loopnet::TcpServer::new(base_loop.clone(), "chat", addr, config.worker_threads)
        .expect("failed to create server");
    server.set_high_water_mark(config.high_water_mark);

    let peers: Arc<Mutex<HashMap<String, Arc<TcpConnection>>>> = Arc::new(Mutex::new(HashMap::new()));

    {
        let peers = peers.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                log::info!("{} joined", conn.name());
                peers.lock().insert(conn.name().to_string(), conn.clone());
            } else {
                log::info!("{} left", conn.name());
                peers.lock().remove(conn.name());
            }
        });
    }

    {
        let peers = peers.clone();
        server.set_message_callback(move |conn, buf: &mut Buffer, _time: Timestamp| {
            let line = buf.retrieve_all_as_string();
            let message = format!("{}: {}", conn.name(), line.trim_end());
            for (name, peer) in peers.lock().iter() {
                if name != conn.name() {
                    peer.send(message.as_bytes());
                    peer.send(b"\n");
                }
            }
        });
    }

    server.start().expect("failed to start listening");
    log::info!("chat server listening on {addr}");
    base_loop.run().expect("event loop exited with error");
}

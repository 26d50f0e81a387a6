//! `TcpServer`: composes an `Acceptor`, a worker-loop pool, and the
//! connection map, and wires the lifecycle hand-off between them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::event_loop_pool::EventLoopPool;
use crate::timestamp::Timestamp;

type ConnectionCb = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
type MessageCb = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
type WriteCompleteCb = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
type HighWaterMarkCb = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Composes the acceptor, the worker pool, and the live connection set.
/// The base loop owns the `Acceptor` and the connection map; every other
/// operation on a connection runs on that connection's worker loop.
pub struct TcpServer {
    base_loop: Arc<EventLoop>,
    acceptor: Mutex<Acceptor>,
    pool: EventLoopPool,
    name: String,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCb>>,
    message_cb: Mutex<Option<MessageCb>>,
    write_complete_cb: Mutex<Option<WriteCompleteCb>>,
    high_water_mark_cb: Mutex<Option<HighWaterMarkCb>>,
}

impl TcpServer {
    pub fn new(
        base_loop: Arc<EventLoop>,
        name: impl Into<String>,
        addr: SocketAddr,
        num_worker_threads: usize,
    ) -> Result<Arc<Self>> {
        let acceptor = Acceptor::new(base_loop.clone(), addr, true)?;
        let name = name.into();
        let pool = EventLoopPool::start(num_worker_threads, &format!("{name}-worker"))?;

        let this = Arc::new(TcpServer {
            base_loop,
            acceptor: Mutex::new(acceptor),
            pool,
            name,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            high_water_mark: AtomicUsize::new(crate::connection::DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_mark_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&this);
        this.acceptor
            .lock()
            .set_new_connection_callback(move |fd, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer_addr);
                }
            });

        Ok(this)
    }

    /// Sets the per-connection high-water-mark threshold applied to every
    /// connection accepted from this point on. Defaults to
    /// [`crate::connection::DEFAULT_HIGH_WATER_MARK`].
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Relaxed);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        *self.connection_cb.lock() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.message_cb.lock() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        *self.write_complete_cb.lock() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        *self.high_water_mark_cb.lock() = Some(Arc::new(cb));
    }

    /// Starts accepting. Idempotent; the worker pool is already running
    /// from `new`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let this = self.clone();
        self.base_loop.run_in_loop(move || {
            if let Err(e) = this.acceptor.lock().listen() {
                log::error!("acceptor failed to start listening: {e}");
            }
        });
        Ok(())
    }

    /// Invoked on the base loop by the acceptor for each newly accepted fd.
    fn new_connection(self: &Arc<Self>, fd: RawFd, peer_addr: SocketAddr) {
        let worker = if self.pool.is_empty() {
            self.base_loop.clone()
        } else {
            self.pool.next_loop()
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer_addr, id);
        let local_addr = local_addr_of(fd).unwrap_or(peer_addr);

        let conn = TcpConnection::with_high_water_mark(
            worker.clone(),
            conn_name.clone(),
            fd,
            local_addr,
            peer_addr,
            self.high_water_mark.load(Ordering::Relaxed),
        );
        self.install_callbacks(&conn);
        self.connections.lock().insert(conn_name, conn.clone());

        let this = self.clone();
        conn.set_close_callback(move |c| {
            let this = this.clone();
            let c = c.clone();
            this.base_loop.queue_in_loop(move || this.remove_connection(c));
        });

        worker.run_in_loop(move || conn.connect_established());
    }

    fn install_callbacks(&self, conn: &Arc<TcpConnection>) {
        if let Some(cb) = self.connection_cb.lock().clone() {
            conn.set_connection_callback(move |c| cb(c));
        }
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(move |c| cb(c));
        }
        if let Some(cb) = self.high_water_mark_cb.lock().clone() {
            conn.set_high_water_mark_callback(move |c, n| cb(c, n));
        }
        if let Some(cb) = self.message_cb.lock().clone() {
            conn.set_message_callback(move |c, b, t| cb(c, b, t));
        }
    }

    /// Erases the map entry (runs on the base loop), then hands the
    /// connection back to its own worker loop to finish teardown.
    fn remove_connection(self: &Arc<Self>, conn: Arc<TcpConnection>) {
        self.connections.lock().remove(conn.name());
        let owner = conn.owning_loop();
        owner.run_in_loop(move || conn.connect_destroyed());
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn quit(&self) {
        self.pool.quit_all();
        self.base_loop.quit();
    }
}

fn local_addr_of(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return None;
    }
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            Some(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

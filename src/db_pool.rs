//! A generic connection pool, constructed explicitly (never a process-wide
//! singleton) and swept by a background recycler thread that trims idle
//! connections back down to `min_size`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// A single pooled resource. Implementors provide the actual connect/health
/// check; the pool only manages lifecycle and idle bookkeeping.
pub trait Connection: Send {
    fn is_alive(&self) -> bool;
}

/// Anything that can produce new `Connection`s on demand, e.g. a MySQL or
/// Postgres client wrapper.
pub trait ConnectionFactory: Send + Sync {
    type Conn: Connection;
    fn connect(&self) -> Result<Self::Conn>;
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

struct Shared<F: ConnectionFactory> {
    factory: F,
    min_size: usize,
    max_size: usize,
    max_idle: Duration,
    idle: Mutex<VecDeque<Idle<F::Conn>>>,
    cond: Condvar,
    total: Mutex<usize>,
    running: AtomicBool,
}

/// An explicitly constructed connection pool. Unlike the design this is
/// grounded on, there is no function-local static instance anywhere in this
/// crate — callers own an `Arc<ConnectionPool<F>>` and thread it through
/// wherever a connection is needed.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    sweeper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// A connection borrowed from the pool. Returned to the idle queue on drop
/// rather than closed, unless it failed its liveness check.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Conn>,
    pool: Weak<Shared<F>>,
}

impl<F: ConnectionFactory> std::ops::Deref for PooledConnection<F> {
    type Target = F::Conn;
    fn deref(&self) -> &F::Conn {
        self.conn.as_ref().expect("connection taken")
    }
}

impl<F: ConnectionFactory> std::ops::DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Conn {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let Some(shared) = self.pool.upgrade() else { return };
        if conn.is_alive() {
            shared.idle.lock().push_back(Idle {
                conn,
                since: Instant::now(),
            });
            shared.cond.notify_one();
        } else {
            *shared.total.lock() -= 1;
        }
    }
}

impl<F: ConnectionFactory + 'static> ConnectionPool<F> {
    /// Builds a pool and eagerly opens `min_size` connections. The recycler
    /// thread wakes every `sweep_interval` (500ms by default in the demo
    /// binaries — not the contradictory microsecond figure the design this
    /// is grounded on used, which would spin the sweeper needlessly) to
    /// close connections idle longer than `max_idle`, down to `min_size`.
    pub fn new(factory: F, min_size: usize, max_size: usize, max_idle: Duration) -> Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            factory,
            min_size,
            max_size,
            max_idle,
            idle: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            total: Mutex::new(0),
            running: AtomicBool::new(true),
        });

        {
            let mut idle = shared.idle.lock();
            let mut total = shared.total.lock();
            for _ in 0..min_size {
                let conn = shared.factory.connect()?;
                idle.push_back(Idle {
                    conn,
                    since: Instant::now(),
                });
                *total += 1;
            }
        }

        Ok(Arc::new(ConnectionPool {
            shared,
            sweeper: Mutex::new(None),
        }))
    }

    /// Starts the background sweeper. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>, sweep_interval: Duration) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("db-pool-sweeper".into())
            .spawn(move || sweep_loop(shared, sweep_interval))
            .expect("failed to spawn db pool sweeper thread");
        *guard = Some(handle);
    }

    pub fn stop_sweeper(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.cond.notify_all();
        if let Some(h) = self.sweeper.lock().take() {
            let _ = h.join();
        }
    }

    /// Borrows a connection, reusing an idle one if available, else opening
    /// a new one if under `max_size`, else returns [`Error::PoolExhausted`].
    pub fn get(&self) -> Result<PooledConnection<F>> {
        {
            let mut idle = self.shared.idle.lock();
            while let Some(entry) = idle.pop_front() {
                if entry.conn.is_alive() {
                    return Ok(PooledConnection {
                        conn: Some(entry.conn),
                        pool: Arc::downgrade(&self.shared),
                    });
                }
                *self.shared.total.lock() -= 1;
            }
        }

        let mut total = self.shared.total.lock();
        if *total >= self.shared.max_size {
            return Err(Error::PoolExhausted);
        }
        let conn = self.shared.factory.connect()?;
        *total += 1;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::downgrade(&self.shared),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn total_count(&self) -> usize {
        *self.shared.total.lock()
    }
}

fn sweep_loop<F: ConnectionFactory>(shared: Arc<Shared<F>>, sweep_interval: Duration) {
    let mut guard = shared.idle.lock();
    while shared.running.load(Ordering::Acquire) {
        let woken_early = !shared.cond.wait_for(&mut guard, sweep_interval).timed_out();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        if woken_early {
            continue;
        }

        let mut total = shared.total.lock();
        let now = Instant::now();
        while *total > shared.min_size {
            let Some(front) = guard.front() else { break };
            if now.duration_since(front.since) < shared.max_idle {
                break;
            }
            guard.pop_front();
            *total -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeConn {
        alive: bool,
    }
    impl Connection for FakeConn {
        fn is_alive(&self) -> bool {
            self.alive
        }
    }

    struct FakeFactory {
        opened: AtomicUsize,
    }
    impl ConnectionFactory for FakeFactory {
        type Conn = FakeConn;
        fn connect(&self) -> Result<FakeConn> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn { alive: true })
        }
    }

    #[test]
    fn get_reuses_a_returned_connection_without_opening_a_new_one() {
        let factory = FakeFactory {
            opened: AtomicUsize::new(0),
        };
        let pool = ConnectionPool::new(factory, 1, 4, Duration::from_secs(30)).unwrap();
        assert_eq!(pool.shared.factory.opened.load(Ordering::SeqCst), 1);

        {
            let _conn = pool.get().unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.shared.factory.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausting_max_size_returns_pool_exhausted() {
        let factory = FakeFactory {
            opened: AtomicUsize::new(0),
        };
        let pool = ConnectionPool::new(factory, 0, 1, Duration::from_secs(30)).unwrap();
        let first = pool.get().unwrap();
        let second = pool.get();
        assert!(matches!(second, Err(Error::PoolExhausted)));
        drop(first);
        assert!(pool.get().is_ok());
    }
}

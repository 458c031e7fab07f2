use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, PoisonError};

use anyhow::Result;
use tracing::debug;

type ConnFactory<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

struct PoolState<C> {
    idle: Vec<C>,
    /// Idle plus checked-out slots; never exceeds capacity.
    live: usize,
}

/// Bounded pool of reusable, lazily-created connections. `acquire` is the
/// only blocking point; timeout policy, if any, is layered by the caller.
pub struct ConnectionPool<C> {
    capacity: usize,
    factory: ConnFactory<C>,
    state: Mutex<PoolState<C>>,
    available: Condvar,
}

impl<C> ConnectionPool<C> {
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        Self {
            capacity: capacity.max(1),
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
            }),
            available: Condvar::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().live
    }

    /// Check out a connection, creating one while under capacity, otherwise
    /// blocking until a slot is released.
    ///
    /// # Errors
    ///
    /// Propagates a factory failure to exactly one caller; the failed slot
    /// does not count as live.
    pub fn acquire(&self) -> Result<PooledConn<'_, C>> {
        let mut state = self.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConn {
                    pool: self,
                    conn: Some(conn),
                    dead: false,
                });
            }
            if state.live < self.capacity {
                state.live += 1;
                drop(state);
                match (self.factory)() {
                    Ok(conn) => {
                        debug!(live = self.live_count(), capacity = self.capacity, "pool opened connection");
                        return Ok(PooledConn {
                            pool: self,
                            conn: Some(conn),
                            dead: false,
                        });
                    }
                    Err(err) => {
                        let mut state = self.lock();
                        state.live -= 1;
                        drop(state);
                        self.available.notify_one();
                        return Err(err);
                    }
                }
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState<C>> {
        // A poisoned lock only means some holder panicked between two plain
        // field updates; the counters are written atomically under the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, conn: Option<C>) {
        let mut state = self.lock();
        match conn {
            Some(conn) => state.idle.push(conn),
            None => state.live -= 1,
        }
        drop(state);
        self.available.notify_one();
    }
}

/// Exclusive handle to one pooled connection. Dropping it returns the slot
/// to the pool unless it was marked dead, in which case the connection is
/// destroyed and the slot freed for a fresh replacement.
pub struct PooledConn<'a, C> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
    dead: bool,
}

impl<C> PooledConn<'_, C> {
    /// Evict this connection from the pool; it will never be reused.
    pub fn mark_dead(&mut self) {
        self.dead = true;
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for PooledConn<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &self.conn)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

impl<C> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        if self.dead {
            self.pool.release(None);
        } else {
            self.pool.release(self.conn.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn creates_lazily_up_to_capacity() -> Result<()> {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = ConnectionPool::new(2, move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });
        assert_eq!(pool.live_count(), 0);

        let first = pool.acquire()?;
        let second = pool.acquire()?;
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.live_count(), 2);

        drop(first);
        drop(second);
        // Released slots are reused, not recreated.
        let again = pool.acquire()?;
        assert_eq!(created.load(Ordering::SeqCst), 2);
        drop(again);
        Ok(())
    }

    #[test]
    fn never_exceeds_capacity_under_contention() -> Result<()> {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = Arc::new(ConnectionPool::new(3, move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        }));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let conn = pool.acquire().expect("acquire");
                    assert!(pool.live_count() <= 3);
                    thread::sleep(Duration::from_micros(50));
                    drop(conn);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker");
        }
        assert!(created.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[test]
    fn dead_slot_is_evicted_and_replaced() -> Result<()> {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = ConnectionPool::new(1, move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });

        let mut conn = pool.acquire()?;
        let first_id = *conn;
        conn.mark_dead();
        drop(conn);
        assert_eq!(pool.live_count(), 0);

        let replacement = pool.acquire()?;
        assert_ne!(*replacement, first_id);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn factory_failure_reaches_one_caller_and_frees_the_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool: ConnectionPool<usize> = ConnectionPool::new(1, move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("refused"))
            } else {
                Ok(7)
            }
        });

        let err = pool.acquire().expect_err("first acquire fails");
        assert!(err.to_string().contains("refused"));
        assert_eq!(pool.live_count(), 0);

        let conn = pool.acquire().expect("second acquire succeeds");
        assert_eq!(*conn, 7);
    }

    #[test]
    fn waiter_is_woken_by_release() -> Result<()> {
        let pool = Arc::new(ConnectionPool::new(1, || Ok(())));
        let held = pool.acquire()?;

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let conn = pool.acquire().expect("acquire after release");
                drop(conn);
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        waiter.join().expect("waiter");
        Ok(())
    }
}

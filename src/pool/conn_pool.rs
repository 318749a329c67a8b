//! Bounded pool of reusable handles.
//!
//! `acquire` blocks while every handle is checked out; the returned guard
//! puts its handle back when dropped.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("timed out after {0:?} waiting for a free connection")]
    Timeout(Duration),
}

struct Slots<C> {
    idle: VecDeque<C>,
    closed: bool,
}

pub struct ConnPool<C> {
    slots: Mutex<Slots<C>>,
    released: Condvar,
    max_conn: usize,
}

impl<C> ConnPool<C> {
    pub fn new(conns: Vec<C>) -> Self {
        let max_conn = conns.len();
        assert!(max_conn > 0, "connection pool needs at least one handle");
        debug!(max_conn, "connection pool ready");
        Self {
            slots: Mutex::new(Slots {
                idle: conns.into(),
                closed: false,
            }),
            released: Condvar::new(),
            max_conn,
        }
    }

    pub fn max_conn(&self) -> usize {
        self.max_conn
    }

    pub fn free_count(&self) -> usize {
        self.lock().idle.len()
    }

    /// Checks out a handle, blocking until one is returned.
    pub fn acquire(&self) -> Result<PooledConn<'_, C>, PoolError> {
        let mut slots = self.lock();
        loop {
            if slots.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = slots.idle.pop_front() {
                return Ok(PooledConn { pool: self, conn: Some(conn) });
            }
            slots = self.released.wait(slots).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConn<'_, C>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();
        loop {
            if slots.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = slots.idle.pop_front() {
                return Ok(PooledConn { pool: self, conn: Some(conn) });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout(timeout));
            }
            slots = self
                .released
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drops the idle handles and fails every pending and future acquire.
    /// Handles still checked out are dropped when their guards are.
    pub fn close(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        slots.idle.clear();
        drop(slots);
        self.released.notify_all();
    }

    fn release(&self, conn: C) {
        let mut slots = self.lock();
        if slots.closed {
            return;
        }
        slots.idle.push_back(conn);
        drop(slots);
        self.released.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, Slots<C>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> std::fmt::Debug for ConnPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("max_conn", &self.max_conn)
            .field("free", &self.free_count())
            .finish()
    }
}

/// A checked-out handle. Returned to its pool on drop.
pub struct PooledConn<'a, C> {
    pool: &'a ConnPool<C>,
    conn: Option<C>,
}

impl<C> PooledConn<'_, C> {
    /// Returns the handle to the pool now instead of at end of scope.
    pub fn release(self) {}
}

impl<C> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("handle present until drop")
    }
}

impl<C> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("handle present until drop")
    }
}

impl<C> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

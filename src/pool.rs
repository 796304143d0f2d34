//! Bounded pool of database sessions.
//!
//! The pool owns every idle connection and counts every leased one. All
//! bookkeeping happens under one `parking_lot::Mutex`; connecting, pinging
//! and closing happen after the lock is dropped, with the slot reserved
//! beforehand so the size bound holds while I/O is in flight. Waiting
//! acquirers park on a `Condvar` until a release, a discard or the timeout.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    backend::{Connector, GraphConnection},
    config::PoolConfig,
    deadline::Deadline,
    errors::GraphDbError,
    query::AccessMode,
};

/// How the holder of a session finished with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The connection is healthy and may be reused.
    Ok,
    /// The connection is suspect; it is closed and its slot freed.
    Error,
}

/// Point-in-time view of pool accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub leased: usize,
    pub idle: usize,
    pub opening: usize,
    pub created_total: u64,
    pub discarded_total: u64,
    pub exhausted_total: u64,
}

struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<T> {
    idle_read: VecDeque<IdleConnection<T>>,
    idle_write: VecDeque<IdleConnection<T>>,
    leased: usize,
    opening: usize,
    closed: bool,
    created_total: u64,
    discarded_total: u64,
    exhausted_total: u64,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            idle_read: VecDeque::new(),
            idle_write: VecDeque::new(),
            leased: 0,
            opening: 0,
            closed: false,
            created_total: 0,
            discarded_total: 0,
            exhausted_total: 0,
        }
    }

    fn idle_mut(&mut self, mode: AccessMode) -> &mut VecDeque<IdleConnection<T>> {
        match mode {
            AccessMode::Read => &mut self.idle_read,
            AccessMode::Write => &mut self.idle_write,
        }
    }

    fn idle_len(&self) -> usize {
        self.idle_read.len() + self.idle_write.len()
    }

    fn live(&self) -> usize {
        self.idle_len() + self.leased + self.opening
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    available: Condvar,
    next_lease: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn is_stale(&self, idle: &IdleConnection<C::Connection>, now: Instant) -> bool {
        self.config
            .max_connection_lifetime
            .is_some_and(|lifetime| now.duration_since(idle.created_at) >= lifetime)
    }

    fn needs_liveness_check(&self, idle: &IdleConnection<C::Connection>, now: Instant) -> bool {
        self.config
            .idle_liveness_check
            .is_some_and(|threshold| now.duration_since(idle.idle_since) >= threshold)
    }

    fn give_back(
        &self,
        conn: C::Connection,
        mode: AccessMode,
        created_at: Instant,
        lease_id: u64,
        outcome: ReleaseOutcome,
    ) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.leased -= 1;
        let expired = self
            .config
            .max_connection_lifetime
            .is_some_and(|lifetime| now.duration_since(created_at) >= lifetime);
        let discard = match outcome {
            ReleaseOutcome::Ok => state.closed || expired,
            ReleaseOutcome::Error => true,
        };
        if !discard {
            state.idle_mut(mode).push_back(IdleConnection {
                conn,
                created_at,
                idle_since: now,
            });
            drop(state);
            self.available.notify_all();
            debug!(lease_id, mode = mode.as_str(), "session returned to pool");
            return;
        }
        state.discarded_total += 1;
        drop(state);
        self.available.notify_all();
        if outcome == ReleaseOutcome::Error {
            warn!(lease_id, mode = mode.as_str(), "session discarded after error");
        } else {
            debug!(lease_id, mode = mode.as_str(), "session retired");
        }
        conn.close();
    }

    fn cancel_reservation(&self) {
        let mut state = self.state.lock();
        state.opening -= 1;
        drop(state);
        self.available.notify_all();
    }
}

/// Shared handle to a bounded session pool.
pub struct SessionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for SessionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> SessionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Result<Self, GraphDbError> {
        if config.max_size == 0 {
            return Err(GraphDbError::configuration("pool max_size must be positive"));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                state: Mutex::new(PoolState::new()),
                available: Condvar::new(),
                next_lease: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    /// Leases a session, waiting up to `timeout` for one to become available.
    /// A timeout too large to represent as an instant waits without bound.
    pub fn acquire(&self, mode: AccessMode, timeout: Duration) -> Result<Session<C>, GraphDbError> {
        self.acquire_until(mode, Instant::now().checked_add(timeout), false)
    }

    /// Leases a session within the configured acquire timeout, cut short by `deadline`.
    ///
    /// Fails with `DeadlineExceeded` when the caller's deadline is what ran out
    /// and with `PoolExhausted` when the acquire timeout did.
    pub fn acquire_with_deadline(
        &self,
        mode: AccessMode,
        deadline: Deadline,
    ) -> Result<Session<C>, GraphDbError> {
        let limit = Instant::now().checked_add(self.inner.config.acquire_timeout);
        match (deadline.instant(), limit) {
            (Some(at), Some(limit)) if at < limit => self.acquire_until(mode, Some(at), true),
            (Some(at), None) => self.acquire_until(mode, Some(at), true),
            _ => self.acquire_until(mode, limit, false),
        }
    }

    /// Returns a session to the pool.
    pub fn release(&self, session: Session<C>, outcome: ReleaseOutcome) {
        session.release(outcome);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            max_size: self.inner.config.max_size,
            leased: state.leased,
            idle: state.idle_len(),
            opening: state.opening,
            created_total: state.created_total,
            discarded_total: state.discarded_total,
            exhausted_total: state.exhausted_total,
        }
    }

    /// Closes idle connections and refuses further acquires. Leased sessions are
    /// closed when they come back.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let mut drained: Vec<_> = state.idle_read.drain(..).collect();
            drained.extend(state.idle_write.drain(..));
            state.discarded_total += drained.len() as u64;
            drained
        };
        self.inner.available.notify_all();
        info!(closed_idle = drained.len(), "session pool closed");
        for idle in drained {
            idle.conn.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn acquire_until(
        &self,
        mode: AccessMode,
        limit: Option<Instant>,
        deadline_bound: bool,
    ) -> Result<Session<C>, GraphDbError> {
        let started = Instant::now();
        let mut stale = Vec::new();
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                drop(state);
                close_all(stale);
                return Err(GraphDbError::PoolClosed);
            }

            let now = Instant::now();
            while let Some(idle) = state.idle_mut(mode).pop_back() {
                if self.inner.is_stale(&idle, now) {
                    state.discarded_total += 1;
                    stale.push(idle.conn);
                    continue;
                }
                state.leased += 1;
                let check = self.inner.needs_liveness_check(&idle, now);
                drop(state);
                close_all(std::mem::take(&mut stale));
                let mut idle = idle;
                if check {
                    if let Err(failure) = idle.conn.ping() {
                        warn!(mode = mode.as_str(), error = %failure, "idle connection failed liveness check");
                        idle.conn.close();
                        state = self.inner.state.lock();
                        state.leased -= 1;
                        state.discarded_total += 1;
                        self.inner.available.notify_all();
                        continue;
                    }
                }
                return Ok(self.lease(idle.conn, mode, idle.created_at));
            }

            if state.live() < self.inner.config.max_size {
                state.opening += 1;
                drop(state);
                close_all(stale);
                return self.open(mode);
            }

            let other = match mode {
                AccessMode::Read => AccessMode::Write,
                AccessMode::Write => AccessMode::Read,
            };
            if let Some(victim) = state.idle_mut(other).pop_front() {
                state.discarded_total += 1;
                state.opening += 1;
                drop(state);
                stale.push(victim.conn);
                close_all(stale);
                debug!(mode = mode.as_str(), "evicted idle {} connection to make room", other.as_str());
                return self.open(mode);
            }

            let now = Instant::now();
            if limit.is_some_and(|limit| now >= limit) {
                state.exhausted_total += 1;
                let leased = state.leased;
                drop(state);
                close_all(stale);
                let waited = now.duration_since(started);
                if deadline_bound {
                    return Err(GraphDbError::deadline(format!(
                        "no session available before caller deadline (waited {waited:?})"
                    )));
                }
                warn!(mode = mode.as_str(), leased, waited_ms = waited.as_millis() as u64, "session pool exhausted");
                return Err(GraphDbError::pool_exhausted(waited, self.inner.config.max_size));
            }
            match limit {
                Some(limit) => {
                    self.inner.available.wait_until(&mut state, limit);
                }
                None => self.inner.available.wait(&mut state),
            }
        }
    }

    fn open(&self, mode: AccessMode) -> Result<Session<C>, GraphDbError> {
        match self.inner.connector.connect(mode) {
            Ok(conn) => {
                let mut state = self.inner.state.lock();
                state.opening -= 1;
                state.leased += 1;
                state.created_total += 1;
                drop(state);
                debug!(mode = mode.as_str(), connector = %self.inner.connector.describe(), "opened connection");
                Ok(self.lease(conn, mode, Instant::now()))
            }
            Err(failure) => {
                self.inner.cancel_reservation();
                warn!(mode = mode.as_str(), error = %failure, "failed to open connection");
                Err(GraphDbError::from_failure(failure))
            }
        }
    }

    /// Wraps a connection whose slot is already counted in `leased`.
    fn lease(&self, conn: C::Connection, mode: AccessMode, created_at: Instant) -> Session<C> {
        let lease_id = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        Session {
            lease_id,
            acquired_at: Instant::now(),
            created_at,
            mode,
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }
}

fn close_all<T: GraphConnection>(conns: Vec<T>) {
    for conn in conns {
        conn.close();
    }
}

/// A leased connection. Dropping it without [`Session::release`] discards the
/// connection as if released with [`ReleaseOutcome::Error`].
pub struct Session<C: Connector> {
    lease_id: u64,
    acquired_at: Instant,
    created_at: Instant,
    mode: AccessMode,
    conn: Option<C::Connection>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connector> Session<C> {
    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn connection(&mut self) -> &mut C::Connection {
        self.conn
            .as_mut()
            .expect("session connection present until release")
    }

    pub fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .give_back(conn, self.mode, self.created_at, self.lease_id, outcome);
        }
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(lease_id = self.lease_id, "session dropped without release; discarding");
            self.pool.give_back(
                conn,
                self.mode,
                self.created_at,
                self.lease_id,
                ReleaseOutcome::Error,
            );
        }
    }
}

impl<C: Connector> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease_id", &self.lease_id)
            .field("mode", &self.mode)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

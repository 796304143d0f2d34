//! In-process transport with scripted failures, latency and responses.
//!
//! Used to exercise retry, pool and health behavior deterministically, and to
//! produce graph-native values without a running database.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::{
    backend::{Connector, GraphConnection},
    errors::{BackendFailure, FailureCode},
    query::{AccessMode, Parameters},
    record::QueryResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Connect,
    Begin,
    Run,
    Commit,
    Rollback,
    Ping,
}

#[derive(Default)]
struct Script {
    faults: AHashMap<FaultPoint, VecDeque<BackendFailure>>,
    responses: AHashMap<String, QueryResult>,
    connect_delay: Duration,
    run_delay: Duration,
    ping_delay: Duration,
    executed: Vec<(String, Parameters, AccessMode)>,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    closes: AtomicUsize,
    runs: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    pings: AtomicUsize,
}

struct Shared {
    script: Mutex<Script>,
    counters: Counters,
    next_id: AtomicU64,
}

/// Snapshot of how often each transport call happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connects: usize,
    pub closes: usize,
    pub runs: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub pings: usize,
}

#[derive(Clone)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script::default()),
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queues `failures` copies of `failure` at `point`; each call consumes one.
    pub fn configure_fault(&self, point: FaultPoint, failures: usize, failure: BackendFailure) {
        let mut script = self.shared.script.lock();
        let queue = script.faults.entry(point).or_default();
        for _ in 0..failures {
            queue.push_back(failure.clone());
        }
    }

    pub fn reset_faults(&self) {
        self.shared.script.lock().faults.clear();
    }

    /// Result returned whenever a statement with exactly this text runs.
    pub fn respond_to<T: Into<String>>(&self, query: T, result: QueryResult) {
        self.shared
            .script
            .lock()
            .responses
            .insert(query.into(), result);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.script.lock().connect_delay = delay;
    }

    pub fn set_run_delay(&self, delay: Duration) {
        self.shared.script.lock().run_delay = delay;
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        self.shared.script.lock().ping_delay = delay;
    }

    pub fn counts(&self) -> CallCounts {
        let c = &self.shared.counters;
        CallCounts {
            connects: c.connects.load(Ordering::SeqCst),
            closes: c.closes.load(Ordering::SeqCst),
            runs: c.runs.load(Ordering::SeqCst),
            commits: c.commits.load(Ordering::SeqCst),
            rollbacks: c.rollbacks.load(Ordering::SeqCst),
            pings: c.pings.load(Ordering::SeqCst),
        }
    }

    /// Statements run so far, in order, with their parameters and routing.
    pub fn executed(&self) -> Vec<(String, Parameters, AccessMode)> {
        self.shared.script.lock().executed.clone()
    }

    fn take_fault(&self, point: FaultPoint) -> Option<BackendFailure> {
        self.shared
            .script
            .lock()
            .faults
            .get_mut(&point)
            .and_then(|queue| queue.pop_front())
    }
}

impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    fn connect(&self, mode: AccessMode) -> Result<ScriptedConnection, BackendFailure> {
        let delay = self.shared.script.lock().connect_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(failure) = self.take_fault(FaultPoint::Connect) {
            return Err(failure);
        }
        self.shared.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            mode,
            in_transaction: false,
            connector: self.clone(),
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

pub struct ScriptedConnection {
    id: u64,
    mode: AccessMode,
    in_transaction: bool,
    connector: ScriptedConnector,
}

impl ScriptedConnection {
    /// Unique per connection opened by the same connector.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn counters(&self) -> &Counters {
        &self.connector.shared.counters
    }
}

impl GraphConnection for ScriptedConnection {
    fn begin(&mut self, _mode: AccessMode) -> Result<(), BackendFailure> {
        if let Some(failure) = self.connector.take_fault(FaultPoint::Begin) {
            return Err(failure);
        }
        self.in_transaction = true;
        Ok(())
    }

    fn run(
        &mut self,
        query: &str,
        params: &Parameters,
        deadline: Option<Instant>,
    ) -> Result<QueryResult, BackendFailure> {
        if !self.in_transaction {
            return Err(BackendFailure::permanent(
                FailureCode::Other,
                "statement run outside a transaction",
            ));
        }
        self.counters().runs.fetch_add(1, Ordering::SeqCst);
        let (delay, response) = {
            let mut script = self.connector.shared.script.lock();
            script
                .executed
                .push((query.to_string(), params.clone(), self.mode));
            (script.run_delay, script.responses.get(query).cloned())
        };
        if !delay.is_zero() {
            let finish = Instant::now() + delay;
            match deadline {
                Some(deadline) if deadline < finish => {
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return Err(BackendFailure::new(
                        FailureCode::Interrupted,
                        "statement interrupted at deadline",
                    ));
                }
                _ => thread::sleep(delay),
            }
        }
        if let Some(failure) = self.connector.take_fault(FaultPoint::Run) {
            return Err(failure);
        }
        Ok(response.unwrap_or_default())
    }

    fn commit(&mut self) -> Result<(), BackendFailure> {
        if let Some(failure) = self.connector.take_fault(FaultPoint::Commit) {
            return Err(failure);
        }
        self.in_transaction = false;
        self.counters().commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BackendFailure> {
        self.in_transaction = false;
        self.counters().rollbacks.fetch_add(1, Ordering::SeqCst);
        match self.connector.take_fault(FaultPoint::Rollback) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn ping(&mut self) -> Result<(), BackendFailure> {
        self.counters().pings.fetch_add(1, Ordering::SeqCst);
        let delay = self.connector.shared.script.lock().ping_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match self.connector.take_fault(FaultPoint::Ping) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn close(self) {
        self.counters().closes.fetch_add(1, Ordering::SeqCst);
    }
}

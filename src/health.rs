//! Database health probing outside the session pool.
//!
//! The monitor keeps its own connection so a saturated pool never makes the
//! database look down, and health checks never take slots from application
//! traffic. Each ping runs on a short-lived worker thread so a hung transport
//! is reported as `Unreachable` once `ping_timeout` passes instead of blocking
//! the caller. At most one worker is outstanding: while an abandoned probe is
//! still stuck in the transport, later checks report `Unreachable` without
//! spawning another.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Instant,
};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    backend::{Connector, GraphConnection},
    config::HealthConfig,
    errors::{BackendFailure, FailureCode},
    query::AccessMode,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Round-trip time of the ping, absent when it never completed.
    pub latency_ms: Option<u64>,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// A degraded database still serves traffic, so only `Unreachable` is 503.
    pub fn http_status(&self) -> u16 {
        match self.status {
            HealthStatus::Healthy | HealthStatus::Degraded => 200,
            HealthStatus::Unreachable => 503,
        }
    }
}

/// Result of a one-off connectivity verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectivityReport {
    pub status: bool,
    pub message: String,
    #[serde(skip)]
    http_status: u16,
}

impl ConnectivityReport {
    fn new<T: Into<String>>(status: bool, message: T, http_status: u16) -> Self {
        Self {
            status,
            message: message.into(),
            http_status,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }
}

enum Probe<T> {
    Done {
        conn: Option<T>,
        outcome: Result<(), BackendFailure>,
    },
    TimedOut,
    /// An earlier probe has not returned from the transport yet. Hands back
    /// the connection the probe would have used.
    Pending(Option<T>),
    Crashed,
}

/// Marks a probe as outstanding until dropped.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct HealthMonitor<C: Connector> {
    connector: Arc<C>,
    config: HealthConfig,
    conn: Mutex<Option<C::Connection>>,
    last: ArcSwapOption<HealthReport>,
    probing: Arc<AtomicBool>,
}

impl<C: Connector> HealthMonitor<C> {
    pub fn new(connector: C, config: HealthConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            conn: Mutex::new(None),
            last: ArcSwapOption::empty(),
            probing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Whether a probe thread is still waiting on the transport.
    pub fn probe_in_flight(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }

    /// Pings the database on the dedicated connection, opening it if needed.
    pub fn check(&self) -> HealthReport {
        let started = Instant::now();
        let existing = self.conn.lock().take();
        let probe = self.probe(existing);
        let elapsed = started.elapsed();

        let report = match probe {
            Probe::Done {
                conn,
                outcome: Ok(()),
            } => {
                if let Some(conn) = conn {
                    self.keep(conn);
                }
                let latency_ms = Some(elapsed.as_millis() as u64);
                if elapsed > self.config.degraded_threshold {
                    report(
                        HealthStatus::Degraded,
                        latency_ms,
                        format!(
                            "ping took {}ms, above the {}ms threshold",
                            elapsed.as_millis(),
                            self.config.degraded_threshold.as_millis()
                        ),
                    )
                } else {
                    report(HealthStatus::Healthy, latency_ms, "database reachable")
                }
            }
            Probe::Done {
                conn,
                outcome: Err(failure),
            } => {
                if let Some(conn) = conn {
                    conn.close();
                }
                report(HealthStatus::Unreachable, None, failure.to_string())
            }
            Probe::TimedOut => report(
                HealthStatus::Unreachable,
                None,
                format!(
                    "no response within {}ms",
                    self.config.ping_timeout.as_millis()
                ),
            ),
            Probe::Pending(conn) => {
                if let Some(conn) = conn {
                    self.keep(conn);
                }
                report(HealthStatus::Unreachable, None, "previous probe still pending")
            }
            Probe::Crashed => report(HealthStatus::Unreachable, None, "health probe failed"),
        };

        match report.status {
            HealthStatus::Healthy => debug!(latency_ms = ?report.latency_ms, "health check ok"),
            HealthStatus::Degraded => {
                warn!(latency_ms = ?report.latency_ms, "database responding slowly")
            }
            HealthStatus::Unreachable => warn!(reason = %report.message, "database unreachable"),
        }
        self.last.store(Some(Arc::new(report.clone())));
        report
    }

    /// Latest report without touching the database.
    pub fn last_report(&self) -> Option<Arc<HealthReport>> {
        self.last.load_full()
    }

    /// Opens a fresh connection, pings it and closes it again.
    pub fn verify_connectivity(&self) -> ConnectivityReport {
        info!(connector = %self.connector.describe(), "verifying database connectivity");
        let report = match self.probe(None) {
            Probe::Done {
                conn,
                outcome: Ok(()),
            } => {
                if let Some(conn) = conn {
                    conn.close();
                }
                ConnectivityReport::new(true, "Successfully connected to Neo4j database", 200)
            }
            Probe::Done {
                conn,
                outcome: Err(failure),
            } => {
                if let Some(conn) = conn {
                    conn.close();
                }
                let message = match failure.code {
                    FailureCode::ServiceUnavailable => "Database service is unavailable".to_string(),
                    FailureCode::SessionExpired => "Database session expired".to_string(),
                    _ => format!("Connection failed: {}", failure.message),
                };
                ConnectivityReport::new(false, message, 503)
            }
            Probe::TimedOut | Probe::Pending(_) => {
                ConnectivityReport::new(false, "Database service is unavailable", 503)
            }
            Probe::Crashed => ConnectivityReport::new(
                false,
                "Internal server error while verifying database connectivity",
                500,
            ),
        };
        if report.status {
            info!("database connectivity verified");
        } else {
            warn!(reason = %report.message, "database connectivity check failed");
        }
        report
    }

    /// Process liveness, independent of the database.
    pub fn liveness(&self) -> Value {
        json!({ "status": "healthy" })
    }

    fn keep(&self, conn: C::Connection) {
        let mut slot = self.conn.lock();
        if slot.is_none() {
            *slot = Some(conn);
            return;
        }
        // A concurrent check already parked its connection.
        drop(slot);
        conn.close();
    }

    fn probe(&self, existing: Option<C::Connection>) -> Probe<C::Connection> {
        if self.probing.swap(true, Ordering::AcqRel) {
            debug!("health probe still outstanding, not spawning another");
            return Probe::Pending(existing);
        }
        let in_flight = InFlight(Arc::clone(&self.probing));
        let (tx, rx) = mpsc::channel();
        let connector = Arc::clone(&self.connector);
        let spawned = thread::Builder::new()
            .name("graph-db-health".into())
            .spawn(move || {
                let mut conn = match existing {
                    Some(conn) => conn,
                    None => match connector.connect(AccessMode::Read) {
                        Ok(conn) => conn,
                        Err(failure) => {
                            drop(in_flight);
                            let _ = tx.send((None, Err(failure)));
                            return;
                        }
                    },
                };
                let outcome = conn.ping();
                // Cleared before replying so the next check may probe at once.
                drop(in_flight);
                if let Err(mpsc::SendError((Some(conn), _))) = tx.send((Some(conn), outcome)) {
                    conn.close();
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "could not spawn health probe thread");
            return Probe::Crashed;
        }
        match rx.recv_timeout(self.config.ping_timeout) {
            Ok((conn, outcome)) => Probe::Done { conn, outcome },
            Err(mpsc::RecvTimeoutError::Timeout) => Probe::TimedOut,
            Err(mpsc::RecvTimeoutError::Disconnected) => Probe::Crashed,
        }
    }
}

fn report<T: Into<String>>(status: HealthStatus, latency_ms: Option<u64>, message: T) -> HealthReport {
    HealthReport {
        status,
        latency_ms,
        message: message.into(),
        checked_at: Utc::now(),
    }
}

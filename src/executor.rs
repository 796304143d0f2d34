//! Transactional query execution with bounded retries.
//!
//! One call to [`QueryExecutor::execute`] is one transaction: begin, run the
//! template, commit. A transient failure rolls back and, after a backoff, runs
//! the whole transaction again on the same session unless the failure marked
//! the session invalid. Callers that retry writes are responsible for making
//! them idempotent (`MERGE`, idempotency keys).

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{
    backend::{Connector, GraphConnection},
    config::{DbConfig, RetryPolicy},
    deadline::Deadline,
    errors::{BackendFailure, GraphDbError},
    pool::{ReleaseOutcome, Session, SessionPool},
    query::{AccessMode, QueryDescriptor},
    record::{QueryResult, Record},
    retry::{RetryState, backoff_delay},
};

/// What one traced execution cost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Transaction attempts, including the successful one.
    pub attempts: u32,
    /// Distinct sessions leased from the pool.
    pub sessions: u32,
    pub elapsed: Duration,
}

enum AttemptError {
    Failed {
        failure: BackendFailure,
        reusable: bool,
    },
    DeadlineExceeded,
}

pub struct QueryExecutor<C: Connector> {
    pool: SessionPool<C>,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl<C: Connector> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            retry: self.retry.clone(),
            operation_timeout: self.operation_timeout,
        }
    }
}

impl<C: Connector> QueryExecutor<C> {
    pub fn new(pool: SessionPool<C>, retry: RetryPolicy, operation_timeout: Duration) -> Self {
        Self {
            pool,
            retry,
            operation_timeout,
        }
    }

    pub fn from_config(pool: SessionPool<C>, config: &DbConfig) -> Self {
        Self::new(pool, config.retry.clone(), config.operation_timeout)
    }

    pub fn pool(&self) -> &SessionPool<C> {
        &self.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn execute(
        &self,
        descriptor: &QueryDescriptor,
        mode: AccessMode,
    ) -> Result<Vec<Record>, GraphDbError> {
        self.execute_with_deadline(descriptor, mode, Deadline::none())
    }

    pub fn execute_read(&self, descriptor: &QueryDescriptor) -> Result<Vec<Record>, GraphDbError> {
        self.execute(descriptor, AccessMode::Read)
    }

    pub fn execute_write(&self, descriptor: &QueryDescriptor) -> Result<Vec<Record>, GraphDbError> {
        self.execute(descriptor, AccessMode::Write)
    }

    /// Runs `descriptor` bounded by the earlier of `deadline` and the operation timeout.
    pub fn execute_with_deadline(
        &self,
        descriptor: &QueryDescriptor,
        mode: AccessMode,
        deadline: Deadline,
    ) -> Result<Vec<Record>, GraphDbError> {
        self.execute_traced(descriptor, mode, deadline)
            .map(|(records, _)| records)
    }

    pub fn execute_traced(
        &self,
        descriptor: &QueryDescriptor,
        mode: AccessMode,
        deadline: Deadline,
    ) -> Result<(Vec<Record>, ExecutionReport), GraphDbError> {
        descriptor.validate()?;

        let started = Instant::now();
        let deadline = Deadline::after(self.operation_timeout).min(deadline);
        let mut report = ExecutionReport::default();
        let mut state = RetryState::start();
        let mut held: Option<Session<C>> = None;

        loop {
            report.attempts = state.attempts();
            if deadline.is_expired() {
                if let Some(session) = held.take() {
                    session.release(ReleaseOutcome::Error);
                }
                return Err(deadline_error(mode, report.attempts));
            }

            let mut session = match held.take() {
                Some(session) => session,
                None => match self.pool.acquire_with_deadline(mode, deadline) {
                    Ok(session) => {
                        report.sessions += 1;
                        session
                    }
                    Err(GraphDbError::Transient(failure)) => {
                        state = self.after_failure(
                            state.on_failure(true, &self.retry),
                            failure,
                            deadline,
                        )?;
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };

            debug!(
                lease_id = session.lease_id(),
                mode = mode.as_str(),
                attempt = report.attempts,
                "running transaction"
            );
            match run_transaction(session.connection(), descriptor, mode, deadline) {
                Ok(result) => {
                    session.release(ReleaseOutcome::Ok);
                    state = state.on_success();
                    report.attempts = state.attempts();
                    report.elapsed = started.elapsed();
                    return Ok((result.into_records(), report));
                }
                Err(AttemptError::DeadlineExceeded) => {
                    session.release(ReleaseOutcome::Error);
                    return Err(deadline_error(mode, report.attempts));
                }
                Err(AttemptError::Failed { failure, reusable }) => {
                    state = state.on_failure(failure.is_retryable(), &self.retry);
                    if reusable && matches!(state, RetryState::BackingOff(_)) {
                        held = Some(session);
                    } else if reusable {
                        session.release(ReleaseOutcome::Ok);
                    } else {
                        session.release(ReleaseOutcome::Error);
                    }
                    state = self.after_failure(state, failure, deadline)?;
                }
            }
        }
    }

    /// Backs off when `state` allows another attempt and returns the next state;
    /// otherwise turns `failure` into the error the caller sees. A session is
    /// only held across this call while backing off.
    fn after_failure(
        &self,
        state: RetryState,
        failure: BackendFailure,
        deadline: Deadline,
    ) -> Result<RetryState, GraphDbError> {
        match state {
            RetryState::BackingOff(attempt) => {
                let delay = backoff_delay(&self.retry, attempt, deadline);
                warn!(
                    attempt,
                    max_attempts = self.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                Ok(state.on_backoff_elapsed())
            }
            RetryState::Exhausted(attempts) if failure.is_retryable() => {
                warn!(attempts, error = %failure, "retries exhausted");
                Err(GraphDbError::exhausted(failure, attempts))
            }
            _ => {
                debug!(error = %failure, "permanent failure");
                Err(GraphDbError::from_failure(failure))
            }
        }
    }
}

fn deadline_error(mode: AccessMode, attempts: u32) -> GraphDbError {
    warn!(mode = mode.as_str(), attempts, "operation deadline exceeded");
    GraphDbError::deadline(format!(
        "{} operation did not complete in time (attempt {attempts})",
        mode.as_str()
    ))
}

fn run_transaction<T: GraphConnection>(
    conn: &mut T,
    descriptor: &QueryDescriptor,
    mode: AccessMode,
    deadline: Deadline,
) -> Result<QueryResult, AttemptError> {
    if let Err(failure) = conn.begin(mode) {
        return Err(AttemptError::Failed {
            reusable: !failure.session_invalid,
            failure,
        });
    }

    let result = match conn.run(descriptor.template(), descriptor.params(), deadline.instant()) {
        Ok(result) => result,
        Err(failure) => {
            let rolled_back = conn.rollback().is_ok();
            if deadline.is_expired() {
                return Err(AttemptError::DeadlineExceeded);
            }
            return Err(AttemptError::Failed {
                reusable: rolled_back && !failure.session_invalid,
                failure,
            });
        }
    };

    if deadline.is_expired() {
        if let Err(failure) = conn.rollback() {
            debug!(error = %failure, "rollback after deadline failed");
        }
        return Err(AttemptError::DeadlineExceeded);
    }

    if let Err(failure) = conn.commit() {
        let rolled_back = conn.rollback().is_ok();
        return Err(AttemptError::Failed {
            reusable: rolled_back && !failure.session_invalid,
            failure,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedConnector;
    use crate::backend::scripted::FaultPoint;
    use crate::config::PoolConfig;
    use crate::errors::{ErrorKind, FailureCode};

    fn executor(max_attempts: u32) -> (ScriptedConnector, QueryExecutor<ScriptedConnector>) {
        let connector = ScriptedConnector::new();
        let pool = SessionPool::new(
            connector.clone(),
            PoolConfig {
                max_size: 2,
                acquire_timeout: Duration::from_millis(100),
                ..PoolConfig::default()
            },
        )
        .unwrap();
        let executor = QueryExecutor::new(
            pool,
            RetryPolicy::fixed(max_attempts, Duration::from_millis(1)),
            Duration::from_secs(5),
        );
        (connector, executor)
    }

    #[test]
    fn test_transient_failures_reuse_valid_session() {
        let (connector, executor) = executor(3);
        connector.configure_fault(
            FaultPoint::Run,
            1,
            BackendFailure::new(FailureCode::Deadlock, "deadlock detected"),
        );
        let descriptor = QueryDescriptor::new("RETURN 1");
        let (_, report) = executor
            .execute_traced(&descriptor, AccessMode::Write, Deadline::none())
            .unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.sessions, 1);
        assert_eq!(connector.counts().rollbacks, 1);
    }

    #[test]
    fn test_invalid_session_is_replaced_between_attempts() {
        let (connector, executor) = executor(3);
        connector.configure_fault(FaultPoint::Run, 1, BackendFailure::connection_reset("reset"));
        let descriptor = QueryDescriptor::new("RETURN 1");
        let (_, report) = executor
            .execute_traced(&descriptor, AccessMode::Read, Deadline::none())
            .unwrap();
        assert_eq!(report.sessions, 2);
        assert_eq!(connector.counts().connects, 2);
        assert_eq!(executor.pool().stats().discarded_total, 1);
    }

    #[test]
    fn test_transient_connect_failure_counts_as_attempt() {
        let (connector, executor) = executor(2);
        connector.configure_fault(
            FaultPoint::Connect,
            2,
            BackendFailure::service_unavailable("refused"),
        );
        let err = executor
            .execute(&QueryDescriptor::new("RETURN 1"), AccessMode::Read)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert_eq!(err.retries_exhausted(), Some(2));
        assert_eq!(connector.counts().runs, 0);
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let (connector, executor) = executor(1);
        connector.configure_fault(FaultPoint::Commit, 1, BackendFailure::constraint("unique"));
        let err = executor
            .execute_write(&QueryDescriptor::new("CREATE (n)"))
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert_eq!(connector.counts().commits, 0);
        assert_eq!(connector.counts().rollbacks, 1);
        assert_eq!(executor.pool().stats().idle, 1);
    }

    #[test]
    fn test_operation_timeout_bounds_execution() {
        let connector = ScriptedConnector::new();
        connector.set_run_delay(Duration::from_millis(300));
        let pool = SessionPool::new(connector.clone(), PoolConfig::default()).unwrap();
        let executor = QueryExecutor::new(pool, RetryPolicy::default(), Duration::from_millis(30));
        let err = executor
            .execute_read(&QueryDescriptor::new("RETURN 1"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(executor.pool().stats().leased, 0);
        assert_eq!(executor.pool().stats().discarded_total, 1);
    }

    #[test]
    fn test_deadline_after_run_survives_failed_rollback() {
        let connector = ScriptedConnector::new();
        connector.configure_fault(
            FaultPoint::Rollback,
            1,
            BackendFailure::connection_reset("reset during rollback"),
        );
        let mut conn = connector.connect(AccessMode::Write).unwrap();
        let outcome = run_transaction(
            &mut conn,
            &QueryDescriptor::new("RETURN 1"),
            AccessMode::Write,
            Deadline::at(Instant::now()),
        );
        assert!(matches!(outcome, Err(AttemptError::DeadlineExceeded)));
        assert_eq!(connector.counts().runs, 1);
        assert_eq!(connector.counts().rollbacks, 1);
        assert_eq!(connector.counts().commits, 0);
    }
}

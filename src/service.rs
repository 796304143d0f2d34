//! Entry point for request handlers.
//!
//! [`GraphService`] bundles pool, executor, mapper and health monitor behind
//! one value an HTTP layer can share. Its results are already in response
//! shape: a JSON payload on success, an [`ApiError`] with a status code on
//! failure.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    backend::Connector,
    config::DbConfig,
    deadline::Deadline,
    errors::{ErrorKind, GraphDbError, StatusCategory},
    executor::QueryExecutor,
    health::{ConnectivityReport, HealthMonitor, HealthReport},
    mapper::ResultMapper,
    pool::{PoolStats, SessionPool},
    query::{AccessMode, QueryDescriptor},
};

/// One logical operation as received from a request handler.
#[derive(Clone, Debug)]
pub struct OperationRequest {
    pub descriptor: QueryDescriptor,
    pub mode: AccessMode,
    pub deadline: Deadline,
}

impl OperationRequest {
    pub fn read(descriptor: QueryDescriptor) -> Self {
        Self {
            descriptor,
            mode: AccessMode::Read,
            deadline: Deadline::none(),
        }
    }

    pub fn write(descriptor: QueryDescriptor) -> Self {
        Self {
            descriptor,
            mode: AccessMode::Write,
            deadline: Deadline::none(),
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiResponse {
    /// Array of mapped records.
    pub records: Value,
    pub attempts: u32,
}

/// A classified failure ready to be rendered as an HTTP error body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Error)]
#[error("{status} {kind:?}: {detail}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub status: u16,
    pub category: StatusCategory,
    pub detail: String,
    /// Whether the same request may succeed later without changes.
    pub retryable: bool,
}

impl From<&GraphDbError> for ApiError {
    fn from(err: &GraphDbError) -> Self {
        let retryable = matches!(
            err.kind(),
            ErrorKind::PoolExhausted | ErrorKind::Transient | ErrorKind::DeadlineExceeded
        ) || err.retries_exhausted().is_some();
        ApiError {
            kind: err.kind(),
            status: err.http_status(),
            category: err.status_category(),
            detail: err.to_string(),
            retryable,
        }
    }
}

impl From<GraphDbError> for ApiError {
    fn from(err: GraphDbError) -> Self {
        ApiError::from(&err)
    }
}

pub struct GraphService<C: Connector> {
    executor: QueryExecutor<C>,
    mapper: ResultMapper,
    health: HealthMonitor<C>,
}

impl<C: Connector + Clone> GraphService<C> {
    pub fn new(connector: C, config: &DbConfig) -> Result<Self, GraphDbError> {
        config.validate()?;
        let pool = SessionPool::new(connector.clone(), config.pool.clone())?;
        info!(
            connector = %connector.describe(),
            max_size = config.pool.max_size,
            "graph service ready"
        );
        Ok(Self {
            executor: QueryExecutor::from_config(pool, config),
            mapper: ResultMapper::new(),
            health: HealthMonitor::new(connector, config.health.clone()),
        })
    }
}

#[cfg(feature = "sqlite-backend")]
impl GraphService<crate::backend::SqliteConnector> {
    /// Service over the embedded store named by `config.endpoint`.
    pub fn open(config: &DbConfig) -> Result<Self, GraphDbError> {
        let connector = crate::backend::SqliteConnector::from_config(config)?;
        Self::new(connector, config)
    }
}

impl<C: Connector> GraphService<C> {
    pub fn run(&self, request: OperationRequest) -> Result<ApiResponse, ApiError> {
        let OperationRequest {
            descriptor,
            mode,
            deadline,
        } = request;
        let outcome = self
            .executor
            .execute_traced(&descriptor, mode, deadline)
            .and_then(|(records, report)| {
                let payload = self.mapper.map_all(&records)?;
                Ok(ApiResponse {
                    records: payload,
                    attempts: report.attempts,
                })
            });
        outcome.map_err(|err| {
            let api = ApiError::from(&err);
            if api.category == StatusCategory::ServerError {
                warn!(status = api.status, kind = ?api.kind, error = %err, "operation failed");
            } else {
                info!(status = api.status, kind = ?api.kind, error = %err, "operation rejected");
            }
            api
        })
    }

    pub fn check_health(&self) -> HealthReport {
        self.health.check()
    }

    pub fn last_health(&self) -> Option<std::sync::Arc<HealthReport>> {
        self.health.last_report()
    }

    pub fn verify_connectivity(&self) -> ConnectivityReport {
        self.health.verify_connectivity()
    }

    pub fn liveness(&self) -> Value {
        self.health.liveness()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.executor.pool().stats()
    }

    pub fn executor(&self) -> &QueryExecutor<C> {
        &self.executor
    }

    pub fn mapper(&self) -> &ResultMapper {
        &self.mapper
    }

    /// Stops handing out sessions and closes idle connections.
    pub fn shutdown(&self) {
        self.executor.pool().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedConnector;
    use crate::backend::scripted::FaultPoint;
    use crate::errors::BackendFailure;
    use crate::record::QueryResult;
    use crate::value::GraphValue;
    use serde_json::json;

    fn service() -> (ScriptedConnector, GraphService<ScriptedConnector>) {
        let connector = ScriptedConnector::new();
        let mut config = DbConfig::default();
        config.retry.initial_backoff = Duration::from_millis(1);
        let service = GraphService::new(connector.clone(), &config).unwrap();
        (connector, service)
    }

    #[test]
    fn test_run_maps_records() {
        let (connector, service) = service();
        connector.respond_to(
            "MATCH (p:Person {name: $name}) RETURN p.age AS age",
            QueryResult::new(vec!["age".into()], vec![vec![GraphValue::Integer(36)]]),
        );
        let descriptor =
            QueryDescriptor::new("MATCH (p:Person {name: $name}) RETURN p.age AS age")
                .param("name", "Ada");
        let response = service.run(OperationRequest::read(descriptor)).unwrap();
        assert_eq!(response.records, json!([{"age": 36}]));
        assert_eq!(response.attempts, 1);
    }

    #[test]
    fn test_validation_error_is_client_error() {
        let (connector, service) = service();
        let err = service
            .run(OperationRequest::write(QueryDescriptor::new(
                "CREATE (n {name: $name})",
            )))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.status, 422);
        assert_eq!(err.category, StatusCategory::ClientError);
        assert!(!err.retryable);
        assert_eq!(connector.counts().connects, 0);
    }

    #[test]
    fn test_exhausted_retries_are_server_errors() {
        let (connector, service) = service();
        connector.configure_fault(FaultPoint::Run, 3, BackendFailure::connection_reset("reset"));
        let err = service
            .run(OperationRequest::read(QueryDescriptor::new("RETURN 1")))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Permanent);
        assert_eq!(err.status, 503);
        assert!(err.retryable);
        assert!(err.detail.contains("retries exhausted after 3 attempts"));
    }

    #[test]
    fn test_shutdown_closes_pool() {
        let (_, service) = service();
        service
            .run(OperationRequest::read(QueryDescriptor::new("RETURN 1")))
            .unwrap();
        service.shutdown();
        let err = service
            .run(OperationRequest::read(QueryDescriptor::new("RETURN 1")))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PoolClosed);
        assert_eq!(service.pool_stats().idle, 0);
    }
}

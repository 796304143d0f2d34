//! Graph-database access layer for a REST API.
//!
//! The crate sits between request handlers and the database:
//!
//! * [`pool::SessionPool`] leases a bounded number of connections,
//! * [`executor::QueryExecutor`] runs parameterized queries in a transaction and
//!   retries transient failures with backoff,
//! * [`mapper::ResultMapper`] turns records into JSON without losing types,
//! * [`health::HealthMonitor`] probes the database on its own connection,
//! * [`service::GraphService`] ties them together and classifies every failure
//!   with an HTTP status.
//!
//! Transports implement [`backend::Connector`]. An embedded SQLite store
//! ([`backend::SqliteConnector`]) and a scripted in-process transport
//! ([`backend::ScriptedConnector`]) are included.
//!
//! ```rust
//! use graph_db_api::{DbConfig, GraphService, OperationRequest, QueryDescriptor};
//! use graph_db_api::backend::ScriptedConnector;
//!
//! let service = GraphService::new(ScriptedConnector::new(), &DbConfig::default()).unwrap();
//! let descriptor = QueryDescriptor::new("MATCH (n) WHERE n.id = $id RETURN n").param("id", 7);
//! let response = service.run(OperationRequest::read(descriptor)).unwrap();
//! assert_eq!(response.attempts, 1);
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod deadline;
pub mod errors;
pub mod executor;
pub mod health;
pub mod logging;
pub mod mapper;
pub mod pool;
pub mod query;
pub mod record;
pub mod retry;
#[cfg(feature = "sqlite-backend")]
pub mod schema;
pub mod service;
pub mod value;

pub use crate::config::{Credentials, DbConfig, HealthConfig, PoolConfig, RetryPolicy};
pub use crate::deadline::Deadline;
pub use crate::errors::{
    BackendFailure, ErrorKind, FailureCode, FailureKind, GraphDbError, StatusCategory,
};
pub use crate::executor::{ExecutionReport, QueryExecutor};
pub use crate::health::{ConnectivityReport, HealthMonitor, HealthReport, HealthStatus};
pub use crate::mapper::ResultMapper;
pub use crate::pool::{PoolStats, ReleaseOutcome, Session, SessionPool};
pub use crate::query::{AccessMode, Parameters, QueryDescriptor};
pub use crate::record::{QueryResult, Record};
pub use crate::retry::RetryState;
pub use crate::service::{ApiError, ApiResponse, GraphService, OperationRequest};
pub use crate::value::{GraphDuration, GraphValue, Node, ParamValue, Path, Relationship};

//! Transport traits between the pool/executor and a concrete graph database.
//!
//! A [`Connector`] opens [`GraphConnection`]s routed by [`AccessMode`]; the pool,
//! executor and health monitor only ever talk to these traits. Failures are
//! returned already classified as [`BackendFailure`]s so nothing above this layer
//! needs to understand database-native error codes.

use std::{sync::Arc, time::Instant};

use crate::{
    errors::BackendFailure,
    query::{AccessMode, Parameters},
    record::QueryResult,
};

#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

pub mod scripted;

#[cfg(feature = "sqlite-backend")]
pub use sqlite::SqliteConnector;

pub use scripted::{ScriptedConnection, ScriptedConnector};

/// One live connection to the database.
pub trait GraphConnection: Send + 'static {
    fn begin(&mut self, mode: AccessMode) -> Result<(), BackendFailure>;

    /// Runs one statement inside the open transaction. Transports that can observe
    /// `deadline` abort the statement once it passes.
    fn run(
        &mut self,
        query: &str,
        params: &Parameters,
        deadline: Option<Instant>,
    ) -> Result<QueryResult, BackendFailure>;

    fn commit(&mut self) -> Result<(), BackendFailure>;

    fn rollback(&mut self) -> Result<(), BackendFailure>;

    /// Cheapest round trip the transport supports.
    fn ping(&mut self) -> Result<(), BackendFailure>;

    fn close(self)
    where
        Self: Sized,
    {
    }
}

/// Opens connections; may block on network I/O.
pub trait Connector: Send + Sync + 'static {
    type Connection: GraphConnection;

    fn connect(&self, mode: AccessMode) -> Result<Self::Connection, BackendFailure>;

    /// Short name used in logs and health reports.
    fn describe(&self) -> String;
}

impl<C> Connector for Arc<C>
where
    C: Connector + ?Sized,
{
    type Connection = C::Connection;

    fn connect(&self, mode: AccessMode) -> Result<Self::Connection, BackendFailure> {
        (**self).connect(mode)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

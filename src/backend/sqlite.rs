//! Embedded graph store on SQLite.
//!
//! Query templates are SQL with `$name` parameters. Columns declared `JSON`
//! decode into lists and maps, `DATE`/`DATETIME`/`DURATION` columns into
//! temporal values, `BOOLEAN` into booleans and blobs into bytes.
//!
//! Endpoints:
//!
//! * `sqlite::memory:` a private in-memory store shared by this connector's connections
//! * `sqlite::memory:<name>` a named in-memory store shared across connectors
//! * `sqlite://<path>` a database file
//!
//! Read-mode connections go to a random read replica when any are configured
//! and refuse writes (`query_only`).

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rusqlite::{
    Connection, ErrorCode, OpenFlags,
    types::{Value as SqlValue, ValueRef},
};
use tracing::debug;

use crate::{
    backend::{Connector, GraphConnection},
    config::DbConfig,
    errors::{BackendFailure, FailureCode, GraphDbError},
    mapper::ResultMapper,
    query::{AccessMode, Parameters},
    record::QueryResult,
    value::{GraphDuration, GraphValue, ParamValue},
};

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);
const PROGRESS_STEPS: i32 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq)]
enum SqliteTarget {
    Memory(String),
    File(PathBuf),
}

impl SqliteTarget {
    fn parse(endpoint: &str) -> Result<Self, GraphDbError> {
        let endpoint = endpoint.trim();
        if let Some(name) = endpoint.strip_prefix("sqlite::memory:") {
            let name = if name.is_empty() {
                format!("graph-db-api-{:016x}", rand::random::<u64>())
            } else {
                name.to_string()
            };
            return Ok(SqliteTarget::Memory(name));
        }
        if let Some(path) = endpoint.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(GraphDbError::configuration(format!(
                    "endpoint {endpoint:?} has no database path"
                )));
            }
            return Ok(SqliteTarget::File(PathBuf::from(path)));
        }
        Err(GraphDbError::configuration(format!(
            "unsupported endpoint {endpoint:?}; expected sqlite::memory:[name] or sqlite://<path>"
        )))
    }

    fn label(&self) -> String {
        match self {
            SqliteTarget::Memory(name) => format!("sqlite::memory:{name}"),
            SqliteTarget::File(path) => format!("sqlite://{}", path.display()),
        }
    }

    fn open(&self, mode: AccessMode) -> Result<Connection, BackendFailure> {
        let conn = match self {
            SqliteTarget::Memory(name) => Connection::open_with_flags(
                format!("file:{name}?mode=memory&cache=shared"),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            SqliteTarget::File(path) => match mode {
                AccessMode::Write => Connection::open(path),
                // Not SQLITE_OPEN_READ_ONLY: a read-only handle cannot recover the
                // WAL index when no writer is attached. `query_only` blocks writes.
                AccessMode::Read => Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                ),
            },
        }
        .map_err(|e| classify(&e))?;

        conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| classify(&e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| classify(&e))?;
        match (self, mode) {
            (SqliteTarget::File(_), AccessMode::Write) => {
                if conn.pragma_update(None, "journal_mode", "WAL").is_err() {
                    let _ = conn.pragma_update(None, "journal_mode", "DELETE");
                }
                let _ = conn.pragma_update(None, "synchronous", "NORMAL");
            }
            (_, AccessMode::Read) => {
                conn.pragma_update(None, "query_only", "ON")
                    .map_err(|e| classify(&e))?;
            }
            _ => {}
        }
        conn.set_prepared_statement_cache_capacity(64);
        Ok(conn)
    }
}

struct SqliteInner {
    primary: SqliteTarget,
    replicas: Vec<SqliteTarget>,
    database: String,
    // In-memory stores vanish with their last connection; these keep them alive
    // while the pool churns.
    _anchors: Vec<Mutex<Connection>>,
}

/// Opens [`SqliteConnection`]s for a primary store and optional read replicas.
#[derive(Clone)]
pub struct SqliteConnector {
    inner: Arc<SqliteInner>,
}

impl SqliteConnector {
    pub fn open(endpoint: &str) -> Result<Self, GraphDbError> {
        Self::from_config(&DbConfig::new(endpoint))
    }

    pub fn from_config(config: &DbConfig) -> Result<Self, GraphDbError> {
        let primary = SqliteTarget::parse(&config.endpoint)?;
        let replicas = config
            .read_replicas
            .iter()
            .map(|endpoint| SqliteTarget::parse(endpoint))
            .collect::<Result<Vec<_>, _>>()?;
        if !config.credentials.username.is_empty() {
            debug!("embedded store ignores credentials");
        }

        let mut anchors = Vec::new();
        for target in std::iter::once(&primary).chain(replicas.iter()) {
            if let SqliteTarget::Memory(_) = target {
                let conn = target
                    .open(AccessMode::Write)
                    .map_err(|failure| GraphDbError::configuration(failure.to_string()))?;
                anchors.push(Mutex::new(conn));
            }
        }

        Ok(Self {
            inner: Arc::new(SqliteInner {
                primary,
                replicas,
                database: config.database.clone(),
                _anchors: anchors,
            }),
        })
    }

    /// Creates or upgrades the graph tables on the primary store.
    pub fn ensure_schema(&self) -> Result<i64, GraphDbError> {
        let conn = self
            .inner
            .primary
            .open(AccessMode::Write)
            .map_err(GraphDbError::from_failure)?;
        crate::schema::ensure_schema(&conn)?;
        crate::schema::read_schema_version(&conn)
    }

    fn target_for(&self, mode: AccessMode) -> &SqliteTarget {
        match mode {
            AccessMode::Read => self
                .inner
                .replicas
                .choose(&mut rand::thread_rng())
                .unwrap_or(&self.inner.primary),
            AccessMode::Write => &self.inner.primary,
        }
    }
}

impl Connector for SqliteConnector {
    type Connection = SqliteConnection;

    fn connect(&self, mode: AccessMode) -> Result<SqliteConnection, BackendFailure> {
        let target = self.target_for(mode);
        let conn = target.open(mode)?;
        debug!(target_store = %target.label(), mode = mode.as_str(), "sqlite connection opened");
        Ok(SqliteConnection { conn, mode })
    }

    fn describe(&self) -> String {
        format!("{} (database {})", self.inner.primary.label(), self.inner.database)
    }
}

pub struct SqliteConnection {
    conn: Connection,
    mode: AccessMode,
}

impl SqliteConnection {
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn query(&self, sql: &str, params: &Parameters) -> Result<QueryResult, BackendFailure> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(|e| classify(&e))?;
        for (name, value) in params {
            let key = format!("${name}");
            if let Some(index) = stmt.parameter_index(&key).map_err(|e| classify(&e))? {
                stmt.raw_bind_parameter(index, to_sql(value))
                    .map_err(|e| classify(&e))?;
            }
        }

        if stmt.column_count() == 0 {
            let changed = stmt.raw_execute().map_err(|e| classify(&e))?;
            return Ok(QueryResult {
                rows_affected: Some(changed as u64),
                ..QueryResult::default()
            });
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let decl_types: Vec<Option<String>> = stmt
            .columns()
            .iter()
            .map(|c| c.decl_type().map(|t| t.to_ascii_uppercase()))
            .collect();
        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| classify(&e))? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, decl) in decl_types.iter().enumerate() {
                let raw = row.get_ref(i).map_err(|e| classify(&e))?;
                values.push(from_sql(raw, decl.as_deref())?);
            }
            out.push(values);
        }
        Ok(QueryResult::new(columns, out))
    }
}

impl GraphConnection for SqliteConnection {
    fn begin(&mut self, mode: AccessMode) -> Result<(), BackendFailure> {
        let sql = match mode {
            AccessMode::Write => "BEGIN IMMEDIATE",
            AccessMode::Read => "BEGIN DEFERRED",
        };
        self.conn.execute_batch(sql).map_err(|e| classify(&e))
    }

    fn run(
        &mut self,
        query: &str,
        params: &Parameters,
        deadline: Option<Instant>,
    ) -> Result<QueryResult, BackendFailure> {
        if let Some(deadline) = deadline {
            self.conn
                .progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));
        }
        let result = self.query(query, params);
        if deadline.is_some() {
            self.conn.progress_handler(0, None::<fn() -> bool>);
        }
        result
    }

    fn commit(&mut self) -> Result<(), BackendFailure> {
        self.conn.execute_batch("COMMIT").map_err(|e| classify(&e))
    }

    fn rollback(&mut self) -> Result<(), BackendFailure> {
        // SQLite may already have rolled back, e.g. after an interrupt.
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK").map_err(|e| classify(&e))
    }

    fn ping(&mut self) -> Result<(), BackendFailure> {
        self.conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|_| ())
            .map_err(|e| classify(&e))
    }

    fn close(self) {
        if let Err((_, err)) = self.conn.close() {
            debug!(error = %err, "sqlite connection did not close cleanly");
        }
    }
}

/// Maps a rusqlite error onto the transport-neutral failure taxonomy.
pub(crate) fn classify(err: &rusqlite::Error) -> BackendFailure {
    let message = err.to_string();
    if let Some(code) = err.sqlite_error_code() {
        let code = match code {
            ErrorCode::DatabaseBusy => FailureCode::LockContention,
            ErrorCode::DatabaseLocked => FailureCode::Deadlock,
            ErrorCode::ConstraintViolation => FailureCode::ConstraintViolation,
            ErrorCode::ReadOnly => FailureCode::ReadOnly,
            ErrorCode::OperationInterrupted => FailureCode::Interrupted,
            ErrorCode::AuthorizationForStatementDenied | ErrorCode::PermissionDenied => {
                FailureCode::Authorization
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => FailureCode::ServiceUnavailable,
            ErrorCode::SystemIoFailure | ErrorCode::DatabaseCorrupt | ErrorCode::DiskFull => {
                FailureCode::ConnectionReset
            }
            ErrorCode::TypeMismatch | ErrorCode::TooBig => FailureCode::TypeMismatch,
            // SQLITE_ERROR: syntax errors, unknown tables and columns.
            ErrorCode::Unknown | ErrorCode::ApiMisuse => FailureCode::SyntaxError,
            _ => FailureCode::Other,
        };
        return BackendFailure::new(code, message);
    }
    match err {
        rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::InvalidParameterCount(..)
        | rusqlite::Error::ToSqlConversionFailure(_)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            BackendFailure::new(FailureCode::TypeMismatch, message)
        }
        _ => BackendFailure::new(FailureCode::Other, message),
    }
}

fn to_sql(value: &ParamValue) -> SqlValue {
    match value {
        ParamValue::Null => SqlValue::Null,
        ParamValue::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        ParamValue::Integer(i) => SqlValue::Integer(*i),
        ParamValue::Float(f) => SqlValue::Real(*f),
        ParamValue::String(s) => SqlValue::Text(s.clone()),
        ParamValue::List(_) | ParamValue::Map(_) => SqlValue::Text(value.to_json().to_string()),
    }
}

fn from_sql(raw: ValueRef<'_>, decl: Option<&str>) -> Result<GraphValue, BackendFailure> {
    let mismatch = |what: &str| {
        BackendFailure::new(
            FailureCode::TypeMismatch,
            format!("column declared {} holds {what}", decl.unwrap_or("?")),
        )
    };
    Ok(match raw {
        ValueRef::Null => GraphValue::Null,
        ValueRef::Integer(i) => match decl {
            Some("BOOLEAN" | "BOOL") => GraphValue::Boolean(i != 0),
            _ => GraphValue::Integer(i),
        },
        ValueRef::Real(f) => GraphValue::Float(f),
        ValueRef::Blob(bytes) => GraphValue::Bytes(bytes.to_vec()),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| mismatch("invalid UTF-8"))?;
            match decl {
                Some("JSON") => {
                    let json: serde_json::Value =
                        serde_json::from_str(text).map_err(|_| mismatch("malformed JSON"))?;
                    ResultMapper::new()
                        .unmap(&json)
                        .map_err(|e| BackendFailure::new(FailureCode::TypeMismatch, e.to_string()))?
                }
                Some("DATE") => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map(GraphValue::Date)
                    .map_err(|_| mismatch("an invalid date"))?,
                Some("DATETIME" | "TIMESTAMP") => parse_datetime(text)
                    .ok_or_else(|| mismatch("an invalid datetime"))?,
                Some("DURATION") => GraphDuration::parse_iso8601(text)
                    .map(GraphValue::Duration)
                    .ok_or_else(|| mismatch("an invalid duration"))?,
                _ => GraphValue::String(text.to_string()),
            }
        }
    })
}

fn parse_datetime(text: &str) -> Option<GraphValue> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(GraphValue::DateTime(dt));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(GraphValue::LocalDateTime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> SqliteConnector {
        let connector = SqliteConnector::open("sqlite::memory:").unwrap();
        connector.ensure_schema().unwrap();
        connector
    }

    fn run(conn: &mut SqliteConnection, sql: &str, params: &Parameters) -> QueryResult {
        conn.begin(conn.mode()).unwrap();
        let result = conn.run(sql, params, None).unwrap();
        conn.commit().unwrap();
        result
    }

    #[test]
    fn test_endpoint_parsing() {
        assert!(matches!(
            SqliteTarget::parse("sqlite::memory:shared").unwrap(),
            SqliteTarget::Memory(name) if name == "shared"
        ));
        assert_eq!(
            SqliteTarget::parse("sqlite:///tmp/g.db").unwrap(),
            SqliteTarget::File(PathBuf::from("/tmp/g.db"))
        );
        let err = SqliteTarget::parse("bolt://localhost:7687").unwrap_err();
        assert!(matches!(err, GraphDbError::Configuration(_)));
    }

    #[test]
    fn test_connections_share_private_memory_store() {
        let connector = connector();
        let mut writer = connector.connect(AccessMode::Write).unwrap();
        let params = Parameters::from([
            ("labels".to_string(), ParamValue::from(vec!["Person"])),
            ("props".to_string(), ParamValue::from(serde_json::json!({"name": "Ada"}))),
        ]);
        let result = run(
            &mut writer,
            "INSERT INTO graph_nodes(labels, properties) VALUES ($labels, $props)",
            &params,
        );
        assert_eq!(result.rows_affected, Some(1));

        let mut reader = connector.connect(AccessMode::Read).unwrap();
        let result = run(
            &mut reader,
            "SELECT labels, properties FROM graph_nodes",
            &Parameters::new(),
        );
        assert_eq!(result.columns, vec!["labels", "properties"]);
        assert_eq!(
            result.rows[0][0],
            GraphValue::List(vec![GraphValue::from("Person")])
        );
        let GraphValue::Map(props) = &result.rows[0][1] else {
            panic!("expected map");
        };
        assert_eq!(props["name"], GraphValue::from("Ada"));
    }

    #[test]
    fn test_read_connection_rejects_writes() {
        let connector = connector();
        let mut reader = connector.connect(AccessMode::Read).unwrap();
        reader.begin(AccessMode::Read).unwrap();
        let err = reader
            .run(
                "INSERT INTO graph_nodes(labels, properties) VALUES ('[]', '{}')",
                &Parameters::new(),
                None,
            )
            .unwrap_err();
        assert_eq!(err.code, FailureCode::ReadOnly);
        reader.rollback().unwrap();
    }

    #[test]
    fn test_syntax_error_is_permanent() {
        let connector = connector();
        let mut conn = connector.connect(AccessMode::Write).unwrap();
        conn.begin(AccessMode::Write).unwrap();
        let err = conn.run("SELEC 1", &Parameters::new(), None).unwrap_err();
        assert_eq!(err.code, FailureCode::SyntaxError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_deadline_interrupts_long_query() {
        let connector = connector();
        let mut conn = connector.connect(AccessMode::Read).unwrap();
        conn.begin(AccessMode::Read).unwrap();
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                   SELECT count(*) FROM n";
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = conn.run(sql, &Parameters::new(), Some(deadline)).unwrap_err();
        assert_eq!(err.code, FailureCode::Interrupted);
        conn.rollback().unwrap();
        assert!(conn.ping().is_ok());
    }

    #[test]
    fn test_temporal_columns_decode() {
        let connector = connector();
        let mut conn = connector.connect(AccessMode::Write).unwrap();
        run(
            &mut conn,
            "CREATE TABLE events(day DATE, at DATETIME, flag BOOLEAN)",
            &Parameters::new(),
        );
        run(
            &mut conn,
            "INSERT INTO events VALUES ('2024-05-01', '2024-05-01T10:00:00+02:00', 1)",
            &Parameters::new(),
        );
        let result = run(&mut conn, "SELECT day, at, flag FROM events", &Parameters::new());
        assert!(matches!(result.rows[0][0], GraphValue::Date(_)));
        assert!(matches!(result.rows[0][1], GraphValue::DateTime(_)));
        assert_eq!(result.rows[0][2], GraphValue::Boolean(true));
    }
}

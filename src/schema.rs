use rusqlite::{Connection, OptionalExtension};

use crate::{backend::sqlite::classify, errors::GraphDbError};

pub const BASE_SCHEMA_VERSION: i64 = 1;

struct MigrationStep {
    target_version: i64,
    statements: &'static [&'static str],
}

const MIGRATION_STEPS: &[MigrationStep] = &[MigrationStep {
    target_version: 2,
    statements: &[
        "CREATE INDEX IF NOT EXISTS idx_rels_start_type ON graph_relationships(start_id, rel_type)",
        "CREATE INDEX IF NOT EXISTS idx_rels_end_type ON graph_relationships(end_id, rel_type)",
    ],
}];

pub const SCHEMA_VERSION: i64 = BASE_SCHEMA_VERSION + MIGRATION_STEPS.len() as i64;

fn schema_error(err: rusqlite::Error) -> GraphDbError {
    let mut failure = classify(&err);
    failure.message = format!("schema: {}", failure.message);
    GraphDbError::from_failure(failure)
}

pub fn ensure_schema(conn: &Connection) -> Result<(), GraphDbError> {
    ensure_base_schema(conn)?;
    ensure_meta(conn)?;
    migrate(conn)?;
    Ok(())
}

fn ensure_base_schema(conn: &Connection) -> Result<(), GraphDbError> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS graph_nodes (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            labels     JSON NOT NULL DEFAULT '[]',
            properties JSON NOT NULL DEFAULT '{}'
        );
        CREATE TABLE IF NOT EXISTS graph_relationships (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            rel_type   TEXT NOT NULL,
            start_id   INTEGER NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
            end_id     INTEGER NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
            properties JSON NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_rels_start ON graph_relationships(start_id);
        CREATE INDEX IF NOT EXISTS idx_rels_end ON graph_relationships(end_id);
        CREATE INDEX IF NOT EXISTS idx_rels_type ON graph_relationships(rel_type);
        CREATE TABLE IF NOT EXISTS graph_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL
        );
        "#,
    )
    .map_err(schema_error)
}

pub fn read_schema_version(conn: &Connection) -> Result<i64, GraphDbError> {
    conn.query_row(
        "SELECT schema_version FROM graph_meta WHERE id=1",
        [],
        |row| row.get(0),
    )
    .map_err(schema_error)
}

/// Applies every step newer than the stored version in one transaction and
/// returns the resulting version.
fn migrate(conn: &Connection) -> Result<i64, GraphDbError> {
    let current = read_schema_version(conn)?;
    let pending: Vec<&MigrationStep> = MIGRATION_STEPS
        .iter()
        .filter(|step| step.target_version > current)
        .collect();
    let Some(last) = pending.last() else {
        return Ok(current);
    };
    let target = last.target_version;
    let tx = conn.unchecked_transaction().map_err(schema_error)?;
    for sql in pending.iter().flat_map(|step| step.statements.iter()) {
        tx.execute(sql, []).map_err(schema_error)?;
    }
    tx.execute("UPDATE graph_meta SET schema_version=?1 WHERE id=1", [target])
        .map_err(schema_error)?;
    tx.commit().map_err(schema_error)?;
    Ok(target)
}

fn ensure_meta(conn: &Connection) -> Result<(), GraphDbError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM graph_meta WHERE id=1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(schema_error)?;
    match version {
        Some(existing) if existing > SCHEMA_VERSION => Err(GraphDbError::configuration(format!(
            "database schema version {existing} is newer than supported {SCHEMA_VERSION}"
        ))),
        Some(_) => Ok(()),
        None => conn
            .execute(
                "INSERT INTO graph_meta(id, schema_version) VALUES(1, ?1)",
                [BASE_SCHEMA_VERSION],
            )
            .map(|_| ())
            .map_err(schema_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_upgrades_base_store() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_base_schema(&conn).unwrap();
        ensure_meta(&conn).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), BASE_SCHEMA_VERSION);
        assert_eq!(migrate(&conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(migrate(&conn).unwrap(), SCHEMA_VERSION);
        let indexed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'idx_rels_%_type'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexed, 2);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute("UPDATE graph_meta SET schema_version=99 WHERE id=1", [])
            .unwrap();
        assert!(matches!(
            ensure_schema(&conn),
            Err(GraphDbError::Configuration(_))
        ));
    }
}

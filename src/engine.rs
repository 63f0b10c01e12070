//! The embedded engine behind the protocol layer. A root DuckDB
//! connection is opened once per process; workers derive their own
//! connections from it. All calls here are blocking and run on worker
//! threads.

use duckdb::types::Value;
use duckdb::{params, Connection};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::errors::Error;
use crate::scram::scram_sha256_hash;

/// Idempotent statements that project the engine catalogs into a
/// PostgreSQL-compatible shape for inspection tools.
const BOOTSTRAP_STATEMENTS: &[&str] = &[
    "create view if not exists pg_type as select type_oid as oid,case when logical_type like '%TIMESTAMP_%' then 'TIMESTAMP' when logical_type = 'DECIMAL' then 'NUMERIC' when logical_type='BOOLEAN' then 'bool' else logical_type end as typname from duckdb_types where oid is not null;",
    "create view if not exists pg_matviews as select '' as  matviewname , '' as schemaname limit 0;",
    "create view if not exists information_schema.constraint_column_usage as select '' constraint_name limit 0;",
    "create function if not exists array_positions(a,b) as 0;",
    "create function if not exists timezone() as 'utc';",
    "create function if not exists currentDatabase() as current_schema();",
    "create schema if not exists system;",
    "create view if not exists system.databases as
select schema_name as name
from information_schema.schemata
where catalog_name not in ('system', 'temp');",
    "create view if not exists system.tables as
select table_name    as name,
       table_schema  as database,
       'uuid'        as uuid,
       'duckdb'      as engine,
       0             as is_temporary,
       table_comment as comment
from information_schema.tables
where table_type = 'BASE TABLE';",
    "create view if not exists system.columns as
select table_schema   as database,
       table_name     as table,
       column_name    as name,
       data_type      as type,
       column_comment as comment,
       data_type         default_kind,
       column_default as default_expression
from information_schema.columns;",
    "create view if not exists system.functions as
select proname as name, prokind = 'a' as is_aggregate
from pg_proc;",
];

const CREDENTIALS_STATEMENTS: &[&str] = &[
    "create schema if not exists duckserver;",
    "create table if not exists duckserver.users (username text primary key, password text);",
];

pub struct EngineOptions {
    pub db_path: String,
    pub hack: bool,
    pub auth: bool,
}

pub struct Engine {
    root: Mutex<Connection>,
    pub auth_enabled: bool,
}

impl Engine {
    pub fn open(options: &EngineOptions) -> Result<Engine, Error> {
        let conn = if options.db_path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&options.db_path)
        }
        .map_err(|err| Error::BadConfig(format!("cannot open database: {err}")))?;
        Self::bootstrap(conn, options.hack, options.auth)
    }

    #[cfg(test)]
    pub fn in_memory(auth: bool) -> Result<Engine, Error> {
        let conn = Connection::open_in_memory()
            .map_err(|err| Error::BadConfig(format!("cannot open database: {err}")))?;
        Self::bootstrap(conn, true, auth)
    }

    fn bootstrap(conn: Connection, hack: bool, auth: bool) -> Result<Engine, Error> {
        if hack {
            for statement in BOOTSTRAP_STATEMENTS {
                conn.execute_batch(statement).map_err(|err| {
                    Error::BadConfig(format!("bootstrap statement failed: {err}"))
                })?;
            }
        }
        if auth {
            for statement in CREDENTIALS_STATEMENTS {
                conn.execute_batch(statement).map_err(|err| {
                    Error::BadConfig(format!("credentials bootstrap failed: {err}"))
                })?;
            }
        }
        Ok(Engine {
            root: Mutex::new(conn),
            auth_enabled: auth,
        })
    }

    /// A fresh connection to the same database, exclusively owned by the
    /// calling worker.
    pub fn connect(&self) -> Result<Connection, Error> {
        Ok(self.root.lock().try_clone()?)
    }

    /// Hashes the password into the stored SCRAM form and inserts the
    /// credential record.
    pub fn create_user(&self, user: &str, password: &str) -> Result<(), Error> {
        let hashed = scram_sha256_hash(password);
        self.root.lock().execute(
            "insert into duckserver.users (username, password) values (?, ?)",
            params![user, hashed],
        )?;
        Ok(())
    }

    pub fn get_password(&self, user: &str) -> Result<String, Error> {
        let conn = self.root.lock();
        let password = conn.query_row(
            "select password from duckserver.users where username = ?",
            params![user],
            |row| row.get::<_, String>(0),
        )?;
        Ok(password)
    }
}

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\d+").unwrap());

/// Infers the output schema of a statement by running `DESCRIBE` with all
/// `$N` placeholders replaced by `null`. Returns (column name, engine
/// type) pairs.
pub fn describe_output(conn: &Connection, sql: &str) -> Result<Vec<(String, String)>, Error> {
    let probed = PLACEHOLDER_RE.replace_all(sql, "null");
    let mut stmt = conn.prepare(&format!("describe {probed}"))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
    }
    Ok(columns)
}

/// Engine type names of a table's columns, in declaration order.
pub fn table_column_types(conn: &Connection, schema: &str, table: &str) -> Result<Vec<String>, Error> {
    let mut stmt = conn.prepare(
        "select data_type from information_schema.columns where table_schema = ? and table_name = ? order by ordinal_position",
    )?;
    let mut rows = stmt.query(params![schema, table])?;
    let mut types = Vec::new();
    while let Some(row) = rows.next()? {
        types.push(row.get::<_, String>(0)?);
    }
    Ok(types)
}

/// Materializes one engine row as owned values.
pub fn row_values(row: &duckdb::Row, column_count: usize) -> Result<Vec<Value>, Error> {
    (0..column_count)
        .map(|i| row.get::<usize, Value>(i).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_projects_catalogs() {
        let engine = Engine::in_memory(false).unwrap();
        let conn = engine.connect().unwrap();
        let count: i64 = conn
            .query_row("select count(*) from pg_type", [], |row| row.get(0))
            .unwrap();
        assert!(count > 0);
        conn.query_row("select count(*) from system.tables", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap();
    }

    #[test]
    fn credentials_round_trip() {
        let engine = Engine::in_memory(true).unwrap();
        engine.create_user("alice", "secret").unwrap();
        let stored = engine.get_password("alice").unwrap();
        assert!(stored.starts_with("SCRAM-SHA-256$4096:"));
        assert!(engine.get_password("nobody").is_err());
        // Duplicate users violate the primary key.
        assert!(engine.create_user("alice", "other").is_err());
    }

    #[test]
    fn describe_output_replaces_placeholders() {
        let engine = Engine::in_memory(false).unwrap();
        let conn = engine.connect().unwrap();
        let columns = describe_output(&conn, "select 1 as a, 'x' as b where 1 = $1").unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].0, "a");
        assert_eq!(columns[0].1, "INTEGER");
        assert_eq!(columns[1].1, "VARCHAR");
    }

    #[test]
    fn table_columns_in_order() {
        let engine = Engine::in_memory(false).unwrap();
        let conn = engine.connect().unwrap();
        conn.execute_batch("create table t (a integer, b varchar, c double)")
            .unwrap();
        let types = table_column_types(&conn, "main", "t").unwrap();
        assert_eq!(types, vec!["INTEGER", "VARCHAR", "DOUBLE"]);
    }
}

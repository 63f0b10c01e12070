//! Handles clients by pretending to be a PostgreSQL server. One
//! connection state machine per accepted TCP connection; downstream SQL
//! goes verbatim (with narrow rewrites) to the embedded engine.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::engine::general_purpose;
use base64::Engine as _;
use duckdb::types::Value;
use duckdb::{params_from_iter, Connection};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::engine::{self, Engine};
use crate::errors::Error;
use crate::messages::*;
use crate::pg::copy;
use crate::pg::server::{CancelHandle, CancelKey, CancelMap, CancelToken};
use crate::scram;
use crate::types::{bind_values, parse_text_param, to_pg_text};

/// Above this many declared inputs the engine prepared statement is
/// bypassed: placeholders are substituted textually and the statement is
/// prepared afresh, amortizing the per-parameter driver overhead.
const MAX_INPUT_ARGS_USE_PREPARED: usize = 20;

/// Parameters advertised to every client after authentication.
const STARTUP_PARAMETERS: &[(&str, &str)] = &[
    ("client_encoding", "UTF8"),
    ("server_version", crate::SERVER_VERSION),
    ("standard_conforming_strings", "on"),
];

static CREATE_USER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*create\s+user\s+(\w+)\s+with\s+password\s+'(.*)'\s*;?\s*$").unwrap()
});
static DISCARD_ALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*discard\s+all\s*;?\s*$").unwrap());
static COPY_IN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)COPY\s+.*\s+FROM\s+STDIN").unwrap());

/// A named prepared statement. The engine statement itself is re-prepared
/// at execution time; what persists is the SQL, the declared input count
/// and the lazily inferred output schema.
pub(crate) struct PreparedStatement {
    pub(crate) sql: String,
    pub(crate) engine_backed: bool,
    pub(crate) num_input: usize,
    pub(crate) columns: Option<Vec<(String, String)>>,
}

/// A portal references its statement by name so DISCARD ALL invalidates
/// both without dangling references.
pub(crate) struct Portal {
    pub(crate) statement: String,
    pub(crate) values: Vec<Value>,
}

pub struct PgConnection<S: Read + Write> {
    pub(crate) wire: Wire<S>,
    pub(crate) engine: Arc<Engine>,
    pub(crate) conn: Connection,
    pub(crate) statements: HashMap<String, PreparedStatement>,
    pub(crate) portals: HashMap<String, Portal>,
    pub(crate) cancel: CancelHandle,
    pub(crate) in_error: bool,
}

/// Entry point for an accepted TCP connection.
pub fn handle(stream: TcpStream, engine: Arc<Engine>, cancel_map: CancelMap) -> Result<(), Error> {
    serve(stream, engine, cancel_map)
}

/// Runs a full session over any duplex byte stream.
pub fn serve<S: Read + Write>(
    stream: S,
    engine: Arc<Engine>,
    cancel_map: CancelMap,
) -> Result<(), Error> {
    let mut wire = Wire::new(stream);
    match wire.read_first_message()? {
        FirstMessage::CancelRequest(key) => {
            let handle = cancel_map.lock().get(&key).cloned();
            if let Some(handle) = handle {
                handle.trip();
            }
            Ok(())
        }
        FirstMessage::Startup(parameters) => {
            debug!("receive startup: {parameters:?}");
            let key: CancelKey = rand::rng().random();
            let cancel = CancelHandle::default();
            cancel_map.lock().insert(key, cancel.clone());
            let result = run_session(wire, parameters, key, cancel, engine);
            cancel_map.lock().remove(&key);
            result
        }
    }
}

fn run_session<S: Read + Write>(
    wire: Wire<S>,
    parameters: HashMap<String, String>,
    key: CancelKey,
    cancel: CancelHandle,
    engine: Arc<Engine>,
) -> Result<(), Error> {
    let conn = engine.connect()?;
    let mut connection = PgConnection {
        wire,
        engine,
        conn,
        statements: HashMap::new(),
        portals: HashMap::new(),
        cancel,
        in_error: false,
    };
    let user = parameters.get("user").cloned().unwrap_or_default();
    connection.authenticate(&user)?;
    connection.wire.send(TAG_BACKEND_KEY_DATA, &key);
    for &(name, value) in STARTUP_PARAMETERS {
        connection
            .wire
            .send(TAG_PARAMETER_STATUS, &parameter_status(name, value));
    }
    connection.run()
}

impl<S: Read + Write> PgConnection<S> {
    fn run(&mut self) -> Result<(), Error> {
        let mut need_ready = true;
        loop {
            if need_ready {
                self.wire
                    .send(TAG_READY_FOR_QUERY, &ready_for_query(TRANSACTION_STATUS_IDLE));
            }
            let frame = self.wire.read_frame()?;
            match frame.tag {
                TAG_QUERY => {
                    let body = self.wire.read_body()?;
                    let query = QueryMessage::parse(&body)?;
                    self.simple_query(&query.sql)?;
                    need_ready = true;
                    self.in_error = false;
                }
                TAG_TERMINATE => return Ok(()),
                TAG_SYNC => {
                    need_ready = true;
                    self.in_error = false;
                }
                TAG_PARSE => {
                    need_ready = false;
                    if self.in_error {
                        continue;
                    }
                    let body = self.wire.read_body()?;
                    let parse = ParseMessage::parse(&body)?;
                    self.handle_parse(parse)?;
                }
                TAG_DESCRIBE => {
                    need_ready = false;
                    if self.in_error {
                        continue;
                    }
                    let body = self.wire.read_body()?;
                    let describe = DescribeMessage::parse(&body)?;
                    self.handle_describe(describe)?;
                }
                TAG_BIND => {
                    need_ready = false;
                    if self.in_error {
                        continue;
                    }
                    let body = self.wire.read_body()?;
                    let bind = BindMessage::parse(&body)?;
                    self.handle_bind(bind)?;
                }
                TAG_EXECUTE => {
                    need_ready = false;
                    if self.in_error {
                        continue;
                    }
                    let body = self.wire.read_body()?;
                    let execute = ExecuteMessage::parse(&body)?;
                    self.handle_execute(execute)?;
                }
                other => {
                    need_ready = false;
                    info!("unsupported message type: {}", other as char);
                }
            }
        }
    }

    // Authentication: SCRAM-SHA-256 against the credentials table, or
    // AuthenticationOk straight away when auth is disabled.
    fn authenticate(&mut self, user: &str) -> Result<(), Error> {
        if !self.engine.auth_enabled {
            self.wire.send_auth_ok();
            return Ok(());
        }
        self.wire
            .send(TAG_AUTHENTICATION, &auth_sasl(&[scram::SCRAM_SHA_256]));
        self.wire.expect_frame(TAG_PASSWORD)?;
        let body = self.wire.read_body()?;
        let initial = SaslInitialResponse::parse(&body)?;
        if initial.mechanism != scram::SCRAM_SHA_256 {
            error!("invalid mechanism: {}", initial.mechanism);
            return Err(Error::AuthError(format!(
                "invalid mechanism: {}",
                initial.mechanism
            )));
        }
        let client_nonce = scram::client_nonce(&initial.data)?;

        let secret = match self.engine.get_password(user) {
            Ok(stored) => match scram::parse_server_secret(&stored) {
                Ok(secret) => secret,
                Err(err) => {
                    warn!("invalid password format for {user}: {err}");
                    return self.auth_failed(user);
                }
            },
            Err(_) => return self.auth_failed(user),
        };

        let (combined_nonce, server_first) =
            scram::server_first_message(&client_nonce, &secret.salt_base64, secret.iterations);
        self.wire
            .send(TAG_AUTHENTICATION, &auth_sasl_continue(&server_first));

        self.wire.expect_frame(TAG_PASSWORD)?;
        let body = self.wire.read_body()?;
        let response = SaslResponse::parse(&body)?;
        let attributes = scram::parse_sasl_attributes(&response.data);
        let proof = attributes
            .get("p")
            .and_then(|p| general_purpose::STANDARD.decode(p).ok());
        let Some(proof) = proof else {
            return self.auth_failed(user);
        };

        let auth_message = scram::auth_message(&client_nonce, &server_first, &combined_nonce);
        if !scram::verify_client_proof(&secret.stored_key, &auth_message, &proof) {
            return self.auth_failed(user);
        }
        self.wire.send(
            TAG_AUTHENTICATION,
            &auth_sasl_final(&scram::server_final_message(&secret.server_key, &auth_message)),
        );
        self.wire.send_auth_ok();
        Ok(())
    }

    /// The failure message never reveals whether the user exists.
    fn auth_failed(&mut self, user: &str) -> Result<(), Error> {
        self.send_error_response(&format!(
            "password authentication failed for user {user}"
        ))?;
        self.wire.flush()?;
        Err(Error::AuthError(user.to_string()))
    }

    fn simple_query(&mut self, sql: &str) -> Result<(), Error> {
        debug!("simple query: {sql}");
        if sql.trim().is_empty() {
            self.wire.send(TAG_EMPTY_QUERY_RESPONSE, &[]);
            return Ok(());
        }
        if DISCARD_ALL_RE.is_match(sql) {
            return self.discard_all();
        }
        if self.engine.auth_enabled {
            if let Some(caps) = CREATE_USER_RE.captures(sql) {
                let (user, password) = (caps[1].to_string(), caps[2].to_string());
                return match self.engine.create_user(&user, &password) {
                    Ok(()) => {
                        self.wire
                            .send(TAG_COMMAND_COMPLETE, &command_complete("CREATE USER"));
                        Ok(())
                    }
                    Err(err) => self.send_error_response(&err.to_string()),
                };
            }
        }
        if COPY_IN_RE.is_match(sql) {
            return copy::copy_in(self, sql);
        }
        let sql = if "show transaction_read_only".starts_with(sql) {
            "select 0"
        } else {
            sql
        };

        let token = self.cancel.arm();
        let Self {
            conn,
            wire,
            in_error,
            ..
        } = self;
        let result = match conn.prepare(sql) {
            Err(err) => {
                let message = err.to_string();
                if message.contains("No statement to prepare") {
                    wire.send(TAG_EMPTY_QUERY_RESPONSE, &[]);
                    Ok(())
                } else {
                    Self::send_error(wire, in_error, &message)
                }
            }
            Ok(stmt) => Self::stream_rows(stmt, conn, wire, in_error, &[], true, sql, &token),
        };
        self.cancel.disarm();
        result
    }

    fn discard_all(&mut self) -> Result<(), Error> {
        self.portals.clear();
        self.statements.clear();
        self.wire
            .send(TAG_COMMAND_COMPLETE, &command_complete("DISCARD ALL"));
        Ok(())
    }

    fn handle_parse(&mut self, parse: ParseMessage) -> Result<(), Error> {
        let ParseMessage { name, sql, .. } = parse;
        if sql.is_empty() {
            self.statements.insert(
                name,
                PreparedStatement {
                    sql,
                    engine_backed: false,
                    num_input: 0,
                    columns: None,
                },
            );
            self.wire.send(TAG_PARSE_COMPLETE, &[]);
            return Ok(());
        }
        let sql = if "show transaction_read_only".starts_with(sql.as_str()) {
            "select 0".to_string()
        } else if sql.starts_with("SET extra_float_digits") || sql.starts_with("SET application_name")
        {
            // JDBC drivers issue these immediately after connecting.
            "select 1 limit 0".to_string()
        } else {
            sql
        };
        debug!("prepare {name}: {sql}");
        if !name.is_empty() && self.statements.contains_key(&name) {
            return self.send_error_response(&format!("prepared statement {name} already exists"));
        }
        let num_input = {
            let Self {
                conn,
                wire,
                in_error,
                ..
            } = self;
            match conn.prepare(&sql) {
                Ok(stmt) => stmt.parameter_count(),
                Err(err) => return Self::send_error(wire, in_error, &err.to_string()),
            }
        };
        self.statements.insert(
            name,
            PreparedStatement {
                sql,
                engine_backed: true,
                num_input,
                columns: None,
            },
        );
        self.wire.send(TAG_PARSE_COMPLETE, &[]);
        Ok(())
    }

    fn handle_describe(&mut self, describe: DescribeMessage) -> Result<(), Error> {
        let statement_name = match describe.target {
            b'S' => Some(describe.name.clone()),
            b'P' => self.portals.get(&describe.name).map(|p| p.statement.clone()),
            other => {
                return self.send_error_response(&format!(
                    "unsupported describe type: {}",
                    other as char
                ))
            }
        };
        let statement = statement_name
            .as_ref()
            .and_then(|name| self.statements.get(name));
        let Some(statement) = statement else {
            return self.send_error_response(&format!(
                "prepared statement {} not found",
                describe.name
            ));
        };

        let engine_backed = statement.engine_backed;
        let num_input = statement.num_input;
        let sql = statement.sql.clone();
        let cached = statement.columns.clone();

        if !engine_backed {
            self.wire.send(TAG_NO_DATA, &[]);
            return Ok(());
        }
        if num_input > 0 {
            self.wire
                .send(TAG_PARAMETER_DESCRIPTION, &parameter_description(num_input));
        }
        let columns = match cached {
            Some(columns) => columns,
            None => {
                let inferred = engine::describe_output(&self.conn, &sql).unwrap_or_default();
                if let Some(entry) = self
                    .statements
                    .get_mut(statement_name.as_deref().unwrap_or_default())
                {
                    entry.columns = Some(inferred.clone());
                }
                inferred
            }
        };
        // Misreporting a column type is worse than dropping the
        // connection, so an unmapped engine type is fatal here.
        let body = row_description_from_columns(&columns)?;
        self.wire.send(TAG_ROW_DESCRIPTION, &body);
        Ok(())
    }

    fn handle_bind(&mut self, bind: BindMessage) -> Result<(), Error> {
        if !self.statements.contains_key(&bind.statement) {
            return self
                .send_error_response(&format!("prepared statement {} not found", bind.statement));
        }
        let values = bind.params.into_iter().map(parse_text_param).collect();
        self.portals.insert(
            bind.portal,
            Portal {
                statement: bind.statement,
                values,
            },
        );
        self.wire.send(TAG_BIND_COMPLETE, &[]);
        Ok(())
    }

    fn handle_execute(&mut self, execute: ExecuteMessage) -> Result<(), Error> {
        let Some(portal) = self.portals.get(&execute.portal) else {
            return self.send_error_response(&format!("portal {} not found", execute.portal));
        };
        let statement_name = portal.statement.clone();
        let values = portal.values.clone();
        let Some(statement) = self.statements.get(&statement_name) else {
            return self
                .send_error_response(&format!("prepared statement {statement_name} not found"));
        };
        if !statement.engine_backed {
            self.wire.send(TAG_EMPTY_QUERY_RESPONSE, &[]);
            return Ok(());
        }
        let sql = statement.sql.clone();
        let num_input = statement.num_input;

        let token = self.cancel.arm();
        let Self {
            conn,
            wire,
            in_error,
            ..
        } = self;
        let result = if num_input > MAX_INPUT_ARGS_USE_PREPARED {
            let substituted = bind_values(&sql, &values);
            Self::run_statement(conn, wire, in_error, &substituted, &[], false, &sql, &token)
        } else {
            Self::run_statement(conn, wire, in_error, &sql, &values, false, &sql, &token)
        };
        self.cancel.disarm();
        result
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run_statement(
        conn: &Connection,
        wire: &mut Wire<S>,
        in_error: &mut bool,
        sql: &str,
        args: &[Value],
        send_row_desc: bool,
        describe_sql: &str,
        token: &CancelToken,
    ) -> Result<(), Error> {
        let stmt = match conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(err) => return Self::send_error(wire, in_error, &err.to_string()),
        };
        Self::stream_rows(stmt, conn, wire, in_error, args, send_row_desc, describe_sql, token)
    }

    /// Streams all rows of a statement: optional RowDescription (from the
    /// first row's values, or inferred when the result is empty), one
    /// DataRow per row, then the terminal CommandComplete.
    #[allow(clippy::too_many_arguments)]
    fn stream_rows(
        mut stmt: duckdb::Statement,
        conn: &Connection,
        wire: &mut Wire<S>,
        in_error: &mut bool,
        args: &[Value],
        send_row_desc: bool,
        describe_sql: &str,
        token: &CancelToken,
    ) -> Result<(), Error> {
        let mut rows = match stmt.query(params_from_iter(args.iter())) {
            Ok(rows) => rows,
            Err(err) => return Self::send_error(wire, in_error, &err.to_string()),
        };
        let names: Vec<String> = rows
            .as_ref()
            .map(|s| s.column_names().into_iter().map(Into::into).collect())
            .unwrap_or_default();

        let mut row_count: u64 = 0;
        loop {
            if token.load(Ordering::Relaxed) {
                return Self::send_error(wire, in_error, &Error::Canceled.to_string());
            }
            match rows.next() {
                Ok(Some(row)) => {
                    let values = match engine::row_values(row, names.len()) {
                        Ok(values) => values,
                        Err(err) => return Self::send_error(wire, in_error, &err.to_string()),
                    };
                    let rendered = match values.iter().map(to_pg_text).collect::<Result<Vec<_>, _>>()
                    {
                        Ok(rendered) => rendered,
                        Err(err) => return Self::send_error(wire, in_error, &err.to_string()),
                    };
                    if row_count == 0 && send_row_desc {
                        wire.send(
                            TAG_ROW_DESCRIPTION,
                            &row_description_from_values(&names, &rendered),
                        );
                    }
                    wire.send(TAG_DATA_ROW, &data_row(&rendered));
                    row_count += 1;
                }
                Ok(None) => break,
                Err(err) => return Self::send_error(wire, in_error, &err.to_string()),
            }
        }

        if row_count == 0 && send_row_desc {
            // The schema of an empty result cannot come from its rows;
            // ask the engine instead.
            match engine::describe_output(conn, describe_sql) {
                Ok(columns) => {
                    let body = row_description_from_columns(&columns)?;
                    wire.send(TAG_ROW_DESCRIPTION, &body);
                }
                Err(err) => return Self::send_error(wire, in_error, &err.to_string()),
            }
        }
        wire.send(
            TAG_COMMAND_COMPLETE,
            &command_complete(&format!("({row_count} row)")),
        );
        Ok(())
    }

    pub(crate) fn send_error(
        wire: &mut Wire<S>,
        in_error: &mut bool,
        message: &str,
    ) -> Result<(), Error> {
        error!("send error response: {message}");
        *in_error = true;
        wire.send(TAG_ERROR_RESPONSE, &error_response(message));
        Ok(())
    }

    pub(crate) fn send_error_response(&mut self, message: &str) -> Result<(), Error> {
        let Self { wire, in_error, .. } = self;
        Self::send_error(wire, in_error, message)
    }
}

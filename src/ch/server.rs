//! One HTTP handler serving `/`. Request bodies are classified into
//! SELECT, INSERT-with-format or generic execute; results stream through
//! the format codecs while the engine work runs on blocking workers.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use bytes::{Buf, BytesMut};
use duckdb::params_from_iter;
use duckdb::types::Value;
use log::{debug, error};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::ch::formats::{self, DEFAULT_FORMAT};
use crate::engine::{self, Engine};
use crate::errors::Error;

static SELECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*SELECT.*$").unwrap());
static SELECT_FORMAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*SELECT.* format (\S*?)[\s;]*$").unwrap());
static FORMAT_CLEAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(SELECT.* )(format \S*?)[\s;]*$").unwrap());
static LIMIT_REWRITE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)LIMIT\s+(\d+)\s*,\s*(\d+)").unwrap());
static INSERT_FORMAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*INSERT\s+INTO(.*?)format\s+(\S+)[\s;]*$").unwrap());
static INSERT_VALUES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*INSERT\s+INTO.*VALUES.*[\s;]*$").unwrap());
static INSERT_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*INSERT$").unwrap());
static TABLE_EXPR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+\.|)(\w+)(\([\w,]+\)|)$").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Clone)]
struct ChState {
    engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", any(handle))
        .with_state(ChState { engine })
}

#[derive(Deserialize, Default)]
struct UrlParams {
    #[serde(default)]
    query: String,
}

async fn handle(
    State(state): State<ChState>,
    method: Method,
    Query(params): Query<UrlParams>,
    body: Body,
) -> Response {
    if method == Method::GET {
        let data = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(data) => data,
            Err(err) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        let mut query = params.query;
        query.push(' ');
        query.push_str(&String::from_utf8_lossy(&data));
        select_query(&state, query).await
    } else if method == Method::POST {
        dispatch_post(state, params.query, body).await
    } else {
        text_response(StatusCode::BAD_REQUEST, "Invalid query".to_string())
    }
}

/// How a fully or partially read request body should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Select,
    InsertWithFormat,
    Execute,
    NeedMore,
}

fn classify(probe: &str) -> Route {
    if SELECT_RE.is_match(probe) {
        return Route::Select;
    }
    if INSERT_FORMAT_RE.is_match(probe) {
        return Route::InsertWithFormat;
    }
    if !probe.is_empty()
        && (!INSERT_PREFIX_RE.is_match(probe) || INSERT_VALUES_RE.is_match(probe))
    {
        return Route::Execute;
    }
    Route::NeedMore
}

async fn dispatch_post(state: ChState, url_query: String, body: Body) -> Response {
    let mut probe = url_query;
    if !probe.is_empty() {
        probe.push('\n');
    }
    let mut pending = BytesMut::new();
    let mut stream = body.into_data_stream();

    loop {
        match classify(&probe) {
            Route::Select => {
                if let Some(rest) = read_rest(&mut pending, &mut stream).await {
                    probe.push_str(&rest);
                }
                return select_query(&state, probe).await;
            }
            Route::InsertWithFormat => {
                return insert_with_format(&state, probe, pending, stream).await;
            }
            Route::Execute => {
                if let Some(rest) = read_rest(&mut pending, &mut stream).await {
                    probe.push_str(&rest);
                }
                return execute_query(&state, probe).await;
            }
            Route::NeedMore => match next_line(&mut pending, &mut stream).await {
                Some(line) => probe.push_str(&line.replace('\n', " ")),
                None => break,
            },
        }
    }

    if SELECT_RE.is_match(&probe) {
        return select_query(&state, probe).await;
    }
    if !INSERT_PREFIX_RE.is_match(&probe) || INSERT_VALUES_RE.is_match(&probe) {
        return execute_query(&state, probe).await;
    }
    text_response(StatusCode::OK, String::new())
}

/// Pulls the next line (including its newline) from the buffered body;
/// at end of input any unterminated remainder is the final line.
async fn next_line(
    pending: &mut BytesMut,
    stream: &mut axum::body::BodyDataStream,
) -> Option<String> {
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line = pending.split_to(pos + 1);
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
        match stream.next().await {
            Some(Ok(chunk)) => pending.extend_from_slice(&chunk),
            Some(Err(_)) | None => {
                if pending.is_empty() {
                    return None;
                }
                let line = pending.split();
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }
}

async fn read_rest(
    pending: &mut BytesMut,
    stream: &mut axum::body::BodyDataStream,
) -> Option<String> {
    while let Some(Ok(chunk)) = stream.next().await {
        pending.extend_from_slice(&chunk);
    }
    if pending.is_empty() {
        return None;
    }
    let rest = pending.split();
    Some(String::from_utf8_lossy(&rest).into_owned())
}

/// Applies the SELECT rewrites and splits off the trailing FORMAT
/// clause. Returns the rewritten query and the format name.
fn rewrite_select(query: &str) -> (String, String) {
    let mut query = query.trim().to_string();
    query = query.replacen("select table", "select \"table\"", 1);
    query = query.replace('\n', " ");
    query = LIMIT_REWRITE_RE
        .replace_all(&query, "LIMIT $2 OFFSET $1")
        .into_owned();
    let mut format = DEFAULT_FORMAT.to_string();
    if let Some(caps) = SELECT_FORMAT_RE.captures(&query) {
        format = caps[1].to_string();
        query = FORMAT_CLEAN_RE.replace(&query, "$1").into_owned();
    }
    (query, format)
}

async fn select_query(state: &ChState, raw_query: String) -> Response {
    let (query, format) = rewrite_select(&raw_query);
    debug!("Executing ch query: {query}");
    if !SELECT_RE.is_match(&query) {
        return text_response(StatusCode::BAD_REQUEST, "Invalid query".to_string());
    }
    let Some(content_type) = formats::content_type(&format) else {
        return text_response(StatusCode::BAD_REQUEST, format!("Unknown format {format}"));
    };

    let (row_tx, row_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
    let engine = state.engine.clone();
    let format_name = format.clone();
    tokio::task::spawn_blocking(move || run_select(engine, query, format_name, ready_tx, row_tx));

    match ready_rx.await {
        Ok(Ok(())) => Response::builder()
            .status(StatusCode::OK)
            .header("x-clickhouse-format", &format)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from_stream(ReceiverStream::new(row_rx)))
            .unwrap(),
        Ok(Err(message)) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error executing query: {message}"),
        ),
        Err(_) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Error executing query".to_string(),
        ),
    }
}

/// io::Write bridging the blocking format writer into the response body
/// stream.
struct ChannelWriter {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| std::io::Error::other("client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_select(
    engine: Arc<Engine>,
    query: String,
    format: String,
    ready_tx: oneshot::Sender<Result<(), String>>,
    row_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let conn = match engine.connect() {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready_tx.send(Err(err.to_string()));
            return;
        }
    };
    let columns = match engine::describe_output(&conn, &query) {
        Ok(columns) => columns,
        Err(err) => {
            let _ = ready_tx.send(Err(err.to_string()));
            return;
        }
    };
    let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
    let types: Vec<String> = columns.iter().map(|(_, t)| t.clone()).collect();

    let mut stmt = match conn.prepare(&query) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = ready_tx.send(Err(err.to_string()));
            return;
        }
    };
    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(err) => {
            let _ = ready_tx.send(Err(err.to_string()));
            return;
        }
    };

    let mut writer = match formats::new_output_writer(
        &format,
        &names,
        &types,
        Box::new(ChannelWriter { tx: row_tx }),
    ) {
        Ok(Some(writer)) => writer,
        // The format was validated before the worker started.
        Ok(None) | Err(_) => {
            let _ = ready_tx.send(Err(format!("Unknown format {format}")));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));
    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let values = match engine::row_values(row, names.len()) {
                    Ok(values) => values,
                    Err(err) => {
                        error!("Error scanning row: {err}");
                        return;
                    }
                };
                if writer.write_row(&values).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                error!("Error reading rows: {err}");
                return;
            }
        }
    }
    let _ = writer.finish();
}

async fn execute_query(state: &ChState, query: String) -> Response {
    let engine = state.engine.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let conn = engine.connect()?;
        conn.execute_batch(&query)?;
        Ok(())
    })
    .await;
    match result {
        Ok(Ok(())) => text_response(StatusCode::OK, String::new()),
        Ok(Err(err)) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error executing query: {err}"),
        ),
        Err(err) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error executing query: {err}"),
        ),
    }
}

/// `[schema.]table[(col1,col2,...)]`; the schema defaults to `main`.
fn parse_table_and_columns(expr: &str) -> Option<(String, String, Vec<String>)> {
    let stripped = WHITESPACE_RE.replace_all(expr, "").into_owned();
    let caps = TABLE_EXPR_RE.captures(&stripped)?;
    let schema = caps[1].trim_end_matches('.');
    let schema = if schema.is_empty() { "main" } else { schema };
    let table = caps[2].to_string();
    let columns = caps[3].to_string();
    let columns = if columns.is_empty() {
        Vec::new()
    } else {
        columns[1..columns.len() - 1]
            .split(',')
            .map(str::to_string)
            .collect()
    };
    Some((schema.to_string(), table, columns))
}

async fn insert_with_format(
    state: &ChState,
    probe: String,
    pending: BytesMut,
    mut stream: axum::body::BodyDataStream,
) -> Response {
    let Some(caps) = INSERT_FORMAT_RE.captures(&probe) else {
        return text_response(StatusCode::BAD_REQUEST, "Invalid query".to_string());
    };
    let table_expr = caps[1].to_string();
    let format = caps[2].to_string();
    if !formats::is_input_format(&format) {
        return text_response(StatusCode::BAD_REQUEST, format!("Unknown format {format}"));
    }
    let Some((schema, table, columns)) = parse_table_and_columns(&table_expr) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid table expression: {table_expr}"),
        );
    };

    // Resolve the table shape before touching the body.
    let engine = state.engine.clone();
    let probe_schema = schema.clone();
    let probe_table = table.clone();
    let described = tokio::task::spawn_blocking(move || -> Result<Vec<(String, String)>, Error> {
        let conn = engine.connect()?;
        engine::describe_output(
            &conn,
            &format!("SELECT * FROM {probe_schema}.{probe_table} LIMIT 0"),
        )
    })
    .await;
    let table_columns = match described {
        Ok(Ok(columns)) => columns,
        Ok(Err(err)) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error getting table description: {err}"),
            )
        }
        Err(err) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error getting table description: {err}"),
            )
        }
    };
    let (names, types) = if columns.is_empty() {
        (
            table_columns.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
            table_columns.iter().map(|(_, t)| t.clone()).collect::<Vec<_>>(),
        )
    } else {
        let mut names = Vec::with_capacity(columns.len());
        let mut types = Vec::with_capacity(columns.len());
        for column in &columns {
            match table_columns.iter().find(|(name, _)| name == column) {
                Some((name, engine_type)) => {
                    names.push(name.clone());
                    types.push(engine_type.clone());
                }
                None => {
                    return text_response(
                        StatusCode::BAD_REQUEST,
                        format!("Column {column} not found in table"),
                    )
                }
            }
        }
        (names, types)
    };

    let cancelled = Arc::new(AtomicBool::new(false));
    let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(16);
    let engine = state.engine.clone();
    let worker_cancelled = cancelled.clone();
    let worker = tokio::task::spawn_blocking(move || {
        run_insert(
            engine,
            schema,
            table,
            names,
            types,
            format,
            chunk_rx,
            worker_cancelled,
        )
    });

    // Pump the remaining body into the decoder. A send failure means the
    // worker already stopped; its error is collected below.
    let mut pump_ok = true;
    if !pending.is_empty() {
        pump_ok = chunk_tx.send(pending.freeze()).await.is_ok();
    }
    while pump_ok {
        match stream.next().await {
            Some(Ok(chunk)) => {
                if chunk_tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Some(Err(_)) => {
                // A broken request body aborts the ingest.
                cancelled.store(true, Ordering::SeqCst);
                break;
            }
            None => break,
        }
    }
    drop(chunk_tx);

    match worker.await {
        Ok(Ok(_)) => text_response(StatusCode::OK, String::new()),
        Ok(Err(Error::Canceled)) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Request cancelled".to_string(),
        ),
        Ok(Err(err)) => text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        Err(err) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error reading values: {err}"),
        ),
    }
}

/// io::Read over the body chunks forwarded from the async side. A tripped
/// cancel flag surfaces as a read error at the next pull.
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    cancelled: Arc<AtomicBool>,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("Request cancelled"));
            }
            match self.rx.blocking_recv() {
                Some(bytes) => self.current = bytes,
                None => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return Err(std::io::Error::other("Request cancelled"));
                    }
                    return Ok(0);
                }
            }
        }
        let n = out.len().min(self.current.len());
        out[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

#[allow(clippy::too_many_arguments)]
fn run_insert(
    engine: Arc<Engine>,
    schema: String,
    table: String,
    names: Vec<String>,
    types: Vec<String>,
    format: String,
    chunk_rx: mpsc::Receiver<Bytes>,
    cancelled: Arc<AtomicBool>,
) -> Result<u64, Error> {
    let conn = engine.connect()?;
    let mut appender = conn
        .appender_to_db(&table, &schema)
        .map_err(|err| Error::EngineError(format!("Error creating appender: {err}")))?;
    let reader = ChannelReader {
        rx: chunk_rx,
        current: Bytes::new(),
        cancelled: cancelled.clone(),
    };
    let mut row_reader = formats::new_input_reader(&format, &names, &types, Box::new(reader))?
        .ok_or_else(|| Error::ConvertError(format!("Unknown format {format}")))?;

    let mut row = vec![Value::Null; names.len()];
    let mut row_count: u64 = 0;
    loop {
        match row_reader.read_row(&mut row) {
            Ok(false) => break,
            Ok(true) => {
                appender.append_row(params_from_iter(row.iter()))?;
                row_count += 1;
            }
            Err(_) if cancelled.load(Ordering::SeqCst) => return Err(Error::Canceled),
            Err(err) => return Err(err),
        }
    }
    appender
        .flush()
        .map_err(|err| Error::EngineError(format!("Error flushing appender: {err}")))?;
    Ok(row_count)
}

fn text_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[test]
    fn limit_rewrite() {
        let (query, format) = rewrite_select("SELECT a FROM t LIMIT 5, 10");
        assert_eq!(query, "SELECT a FROM t LIMIT 10 OFFSET 5");
        assert_eq!(format, "TabSeparated");
    }

    #[test]
    fn format_clause_is_parsed_and_stripped() {
        let (query, format) = rewrite_select("SELECT 1 AS a FORMAT JSONEachRow");
        assert_eq!(query.trim_end(), "SELECT 1 AS a");
        assert_eq!(format, "JSONEachRow");

        let (query, format) = rewrite_select("select 1;");
        assert_eq!(query, "select 1;");
        assert_eq!(format, "TabSeparated");
    }

    #[test]
    fn select_table_quoting() {
        let (query, _) = rewrite_select("select table from system.tables");
        assert_eq!(query, "select \"table\" from system.tables");
    }

    #[test]
    fn classification() {
        assert_eq!(classify("SELECT 1"), Route::Select);
        assert_eq!(
            classify("INSERT INTO t FORMAT TabSeparated\n"),
            Route::InsertWithFormat
        );
        assert_eq!(
            classify("INSERT INTO t (a) VALUES (1)"),
            Route::Execute
        );
        assert_eq!(classify("create table t (a int)"), Route::Execute);
        assert_eq!(classify(""), Route::NeedMore);
        assert_eq!(classify("  INSERT"), Route::NeedMore);
    }

    #[test]
    fn table_expressions() {
        assert_eq!(
            parse_table_and_columns(" t "),
            Some(("main".to_string(), "t".to_string(), vec![]))
        );
        assert_eq!(
            parse_table_and_columns(" warehouse.orders "),
            Some(("warehouse".to_string(), "orders".to_string(), vec![]))
        );
        assert_eq!(
            parse_table_and_columns(" t (a, b) "),
            Some((
                "main".to_string(),
                "t".to_string(),
                vec!["a".to_string(), "b".to_string()]
            ))
        );
        assert_eq!(parse_table_and_columns("t; drop table x"), None);
    }

    fn test_engine() -> Arc<Engine> {
        Arc::new(Engine::in_memory(false).unwrap())
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Vec<(String, String)>, String) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8_lossy(&body).into_owned())
    }

    async fn post(router: Router, uri: &str, body: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn select_with_json_each_row() {
        let engine = test_engine();
        let (status, headers, body) = get(
            router(engine),
            "/?query=SELECT%201%20AS%20a%20FORMAT%20JSONEachRow",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{\"a\":1}\n");
        assert!(headers
            .iter()
            .any(|(k, v)| k == "content-type" && v == "application/json; charset=UTF-8"));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "x-clickhouse-format" && v == "JSONEachRow"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn select_default_format_is_tab_separated() {
        let engine = test_engine();
        let (status, headers, body) = get(
            router(engine),
            "/?query=SELECT%201%20AS%20a%2C%20%27x%27%20AS%20b",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "1\tx\n");
        assert!(headers
            .iter()
            .any(|(k, v)| k == "x-clickhouse-format" && v == "TabSeparated"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_format_is_rejected() {
        let engine = test_engine();
        let (status, _, body) = get(
            router(engine),
            "/?query=SELECT%201%20FORMAT%20Arrow",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Unknown format Arrow");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn limit_comma_selects_the_window() {
        let engine = test_engine();
        {
            let conn = engine.connect().unwrap();
            conn.execute_batch(
                "create table nums (a integer); insert into nums select * from range(20);",
            )
            .unwrap();
        }
        let (status, _, body) = get(
            router(engine),
            "/?query=SELECT%20a%20FROM%20nums%20ORDER%20BY%20a%20LIMIT%205%2C%2010",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let got: Vec<&str> = body.lines().collect();
        let expected: Vec<String> = (5..15).map(|n| n.to_string()).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_with_tab_separated_body() {
        let engine = test_engine();
        {
            let conn = engine.connect().unwrap();
            conn.execute_batch("create table t (a integer)").unwrap();
        }
        let (status, body) = post(
            router(engine.clone()),
            "/?query=INSERT%20INTO%20t%20FORMAT%20TabSeparated",
            "10\n11\n12\n",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
        let conn = engine.connect().unwrap();
        let total: i64 = conn
            .query_row("select cast(sum(a) as bigint) from t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 33);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_json_each_row_with_column_list() {
        let engine = test_engine();
        {
            let conn = engine.connect().unwrap();
            conn.execute_batch("create table users (id integer, name varchar)")
                .unwrap();
        }
        let (status, body) = post(
            router(engine.clone()),
            "/?query=INSERT%20INTO%20users%20(id%2Cname)%20FORMAT%20JSONEachRow",
            "{\"name\":\"ada\",\"id\":1}\n{\"id\":2}\n",
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let conn = engine.connect().unwrap();
        let count: i64 = conn
            .query_row("select count(*) from users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_with_unknown_column_is_rejected() {
        let engine = test_engine();
        {
            let conn = engine.connect().unwrap();
            conn.execute_batch("create table t2 (a integer)").unwrap();
        }
        let (status, body) = post(
            router(engine),
            "/?query=INSERT%20INTO%20t2%20(b)%20FORMAT%20CSV",
            "1\n",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Column b not found in table");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn post_body_statement_is_executed() {
        let engine = test_engine();
        let (status, _) = post(
            router(engine.clone()),
            "/",
            "create table made_by_post (a integer)",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let conn = engine.connect().unwrap();
        conn.query_row("select count(*) from made_by_post", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn post_body_select_streams_rows() {
        let engine = test_engine();
        let (status, body) = post(router(engine), "/", "SELECT 41 + 1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "42\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_query_is_a_500() {
        let engine = test_engine();
        let (status, _, body) = get(router(engine), "/?query=SELECT%20*%20FROM%20missing").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Error executing query:"));
    }
}

//! COPY ... FROM STDIN: CopyData frame bodies are surfaced as a byte
//! stream, parsed as CSV, converted per column type and appended through
//! the engine's bulk sink.

use std::io::Read;
use std::sync::atomic::Ordering;

use duckdb::params_from_iter;
use duckdb::types::Value;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::engine;
use crate::errors::Error;
use crate::messages::{
    command_complete, copy_in_response, Wire, TAG_COMMAND_COMPLETE, TAG_COPY_DATA, TAG_COPY_DONE,
    TAG_COPY_FAIL, TAG_COPY_IN_RESPONSE,
};
use crate::pg::connection::PgConnection;
use crate::types::converter_for;

static EXTRACT_COPY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)COPY\s+(.*?)\s+FROM\s+STDIN").unwrap());

/// Extracts `(schema, table)` from a COPY statement; a bare table name
/// defaults the schema to `main`.
pub(crate) fn parse_copy_target(sql: &str) -> Option<(String, String)> {
    let caps = EXTRACT_COPY_RE.captures(sql)?;
    let target = caps[1].trim().to_string();
    match target.split_once('.') {
        Some((schema, table)) => Some((schema.to_string(), table.to_string())),
        None => Some(("main".to_string(), target)),
    }
}

/// Adapts the incoming CopyData frames into `std::io::Read`. CopyDone is
/// end of stream; CopyFail and unexpected frames are read errors.
struct CopyInStream<'a, S: Read + std::io::Write> {
    wire: &'a mut Wire<S>,
    done: bool,
}

impl<S: Read + std::io::Write> Read for CopyInStream<'_, S> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.done {
                return Ok(0);
            }
            let served = self.wire.read_chunk(out)?;
            if served > 0 {
                return Ok(served);
            }
            let frame = self
                .wire
                .read_frame()
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            match frame.tag {
                TAG_COPY_DATA => continue,
                TAG_COPY_DONE => {
                    self.done = true;
                    return Ok(0);
                }
                TAG_COPY_FAIL => return Err(std::io::Error::other("copy fail")),
                other => {
                    return Err(std::io::Error::other(format!(
                        "unexpected message type: {}",
                        other as char
                    )))
                }
            }
        }
    }
}

pub(crate) fn copy_in<S: Read + std::io::Write>(
    connection: &mut PgConnection<S>,
    sql: &str,
) -> Result<(), Error> {
    let Some((schema, table)) = parse_copy_target(sql) else {
        return connection.send_error_response("invalid COPY statement");
    };
    let column_types = match engine::table_column_types(&connection.conn, &schema, &table) {
        Ok(types) if !types.is_empty() => types,
        Ok(_) => {
            return connection
                .send_error_response(&format!("table {schema}.{table} does not exist"))
        }
        Err(err) => return connection.send_error_response(&err.to_string()),
    };
    let mut converters = Vec::with_capacity(column_types.len());
    for column_type in &column_types {
        match converter_for(column_type) {
            Some(converter) => converters.push(converter),
            None => {
                return connection
                    .send_error_response(&format!("unsupported column type: {column_type}"))
            }
        }
    }

    let token = connection.cancel.arm();
    let PgConnection {
        conn,
        wire,
        in_error,
        cancel,
        ..
    } = connection;

    let result = (|| {
        let mut appender = match conn.appender_to_db(&table, &schema) {
            Ok(appender) => appender,
            Err(err) => return PgConnection::send_error(wire, in_error, &err.to_string()),
        };
        wire.send(TAG_COPY_IN_RESPONSE, &copy_in_response(column_types.len()));

        let outcome = {
            let stream = CopyInStream {
                wire: &mut *wire,
                done: false,
            };
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .from_reader(stream);
            let mut record = csv::StringRecord::new();
            let mut row = vec![Value::Null; converters.len()];
            let mut row_count: u64 = 0;
            loop {
                if token.load(Ordering::Relaxed) {
                    break Err(Error::Canceled);
                }
                match reader.read_record(&mut record) {
                    Ok(false) => break Ok(row_count),
                    Ok(true) => {
                        if record.len() != converters.len() {
                            break Err(Error::ConvertError(format!(
                                "expected {} fields, got {}",
                                converters.len(),
                                record.len()
                            )));
                        }
                        let mut failed = None;
                        for (i, converter) in converters.iter().enumerate() {
                            match converter(record.get(i).unwrap_or_default()) {
                                Ok(value) => row[i] = value,
                                Err(err) => {
                                    failed = Some(err);
                                    break;
                                }
                            }
                        }
                        if let Some(err) = failed {
                            break Err(err);
                        }
                        if let Err(err) = appender.append_row(params_from_iter(row.iter())) {
                            break Err(Error::EngineError(err.to_string()));
                        }
                        row_count += 1;
                    }
                    Err(err) => break Err(Error::ConvertError(err.to_string())),
                }
            }
        };

        match outcome {
            Ok(row_count) => match appender.flush() {
                Ok(()) => {
                    wire.send(
                        TAG_COMMAND_COMPLETE,
                        &command_complete(&format!("COPY {row_count}")),
                    );
                    Ok(())
                }
                Err(err) => PgConnection::send_error(wire, in_error, &err.to_string()),
            },
            Err(Error::Canceled) => {
                // Abandon the stream; the client learns through CopyFail.
                wire.send(TAG_COPY_FAIL, &[]);
                Ok(())
            }
            Err(err) => PgConnection::send_error(wire, in_error, &err.to_string()),
        }
    })();
    cancel.disarm();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_target_defaults_to_main() {
        assert_eq!(
            parse_copy_target("COPY pets FROM STDIN"),
            Some(("main".to_string(), "pets".to_string()))
        );
        assert_eq!(
            parse_copy_target("copy warehouse.orders from stdin"),
            Some(("warehouse".to_string(), "orders".to_string()))
        );
        assert_eq!(parse_copy_target("SELECT 1"), None);
    }
}

//! ClickHouse format codecs: reader/writer factories keyed by format
//! name. Writers emit a row as an ordered sequence of engine values;
//! readers decode the symmetric input into typed values for the bulk
//! append sink.

use std::io::{Read, Write};

use duckdb::types::{TimeUnit, Value};
use serde_json::Map;

use crate::errors::Error;
use crate::types::{converter_for, format_date};

pub const DEFAULT_FORMAT: &str = "TabSeparated";

pub trait RowWriter: Send {
    fn write_row(&mut self, values: &[Value]) -> Result<(), Error>;
    fn finish(&mut self) -> Result<(), Error>;
}

pub trait RowReader: Send {
    /// Decodes the next row into `out`; false at end of input.
    fn read_row(&mut self, out: &mut [Value]) -> Result<bool, Error>;
}

pub fn is_input_format(format: &str) -> bool {
    matches!(
        format,
        "JSONEachRow" | "CSV" | "CSVWithNames" | "TabSeparated" | "TabSeparatedWithNames"
    )
}

pub fn content_type(format: &str) -> Option<&'static str> {
    match format {
        "TabSeparated" | "TabSeparatedWithNames" | "TabSeparatedWithNamesAndTypes" => {
            Some("text/tab-separated-values; charset=UTF-8")
        }
        "CSV" | "CSVWithNames" => Some("text/csv; charset=UTF-8"),
        "JSONEachRow" => Some("application/json; charset=UTF-8"),
        _ => None,
    }
}

pub fn new_output_writer(
    format: &str,
    column_names: &[String],
    column_types: &[String],
    writer: Box<dyn Write + Send>,
) -> Result<Option<Box<dyn RowWriter>>, Error> {
    let built: Box<dyn RowWriter> = match format {
        "JSONEachRow" => Box::new(JsonEachRowWriter {
            names: column_names.to_vec(),
            writer,
        }),
        "CSV" => Box::new(SeparatedWriter::new(writer, b',', None, None)?),
        "CSVWithNames" => Box::new(SeparatedWriter::new(writer, b',', Some(column_names), None)?),
        "TabSeparated" => Box::new(SeparatedWriter::new(writer, b'\t', None, None)?),
        "TabSeparatedWithNames" => {
            Box::new(SeparatedWriter::new(writer, b'\t', Some(column_names), None)?)
        }
        "TabSeparatedWithNamesAndTypes" => Box::new(SeparatedWriter::new(
            writer,
            b'\t',
            Some(column_names),
            Some(column_types),
        )?),
        _ => return Ok(None),
    };
    Ok(Some(built))
}

pub fn new_input_reader(
    format: &str,
    column_names: &[String],
    column_types: &[String],
    reader: Box<dyn Read + Send>,
) -> Result<Option<Box<dyn RowReader>>, Error> {
    let built: Box<dyn RowReader> = match format {
        "JSONEachRow" => Box::new(JsonEachRowReader {
            names: column_names.to_vec(),
            stream: serde_json::Deserializer::from_reader(reader).into_iter(),
        }),
        "CSV" => Box::new(SeparatedReader::new(reader, b',', false, column_types)?),
        "CSVWithNames" => Box::new(SeparatedReader::new(reader, b',', true, column_types)?),
        "TabSeparated" => Box::new(SeparatedReader::new(reader, b'\t', false, column_types)?),
        "TabSeparatedWithNames" => {
            Box::new(SeparatedReader::new(reader, b'\t', true, column_types)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(built))
}

/// The engine-to-ClickHouse type names emitted by
/// TabSeparatedWithNamesAndTypes.
fn ch_type_name(engine_type: &str) -> &'static str {
    match engine_type {
        "INTEGER" => "Int32",
        "VARCHAR" => "String",
        "BIGINT" => "Int64",
        "BOOLEAN" => "UInt8",
        "DOUBLE" => "Float64",
        _ => "String",
    }
}

/// Timestamps render at second precision in the HTTP formats.
fn format_timestamp_seconds(unit: TimeUnit, raw: i64) -> String {
    let micros = match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    };
    match chrono::DateTime::from_timestamp_micros(micros) {
        Some(ts) => ts.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string(),
        None => micros.to_string(),
    }
}

/// Text rendering for the CSV/TSV family: null is `\N`, booleans are
/// `1`/`0`.
fn text_field(value: &Value) -> String {
    match value {
        Value::Null => "\\N".to_string(),
        Value::Boolean(true) => "1".to_string(),
        Value::Boolean(false) => "0".to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::HugeInt(i) => i.to_string(),
        Value::UTinyInt(i) => i.to_string(),
        Value::USmallInt(i) => i.to_string(),
        Value::UInt(i) => i.to_string(),
        Value::UBigInt(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Text(s) => s.clone(),
        Value::Enum(s) => s.clone(),
        Value::Timestamp(unit, raw) => format_timestamp_seconds(*unit, *raw),
        Value::Date32(days) => format_date(*days).unwrap_or_else(|_| days.to_string()),
        Value::List(items) | Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(text_field).collect();
            format!("{{{}}}", parts.join(","))
        }
        other => format!("{other:?}"),
    }
}

fn json_field(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::TinyInt(i) => serde_json::json!(i),
        Value::SmallInt(i) => serde_json::json!(i),
        Value::Int(i) => serde_json::json!(i),
        Value::BigInt(i) => serde_json::json!(i),
        Value::UTinyInt(i) => serde_json::json!(i),
        Value::USmallInt(i) => serde_json::json!(i),
        Value::UInt(i) => serde_json::json!(i),
        Value::UBigInt(i) => serde_json::json!(i),
        Value::Float(f) => serde_json::json!(f),
        Value::Double(f) => serde_json::json!(f),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Enum(s) => serde_json::Value::String(s.clone()),
        Value::List(items) | Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(json_field).collect())
        }
        other => serde_json::Value::String(text_field(other)),
    }
}

/// Converts a decoded JSON field into an engine value.
fn json_to_engine(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(i)
            } else {
                Value::Double(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

struct JsonEachRowWriter {
    names: Vec<String>,
    writer: Box<dyn Write + Send>,
}

impl RowWriter for JsonEachRowWriter {
    fn write_row(&mut self, values: &[Value]) -> Result<(), Error> {
        let mut object = Map::new();
        for (i, name) in self.names.iter().enumerate() {
            let value = values.get(i).unwrap_or(&Value::Null);
            object.insert(name.clone(), json_field(value));
        }
        serde_json::to_writer(&mut self.writer, &object)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

struct SeparatedWriter {
    writer: csv::Writer<Box<dyn Write + Send>>,
}

impl SeparatedWriter {
    fn new(
        writer: Box<dyn Write + Send>,
        delimiter: u8,
        names: Option<&[String]>,
        types: Option<&[String]>,
    ) -> Result<Self, Error> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(writer);
        if let Some(names) = names {
            writer.write_record(names)?;
        }
        if let Some(types) = types {
            let mapped: Vec<&str> = types.iter().map(|t| ch_type_name(t)).collect();
            writer.write_record(&mapped)?;
        }
        Ok(SeparatedWriter { writer })
    }
}

impl RowWriter for SeparatedWriter {
    fn write_row(&mut self, values: &[Value]) -> Result<(), Error> {
        let fields: Vec<String> = values.iter().map(text_field).collect();
        self.writer.write_record(&fields)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.writer.flush().map_err(|e| Error::SocketError(e.to_string()))?;
        Ok(())
    }
}

struct JsonEachRowReader {
    names: Vec<String>,
    stream: serde_json::StreamDeserializer<
        'static,
        serde_json::de::IoRead<Box<dyn Read + Send>>,
        Map<String, serde_json::Value>,
    >,
}

impl RowReader for JsonEachRowReader {
    fn read_row(&mut self, out: &mut [Value]) -> Result<bool, Error> {
        let Some(next) = self.stream.next() else {
            return Ok(false);
        };
        let object = next?;
        // Fields are matched by column name; extras are ignored and
        // missing ones become null.
        for (i, name) in self.names.iter().enumerate() {
            out[i] = object.get(name).map(json_to_engine).unwrap_or(Value::Null);
        }
        Ok(true)
    }
}

struct SeparatedReader {
    reader: csv::Reader<Box<dyn Read + Send>>,
    converters: Vec<fn(&str) -> Result<Value, Error>>,
    record: csv::StringRecord,
}

impl SeparatedReader {
    fn new(
        reader: Box<dyn Read + Send>,
        delimiter: u8,
        has_header: bool,
        column_types: &[String],
    ) -> Result<Self, Error> {
        let mut converters = Vec::with_capacity(column_types.len());
        for column_type in column_types {
            match converter_for(column_type) {
                Some(converter) => converters.push(converter),
                None => {
                    return Err(Error::ConvertError(format!(
                        "unsupported column type: {column_type}"
                    )))
                }
            }
        }
        Ok(SeparatedReader {
            reader: csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .has_headers(has_header)
                .from_reader(reader),
            converters,
            record: csv::StringRecord::new(),
        })
    }
}

impl RowReader for SeparatedReader {
    fn read_row(&mut self, out: &mut [Value]) -> Result<bool, Error> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(false);
        }
        if self.record.len() != self.converters.len() {
            return Err(Error::ConvertError(format!(
                "expected {} fields, got {}",
                self.converters.len(),
                self.record.len()
            )));
        }
        for (i, converter) in self.converters.iter().enumerate() {
            out[i] = converter(self.record.get(i).unwrap_or_default())?;
        }
        Ok(true)
    }
}

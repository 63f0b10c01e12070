//! Projection of engine values and type names onto the PostgreSQL wire.

use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value};

use crate::errors::Error;

/// Wire type descriptor used in RowDescription ('T') messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgType {
    pub oid: i32,
    pub name: &'static str,
}

/// The subset of the PostgreSQL type catalog this server speaks.
pub const PG_TYPES: &[PgType] = &[
    PgType { oid: 16, name: "bool" },
    PgType { oid: 17, name: "bytea" },
    PgType { oid: 18, name: "char" },
    PgType { oid: 20, name: "int8" },
    PgType { oid: 21, name: "int4" },
    PgType { oid: 700, name: "float4" },
    PgType { oid: 701, name: "float8" },
    PgType { oid: 25, name: "text" },
    PgType { oid: 1700, name: "numeric" },
    PgType { oid: 1114, name: "timestamp" },
    PgType { oid: 1082, name: "date" },
];

pub fn oid_for_pg_name(name: &str) -> Option<i32> {
    PG_TYPES.iter().find(|t| t.name == name).map(|t| t.oid)
}

/// Maps an engine logical type name (as reported by `DESCRIBE`) onto a
/// PostgreSQL type name. Parameterized spellings like `DECIMAL(18,3)` are
/// normalized first. An unknown type is an error: the connection must not
/// silently misreport column types.
pub fn engine_type_to_pg(engine_type: &str) -> Result<&'static str, Error> {
    let normalized = normalize_engine_type(engine_type);
    let pg = match normalized.as_str() {
        "BOOLEAN" => "bool",
        "VARCHAR" => "text",
        "INTEGER" => "int4",
        "BIGINT" => "int8",
        "DOUBLE" => "float8",
        "TIMESTAMP" => "timestamp",
        "DECIMAL" => "numeric",
        "DATE" => "date",
        "VARCHAR[]" => "text",
        other => {
            return Err(Error::ConvertError(format!(
                "unsupported engine type {other}"
            )))
        }
    };
    Ok(pg)
}

pub fn oid_for_engine_type(engine_type: &str) -> Result<i32, Error> {
    let pg_name = engine_type_to_pg(engine_type)?;
    oid_for_pg_name(pg_name)
        .ok_or_else(|| Error::ConvertError(format!("no oid for type {pg_name}")))
}

fn normalize_engine_type(engine_type: &str) -> String {
    let t = engine_type.trim();
    if t.ends_with("[]") {
        return "VARCHAR[]".to_string();
    }
    if t.starts_with("DECIMAL") || t.starts_with("NUMERIC") {
        return "DECIMAL".to_string();
    }
    if t.contains("TIMESTAMP") {
        return "TIMESTAMP".to_string();
    }
    t.to_string()
}

/// A value projected into the text format: a wire type plus its encoding.
/// `data == None` is the SQL null, sent as length -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTextValue {
    pub oid: i32,
    pub data: Option<Vec<u8>>,
}

impl PgTextValue {
    fn new(oid: i32, data: Vec<u8>) -> Self {
        PgTextValue {
            oid,
            data: Some(data),
        }
    }

    fn null() -> Self {
        PgTextValue {
            oid: 25,
            data: None,
        }
    }
}

/// Renders an engine value in the wire text format.
pub fn to_pg_text(value: &Value) -> Result<PgTextValue, Error> {
    let v = match value {
        Value::Null => PgTextValue::null(),
        // Booleans keep their trailing NUL on the wire.
        Value::Boolean(true) => PgTextValue::new(16, b"t\0".to_vec()),
        Value::Boolean(false) => PgTextValue::new(16, b"f\0".to_vec()),
        Value::TinyInt(i) => PgTextValue::new(18, i.to_string().into_bytes()),
        Value::SmallInt(i) => PgTextValue::new(21, i.to_string().into_bytes()),
        Value::Int(i) => PgTextValue::new(21, i.to_string().into_bytes()),
        Value::BigInt(i) => PgTextValue::new(20, i.to_string().into_bytes()),
        Value::UTinyInt(i) => PgTextValue::new(21, i.to_string().into_bytes()),
        Value::USmallInt(i) => PgTextValue::new(21, i.to_string().into_bytes()),
        Value::UInt(i) => PgTextValue::new(20, i.to_string().into_bytes()),
        Value::UBigInt(i) => PgTextValue::new(20, i.to_string().into_bytes()),
        Value::HugeInt(i) => PgTextValue::new(1700, i.to_string().into_bytes()),
        Value::Float(f) => PgTextValue::new(701, f.to_string().into_bytes()),
        Value::Double(f) => PgTextValue::new(701, f.to_string().into_bytes()),
        Value::Decimal(d) => PgTextValue::new(1700, d.to_string().into_bytes()),
        Value::Text(s) => PgTextValue::new(25, s.clone().into_bytes()),
        Value::Enum(s) => PgTextValue::new(25, s.clone().into_bytes()),
        Value::Blob(b) => {
            let mut out = String::with_capacity(2 + b.len() * 2);
            out.push_str("\\x");
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
            PgTextValue::new(17, out.into_bytes())
        }
        Value::Timestamp(unit, raw) => {
            PgTextValue::new(1114, format_timestamp(*unit, *raw)?.into_bytes())
        }
        Value::Date32(days) => PgTextValue::new(1082, format_date(*days)?.into_bytes()),
        Value::List(items) | Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                let rendered = to_pg_text(item)?;
                parts.push(match rendered.data {
                    Some(data) => String::from_utf8_lossy(&data).into_owned(),
                    None => String::new(),
                });
            }
            PgTextValue::new(25, format!("{{{}}}", parts.join(",")).into_bytes())
        }
        other => {
            return Err(Error::ConvertError(format!(
                "unsupported value type {other:?}"
            )))
        }
    };
    Ok(v)
}

fn to_micros(unit: TimeUnit, raw: i64) -> i64 {
    match unit {
        TimeUnit::Second => raw * 1_000_000,
        TimeUnit::Millisecond => raw * 1_000,
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    }
}

/// `YYYY-MM-DD HH:MM:SS.ffffff` with trailing fractional zeros trimmed.
pub fn format_timestamp(unit: TimeUnit, raw: i64) -> Result<String, Error> {
    let micros = to_micros(unit, raw);
    let ts = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::ConvertError(format!("timestamp out of range: {micros}")))?
        .naive_utc();
    let mut rendered = ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
    if rendered.contains('.') {
        while rendered.ends_with('0') {
            rendered.pop();
        }
        if rendered.ends_with('.') {
            rendered.pop();
        }
    }
    Ok(rendered)
}

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub fn format_date(days_since_epoch: i32) -> Result<String, Error> {
    let date = NaiveDate::from_num_days_from_ce_opt(days_since_epoch + UNIX_EPOCH_DAYS_FROM_CE)
        .ok_or_else(|| Error::ConvertError(format!("date out of range: {days_since_epoch}")))?;
    Ok(date.format("%Y-%m-%d").to_string())
}

/// Best-effort typing of a text-format parameter: integer, then float,
/// otherwise the raw string.
pub fn parse_text_param(raw: Option<String>) -> Value {
    let Some(s) = raw else {
        return Value::Null;
    };
    if let Ok(i) = s.parse::<i64>() {
        return Value::BigInt(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::Double(f);
    }
    Value::Text(s)
}

/// Renders a bound value as a SQL literal for textual `$N` substitution.
fn value_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Double(f) => f.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", format!("{other:?}").replace('\'', "''")),
    }
}

/// Substitutes `$N` placeholders with literal renderings of the bound
/// values. A placeholder past the end of `args` becomes `null`; a lone `$`
/// is passed through untouched.
pub fn bind_values(sql: &str, args: &[Value]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut last = 0usize;
    loop {
        let Some(idx) = bytes[last..].iter().position(|&b| b == b'$') else {
            break;
        };
        out.push_str(&sql[last..last + idx]);
        last += idx;
        let seg = &bytes[last..];
        let mut digits = 0usize;
        while digits + 1 < seg.len() && seg[digits + 1].is_ascii_digit() {
            digits += 1;
        }
        if digits == 0 {
            out.push('$');
            last += 1;
            continue;
        }
        let placeholder: usize = sql[last + 1..last + 1 + digits].parse().unwrap_or(0);
        if placeholder == 0 || placeholder > args.len() {
            out.push_str("null");
        } else {
            out.push_str(&value_literal(&args[placeholder - 1]));
        }
        last += digits + 1;
    }
    out.push_str(&sql[last..]);
    out
}

/// Per-engine-type converters used to turn textual fields (COPY and the
/// HTTP input formats) into typed engine values.
pub fn converter_for(engine_type: &str) -> Option<fn(&str) -> Result<Value, Error>> {
    let f: fn(&str) -> Result<Value, Error> = match normalize_engine_type(engine_type).as_str() {
        "INTEGER" => |s| {
            s.parse::<i32>()
                .map(Value::Int)
                .map_err(|e| Error::ConvertError(e.to_string()))
        },
        "VARCHAR" => |s| Ok(Value::Text(s.to_string())),
        "BIGINT" | "BIT" => |s| {
            s.parse::<i64>()
                .map(Value::BigInt)
                .map_err(|e| Error::ConvertError(e.to_string()))
        },
        "BOOLEAN" => |s| match s {
            "true" | "1" | "t" => Ok(Value::Boolean(true)),
            "false" | "0" | "f" => Ok(Value::Boolean(false)),
            other => Err(Error::ConvertError(format!("invalid boolean: {other}"))),
        },
        "DOUBLE" => |s| {
            s.parse::<f64>()
                .map(Value::Double)
                .map_err(|e| Error::ConvertError(e.to_string()))
        },
        _ => return None,
    };
    Some(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_table_subset() {
        assert_eq!(oid_for_pg_name("bool"), Some(16));
        assert_eq!(oid_for_pg_name("int8"), Some(20));
        assert_eq!(oid_for_pg_name("int4"), Some(21));
        assert_eq!(oid_for_pg_name("text"), Some(25));
        assert_eq!(oid_for_pg_name("numeric"), Some(1700));
        assert_eq!(oid_for_pg_name("timestamp"), Some(1114));
        assert_eq!(oid_for_pg_name("no such type"), None);
    }

    #[test]
    fn engine_type_mapping() {
        assert_eq!(engine_type_to_pg("INTEGER").unwrap(), "int4");
        assert_eq!(engine_type_to_pg("BIGINT").unwrap(), "int8");
        assert_eq!(engine_type_to_pg("VARCHAR[]").unwrap(), "text");
        assert_eq!(engine_type_to_pg("DECIMAL(18,3)").unwrap(), "numeric");
        assert!(engine_type_to_pg("BLOB").is_err());
    }

    #[test]
    fn bool_values_keep_terminator() {
        let t = to_pg_text(&Value::Boolean(true)).unwrap();
        assert_eq!(t.oid, 16);
        assert_eq!(t.data.unwrap(), b"t\0");
    }

    #[test]
    fn null_has_no_data() {
        let v = to_pg_text(&Value::Null).unwrap();
        assert_eq!(v.data, None);
    }

    #[test]
    fn integer_family_oids() {
        assert_eq!(to_pg_text(&Value::Int(7)).unwrap().oid, 21);
        assert_eq!(to_pg_text(&Value::BigInt(7)).unwrap().oid, 20);
        assert_eq!(
            to_pg_text(&Value::BigInt(-42)).unwrap().data.unwrap(),
            b"-42"
        );
    }

    #[test]
    fn floats_render_shortest() {
        assert_eq!(
            to_pg_text(&Value::Double(1.5)).unwrap().data.unwrap(),
            b"1.5"
        );
        assert_eq!(to_pg_text(&Value::Double(3.0)).unwrap().data.unwrap(), b"3");
    }

    #[test]
    fn timestamps_trim_trailing_zeros() {
        assert_eq!(
            format_timestamp(TimeUnit::Microsecond, 0).unwrap(),
            "1970-01-01 00:00:00"
        );
        assert_eq!(
            format_timestamp(TimeUnit::Microsecond, 1_500_000).unwrap(),
            "1970-01-01 00:00:01.5"
        );
        assert_eq!(
            format_timestamp(TimeUnit::Second, 86_400).unwrap(),
            "1970-01-02 00:00:00"
        );
    }

    #[test]
    fn dates_since_epoch() {
        assert_eq!(format_date(0).unwrap(), "1970-01-01");
        assert_eq!(format_date(19_723).unwrap(), "2024-01-01");
    }

    #[test]
    fn arrays_render_braced() {
        let v = Value::List(vec![Value::Int(1), Value::Null, Value::Int(3)]);
        assert_eq!(to_pg_text(&v).unwrap().data.unwrap(), b"{1,,3}");
    }

    #[test]
    fn text_params_try_numeric_first() {
        assert_eq!(parse_text_param(Some("42".into())), Value::BigInt(42));
        assert_eq!(parse_text_param(Some("4.5".into())), Value::Double(4.5));
        assert_eq!(
            parse_text_param(Some("4x".into())),
            Value::Text("4x".into())
        );
        assert_eq!(parse_text_param(None), Value::Null);
    }

    #[test]
    fn bind_values_substitutes_literals() {
        let args = vec![
            Value::Text("o'neil".to_string()),
            Value::BigInt(7),
            Value::Null,
        ];
        assert_eq!(
            bind_values("select $1, $2, $3, $4", &args),
            "select 'o''neil', 7, null, null"
        );
        assert_eq!(bind_values("select '$' || $1", &args), "select '$' || 'o''neil'");
    }

    #[test]
    fn copy_converters() {
        let conv = converter_for("INTEGER").unwrap();
        assert_eq!(conv("12").unwrap(), Value::Int(12));
        assert!(conv("x").is_err());
        let conv = converter_for("BOOLEAN").unwrap();
        assert_eq!(conv("true").unwrap(), Value::Boolean(true));
        assert_eq!(conv("0").unwrap(), Value::Boolean(false));
        assert!(converter_for("STRUCT(a INT)").is_none());
    }
}

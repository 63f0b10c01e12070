//! Builders for response message bodies. Each returns the body only; the
//! codec frames it with the tag and length.

use bytes::{BufMut, BytesMut};

use crate::errors::Error;
use crate::messages::{SASL, SASL_CONTINUE, SASL_FINAL};
use crate::types::{oid_for_engine_type, PgTextValue};

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// ErrorResponse body with fields `S=ERROR`, `C=SQL-0000`, `M=<message>`.
pub fn error_response(message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    put_cstr(&mut body, "ERROR");
    body.put_u8(b'C');
    put_cstr(&mut body, "SQL-0000");
    body.put_u8(b'M');
    put_cstr(&mut body, message);
    body.put_u8(0);
    body
}

pub fn command_complete(tag: &str) -> BytesMut {
    let mut body = BytesMut::new();
    put_cstr(&mut body, tag);
    body
}

pub fn parameter_status(key: &str, value: &str) -> BytesMut {
    let mut body = BytesMut::new();
    put_cstr(&mut body, key);
    put_cstr(&mut body, value);
    body
}

pub fn ready_for_query(status: u8) -> BytesMut {
    let mut body = BytesMut::with_capacity(1);
    body.put_u8(status);
    body
}

/// ParameterDescription: one zero OID per declared input parameter.
pub fn parameter_description(num_input: usize) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(num_input as i16);
    for _ in 0..num_input {
        body.put_i32(0);
    }
    body
}

fn put_row_description_field(body: &mut BytesMut, name: &str, oid: i32) {
    put_cstr(body, name);
    body.put_i32(0); // table oid
    body.put_i16(0); // attribute number
    body.put_i32(oid);
    body.put_i16(0); // type size
    body.put_i32(0); // type modifier
    body.put_i16(0); // format code: text
}

/// RowDescription derived from the first row's rendered values.
pub fn row_description_from_values(names: &[String], values: &[PgTextValue]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(names.len() as i16);
    for (i, name) in names.iter().enumerate() {
        let oid = values.get(i).map(|v| v.oid).unwrap_or(25);
        put_row_description_field(&mut body, name, oid);
    }
    body
}

/// RowDescription derived from inferred (column name, engine type) pairs.
pub fn row_description_from_columns(columns: &[(String, String)]) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    body.put_i16(columns.len() as i16);
    for (name, engine_type) in columns {
        let oid = oid_for_engine_type(engine_type)?;
        put_row_description_field(&mut body, name, oid);
    }
    Ok(body)
}

/// DataRow: per-column length-prefixed text encodings, -1 for null.
pub fn data_row(values: &[PgTextValue]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        match &value.data {
            Some(data) => {
                body.put_i32(data.len() as i32);
                body.put_slice(data);
            }
            None => body.put_i32(-1),
        }
    }
    body
}

/// CopyInResponse: text format, all columns in text format.
pub fn copy_in_response(column_count: usize) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0);
    body.put_i16(column_count as i16);
    for _ in 0..column_count {
        body.put_i16(0);
    }
    body
}

/// AuthenticationSASL advertising the supported mechanisms.
pub fn auth_sasl(mechanisms: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(SASL);
    for mechanism in mechanisms {
        put_cstr(&mut body, mechanism);
    }
    body.put_u8(0);
    body
}

pub fn auth_sasl_continue(data: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(SASL_CONTINUE);
    body.put_slice(data.as_bytes());
    body
}

pub fn auth_sasl_final(data: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(SASL_FINAL);
    body.put_slice(data.as_bytes());
    body
}

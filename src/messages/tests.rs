// Tests for the messages module: codec framing, request parsers and
// response builders.

use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};

use crate::errors::Error;
use crate::messages::wire::parse_startup_parameters;
use crate::messages::*;
use crate::types::PgTextValue;

/// A duplex stand-in: reads come from a prepared script, writes are
/// captured for inspection.
struct MockStream {
    input: Cursor<Vec<u8>>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl MockStream {
    fn new(input: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        (
            MockStream {
                input: Cursor::new(input),
                output: output.clone(),
            },
            output,
        )
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[test]
fn written_frame_is_five_plus_body() {
    let (stream, output) = MockStream::new(Vec::new());
    let mut wire = Wire::new(stream);
    wire.send(TAG_COMMAND_COMPLETE, b"SELECT 1\0");
    wire.flush().unwrap();
    let written = output.lock().unwrap().clone();
    assert_eq!(written.len(), 5 + 9);
    assert_eq!(written[0], TAG_COMMAND_COMPLETE);
    assert_eq!(
        i32::from_be_bytes([written[1], written[2], written[3], written[4]]),
        13
    );
}

#[test]
fn reading_next_frame_skips_unread_body() {
    let mut input = frame(TAG_QUERY, b"SELECT 1\0");
    input.extend_from_slice(&frame(TAG_SYNC, b""));
    let (stream, _) = MockStream::new(input);
    let mut wire = Wire::new(stream);

    // First frame's body is never read.
    let first = wire.read_frame().unwrap();
    assert_eq!(first.tag, TAG_QUERY);
    assert_eq!(wire.remaining_body(), 9);

    let second = wire.read_frame().unwrap();
    assert_eq!(second.tag, TAG_SYNC);
    assert_eq!(second.len, 4);
}

#[test]
fn partially_consumed_body_is_skipped() {
    let mut input = frame(TAG_COPY_DATA, b"abcdefgh");
    input.extend_from_slice(&frame(TAG_COPY_DONE, b""));
    let (stream, _) = MockStream::new(input);
    let mut wire = Wire::new(stream);

    wire.read_frame().unwrap();
    let mut chunk = [0u8; 3];
    assert_eq!(wire.read_chunk(&mut chunk).unwrap(), 3);
    assert_eq!(&chunk, b"abc");
    assert_eq!(wire.remaining_body(), 5);

    let next = wire.read_frame().unwrap();
    assert_eq!(next.tag, TAG_COPY_DONE);
}

#[test]
fn body_is_buffered_once() {
    let input = frame(TAG_QUERY, b"SELECT 2\0");
    let (stream, _) = MockStream::new(input);
    let mut wire = Wire::new(stream);
    wire.read_frame().unwrap();
    let body = wire.read_body().unwrap();
    assert_eq!(&body[..], b"SELECT 2\0");
    assert_eq!(wire.remaining_body(), 0);
}

#[test]
fn expect_frame_rejects_wrong_tag() {
    let input = frame(TAG_QUERY, b"\0");
    let (stream, _) = MockStream::new(input);
    let mut wire = Wire::new(stream);
    match wire.expect_frame(TAG_PASSWORD) {
        Err(Error::ProtocolSyncError(msg)) => assert!(msg.contains("not match")),
        other => panic!("unexpected result: {other:?}"),
    }
}

fn startup_message(params: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION_NUMBER.to_be_bytes());
    for (k, v) in params {
        body.extend_from_slice(k.as_bytes());
        body.push(0);
        body.extend_from_slice(v.as_bytes());
        body.push(0);
    }
    body.push(0);
    let mut out = Vec::new();
    out.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

#[test]
fn startup_message_parses_parameters() {
    let input = startup_message(&[("user", "alice"), ("database", "db")]);
    let (stream, _) = MockStream::new(input);
    let mut wire = Wire::new(stream);
    match wire.read_first_message().unwrap() {
        FirstMessage::Startup(params) => {
            assert_eq!(params.get("user").map(String::as_str), Some("alice"));
            assert_eq!(params.get("database").map(String::as_str), Some("db"));
        }
        other => panic!("unexpected first message: {other:?}"),
    }
}

#[test]
fn ssl_request_is_declined_then_startup_read() {
    let mut input = Vec::new();
    input.extend_from_slice(&8i32.to_be_bytes());
    input.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    input.extend_from_slice(&startup_message(&[("user", "bob")]));
    let (stream, output) = MockStream::new(input);
    let mut wire = Wire::new(stream);
    match wire.read_first_message().unwrap() {
        FirstMessage::Startup(params) => {
            assert_eq!(params.get("user").map(String::as_str), Some("bob"));
        }
        other => panic!("unexpected first message: {other:?}"),
    }
    assert_eq!(output.lock().unwrap().as_slice(), b"N");
}

#[test]
fn cancel_request_carries_the_key() {
    let mut input = Vec::new();
    input.extend_from_slice(&16i32.to_be_bytes());
    input.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
    input.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let (stream, _) = MockStream::new(input);
    let mut wire = Wire::new(stream);
    assert_eq!(
        wire.read_first_message().unwrap(),
        FirstMessage::CancelRequest([1, 2, 3, 4, 5, 6, 7, 8])
    );
}

#[test]
fn unknown_version_is_rejected() {
    let mut input = Vec::new();
    input.extend_from_slice(&8i32.to_be_bytes());
    input.extend_from_slice(&1234i32.to_be_bytes());
    let (stream, _) = MockStream::new(input);
    let mut wire = Wire::new(stream);
    match wire.read_first_message() {
        Err(Error::ProtocolSyncError(msg)) => assert_eq!(msg, "invalid version"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn startup_parameters_stop_at_terminator() {
    let params = parse_startup_parameters(b"user\0u\0extra\0v\0\0garbage");
    assert_eq!(params.len(), 2);
    assert_eq!(params.get("extra").map(String::as_str), Some("v"));
}

#[test]
fn parse_message_fields() {
    let mut body = BytesMut::new();
    body.put_slice(b"s1\0SELECT $1\0");
    body.put_i16(1);
    body.put_i32(23);
    let parsed = ParseMessage::parse(&body).unwrap();
    assert_eq!(parsed.name, "s1");
    assert_eq!(parsed.sql, "SELECT $1");
    assert_eq!(parsed.param_oids, vec![23]);
}

#[test]
fn bind_message_values_and_nulls() {
    let mut body = BytesMut::new();
    body.put_slice(b"p1\0s1\0");
    body.put_i16(1); // one format code
    body.put_i16(0);
    body.put_i16(2); // two values
    body.put_i32(1);
    body.put_slice(b"7");
    body.put_i32(-1);
    body.put_i16(0); // result formats
    let parsed = BindMessage::parse(&body).unwrap();
    assert_eq!(parsed.portal, "p1");
    assert_eq!(parsed.statement, "s1");
    assert_eq!(parsed.params, vec![Some("7".to_string()), None]);
}

#[test]
fn bind_message_rejects_negative_length() {
    let mut body = BytesMut::new();
    body.put_slice(b"\0\0");
    body.put_i16(0);
    body.put_i16(1);
    body.put_i32(-7);
    assert!(BindMessage::parse(&body).is_err());
}

#[test]
fn describe_and_execute_messages() {
    let parsed = DescribeMessage::parse(b"Sstmt\0").unwrap();
    assert_eq!(parsed.target, b'S');
    assert_eq!(parsed.name, "stmt");

    let mut body = BytesMut::new();
    body.put_slice(b"portal\0");
    body.put_i32(100);
    let parsed = ExecuteMessage::parse(&body).unwrap();
    assert_eq!(parsed.portal, "portal");
    assert_eq!(parsed.max_rows, 100);
}

#[test]
fn truncated_messages_error_out() {
    assert!(QueryMessage::parse(b"SELECT 1").is_err()); // no terminator
    assert!(ExecuteMessage::parse(b"p\0").is_err()); // missing max rows
}

#[test]
fn sasl_initial_response_parses() {
    let mut body = BytesMut::new();
    body.put_slice(b"SCRAM-SHA-256\0");
    let data = b"n,,n=,r=nonce";
    body.put_i32(data.len() as i32);
    body.put_slice(data);
    let parsed = SaslInitialResponse::parse(&body).unwrap();
    assert_eq!(parsed.mechanism, "SCRAM-SHA-256");
    assert_eq!(parsed.data, data.to_vec());

    let response = SaslResponse::parse(b"c=biws,r=x,p=y").unwrap();
    assert_eq!(response.data, b"c=biws,r=x,p=y".to_vec());
}

#[test]
fn error_response_layout() {
    let body = error_response("boom");
    assert_eq!(&body[..], b"SERROR\0CSQL-0000\0Mboom\0\0");
}

#[test]
fn data_row_encodes_nulls_as_minus_one() {
    let values = vec![
        PgTextValue {
            oid: 25,
            data: Some(b"x".to_vec()),
        },
        PgTextValue {
            oid: 25,
            data: None,
        },
    ];
    let body = data_row(&values);
    let mut expected = BytesMut::new();
    expected.put_i16(2);
    expected.put_i32(1);
    expected.put_slice(b"x");
    expected.put_i32(-1);
    assert_eq!(body, expected);
}

#[test]
fn row_description_from_engine_columns() {
    let columns = vec![
        ("id".to_string(), "INTEGER".to_string()),
        ("name".to_string(), "VARCHAR".to_string()),
    ];
    let body = row_description_from_columns(&columns).unwrap();
    // column count, then per-field: name, 4+2 zero bytes, oid, 2+4+2 zero bytes.
    assert_eq!(i16::from_be_bytes([body[0], body[1]]), 2);
    let oid_pos = 2 + 3 + 4 + 2;
    assert_eq!(
        i32::from_be_bytes([
            body[oid_pos],
            body[oid_pos + 1],
            body[oid_pos + 2],
            body[oid_pos + 3]
        ]),
        21
    );

    let unmapped = vec![("b".to_string(), "BLOB".to_string())];
    assert!(row_description_from_columns(&unmapped).is_err());
}

#[test]
fn copy_in_response_is_all_text() {
    let body = copy_in_response(3);
    assert_eq!(body[0], 0);
    assert_eq!(i16::from_be_bytes([body[1], body[2]]), 3);
    assert_eq!(body.len(), 1 + 2 + 3 * 2);
}

#[test]
fn auth_bodies_carry_selectors() {
    let body = auth_sasl(&["SCRAM-SHA-256"]);
    assert_eq!(i32::from_be_bytes([body[0], body[1], body[2], body[3]]), 10);
    assert_eq!(&body[4..], b"SCRAM-SHA-256\0\0");

    let body = auth_sasl_continue("r=abc,s=salt,i=4096");
    assert_eq!(i32::from_be_bytes([body[0], body[1], body[2], body[3]]), 11);

    let body = auth_sasl_final("v=sig");
    assert_eq!(i32::from_be_bytes([body[0], body[1], body[2], body[3]]), 12);
}

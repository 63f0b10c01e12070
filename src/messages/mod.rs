//! PostgreSQL wire protocol messages: the framed codec, request parsers
//! and response builders.

pub mod backend;
pub mod frontend;
pub mod wire;

pub use backend::*;
pub use frontend::*;
pub use wire::{FirstMessage, Frame, Wire, WIRE_BUFFER_SIZE};

// Frames are `<tag:1><length:4 big-endian><body:length-4>`.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

// Used in the StartupMessage to indicate regular handshake.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;

// SSLRequest: used to indicate the client wants an SSL connection.
pub const SSL_REQUEST_CODE: i32 = 80877103;

// CancelRequest: the cancel request code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// Inbound tags.
pub const TAG_QUERY: u8 = b'Q';
pub const TAG_PARSE: u8 = b'P';
pub const TAG_BIND: u8 = b'B';
pub const TAG_DESCRIBE: u8 = b'D';
pub const TAG_EXECUTE: u8 = b'E';
pub const TAG_SYNC: u8 = b'S';
pub const TAG_TERMINATE: u8 = b'X';
pub const TAG_COPY_DATA: u8 = b'd';
pub const TAG_COPY_DONE: u8 = b'c';
pub const TAG_COPY_FAIL: u8 = b'f';
pub const TAG_PASSWORD: u8 = b'p';

// Outbound tags.
pub const TAG_AUTHENTICATION: u8 = b'R';
pub const TAG_BACKEND_KEY_DATA: u8 = b'K';
pub const TAG_PARAMETER_STATUS: u8 = b'S';
pub const TAG_READY_FOR_QUERY: u8 = b'Z';
pub const TAG_ROW_DESCRIPTION: u8 = b'T';
pub const TAG_DATA_ROW: u8 = b'D';
pub const TAG_COMMAND_COMPLETE: u8 = b'C';
pub const TAG_EMPTY_QUERY_RESPONSE: u8 = b'I';
pub const TAG_ERROR_RESPONSE: u8 = b'E';
pub const TAG_NO_DATA: u8 = b'n';
pub const TAG_PARSE_COMPLETE: u8 = b'1';
pub const TAG_BIND_COMPLETE: u8 = b'2';
pub const TAG_PARAMETER_DESCRIPTION: u8 = b't';
pub const TAG_COPY_IN_RESPONSE: u8 = b'G';

// Selectors carried in authentication-family messages.
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;

// ReadyForQuery transaction status bytes.
pub const TRANSACTION_STATUS_IDLE: u8 = b'I';

#[cfg(test)]
mod tests;

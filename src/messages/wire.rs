//! The framed codec. Owns the buffered reader and a reusable pair of
//! buffers; enforces the at-most-one-live-message discipline by skipping
//! any unread tail of the previous frame before reading the next one.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};

use bytes::{BufMut, BytesMut};

use crate::errors::Error;
use crate::messages::{
    CANCEL_REQUEST_CODE, MAX_MESSAGE_SIZE, PROTOCOL_VERSION_NUMBER, SSL_REQUEST_CODE,
    TAG_AUTHENTICATION,
};

pub const WIRE_BUFFER_SIZE: usize = 4096;
const READ_AHEAD: usize = 1024 * 1024;

/// The untagged first frame of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstMessage {
    Startup(HashMap<String, String>),
    CancelRequest([u8; 8]),
}

/// Header of a tagged frame. The length includes its own four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub len: i32,
}

pub struct Wire<S: Read + Write> {
    stream: BufReader<S>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Bytes of the current frame's body not yet handed to a consumer.
    unread: usize,
}

impl<S: Read + Write> Wire<S> {
    pub fn new(stream: S) -> Self {
        Wire {
            stream: BufReader::with_capacity(READ_AHEAD, stream),
            read_buf: BytesMut::with_capacity(WIRE_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(WIRE_BUFFER_SIZE),
            unread: 0,
        }
    }

    /// Queues a tagged frame for writing.
    pub fn send(&mut self, tag: u8, body: &[u8]) {
        self.write_buf.put_u8(tag);
        self.write_buf.put_i32(body.len() as i32 + 4);
        self.write_buf.put_slice(body);
    }

    pub fn send_auth_ok(&mut self) {
        self.send(TAG_AUTHENTICATION, &0i32.to_be_bytes());
    }

    /// Writes out everything queued so far.
    pub fn flush(&mut self) -> Result<(), Error> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let buf = self.write_buf.split();
        self.stream.get_mut().write_all(&buf)?;
        self.stream.get_mut().flush()?;
        Ok(())
    }

    fn read_i32(&mut self) -> Result<i32, Error> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Reads the first, untagged frame: `<length:4><version:4><payload>`.
    /// An SSLRequest is declined with a single `'N'` and the next first
    /// frame is read in its place.
    pub fn read_first_message(&mut self) -> Result<FirstMessage, Error> {
        loop {
            self.flush()?;
            let len = self.read_i32().map_err(|_| Error::ClientBadStartup)?;
            if !(8..=MAX_MESSAGE_SIZE).contains(&len) {
                return Err(Error::ClientBadStartup);
            }
            let mut body = vec![0u8; len as usize - 4];
            self.stream
                .read_exact(&mut body)
                .map_err(|_| Error::ClientBadStartup)?;
            let version = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            match version {
                PROTOCOL_VERSION_NUMBER => {
                    return Ok(FirstMessage::Startup(parse_startup_parameters(&body[4..])))
                }
                CANCEL_REQUEST_CODE => {
                    if body.len() < 12 {
                        return Err(Error::ClientBadStartup);
                    }
                    let mut key = [0u8; 8];
                    key.copy_from_slice(&body[4..12]);
                    return Ok(FirstMessage::CancelRequest(key));
                }
                SSL_REQUEST_CODE => {
                    // SSL is not supported; decline and read the real
                    // startup message.
                    self.stream.get_mut().write_all(b"N")?;
                    self.stream.get_mut().flush()?;
                }
                _ => {
                    return Err(Error::ProtocolSyncError("invalid version".to_string()));
                }
            }
        }
    }

    /// Reads the next frame header, discarding any unread tail of the
    /// previous frame first.
    pub fn read_frame(&mut self) -> Result<Frame, Error> {
        self.flush()?;
        self.skip_unread()?;
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header)?;
        let tag = header[0];
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if len < 4 {
            return Err(Error::ProtocolSyncError(format!(
                "message length is too small: {len}"
            )));
        }
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::ProtocolSyncError(format!(
                "message length is too large: {len}"
            )));
        }
        self.unread = len as usize - 4;
        Ok(Frame { tag, len })
    }

    /// Reads a frame and requires an exact tag.
    pub fn expect_frame(&mut self, tag: u8) -> Result<Frame, Error> {
        let frame = self.read_frame()?;
        if frame.tag != tag {
            return Err(Error::ProtocolSyncError(format!(
                "message type not match: expected '{}', got '{}'",
                tag as char, frame.tag as char
            )));
        }
        Ok(frame)
    }

    /// Buffers the whole body of the current frame. Bodies that fit the
    /// reusable buffer are read in place; larger ones take a fresh
    /// allocation.
    pub fn read_body(&mut self) -> Result<BytesMut, Error> {
        let n = self.unread;
        self.read_buf.clear();
        self.read_buf.resize(n, 0);
        self.stream.read_exact(&mut self.read_buf[..n])?;
        self.unread = 0;
        Ok(self.read_buf.split_to(n))
    }

    /// Serves up to `out.len()` bytes of the current frame's body.
    /// Returns 0 once the body is exhausted.
    pub fn read_chunk(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.unread == 0 || out.is_empty() {
            return Ok(0);
        }
        let want = out.len().min(self.unread);
        self.stream.read_exact(&mut out[..want])?;
        self.unread -= want;
        Ok(want)
    }

    /// Bytes of the current frame's body still unread.
    pub fn remaining_body(&self) -> usize {
        self.unread
    }

    fn skip_unread(&mut self) -> Result<(), Error> {
        if self.unread == 0 {
            return Ok(());
        }
        let n = self.unread as u64;
        let copied = std::io::copy(&mut (&mut self.stream).take(n), &mut std::io::sink())?;
        if copied != n {
            return Err(Error::SocketError(
                "connection closed while skipping message body".to_string(),
            ));
        }
        self.unread = 0;
        Ok(())
    }
}

/// Null-terminated key/value pairs terminated by an empty key.
pub(crate) fn parse_startup_parameters(data: &[u8]) -> HashMap<String, String> {
    let mut parameters = HashMap::new();
    let mut current_key: Option<String> = None;
    let mut last = 0usize;
    for (i, &b) in data.iter().enumerate() {
        if b != 0 {
            continue;
        }
        if i == last {
            break;
        }
        let field = String::from_utf8_lossy(&data[last..i]).into_owned();
        match current_key.take() {
            None => current_key = Some(field),
            Some(key) => {
                parameters.insert(key, field);
            }
        }
        last = i + 1;
    }
    parameters
}

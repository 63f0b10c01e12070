//! Parsers for request message bodies. Bodies decode lazily: the codec
//! hands over raw bytes and each message type pulls its fields on demand.

use crate::errors::Error;

/// Bounds-checked reader over a message body.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.pos + len > self.buf.len() {
            return Err(Error::ProtocolSyncError(
                "message payload is truncated".to_string(),
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_i16(&mut self) -> Result<i16, Error> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, Error> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_cstring(&mut self) -> Result<String, Error> {
        let start = self.pos;
        let Some(end) = self.buf[start..].iter().position(|&b| b == 0) else {
            return Err(Error::ProtocolSyncError(
                "cstring terminator missing".to_string(),
            ));
        };
        self.pos = start + end + 1;
        Ok(String::from_utf8_lossy(&self.buf[start..start + end]).into_owned())
    }
}

/// Query ('Q'): the SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub sql: String,
}

impl QueryMessage {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        Ok(QueryMessage {
            sql: r.read_cstring()?,
        })
    }
}

/// Parse ('P'): statement name, SQL, declared parameter OIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessage {
    pub name: String,
    pub sql: String,
    pub param_oids: Vec<i32>,
}

impl ParseMessage {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        let name = r.read_cstring()?;
        let sql = r.read_cstring()?;
        let count = r.read_i16()?.max(0) as usize;
        let mut param_oids = Vec::with_capacity(count);
        for _ in 0..count {
            param_oids.push(r.read_i32()?);
        }
        Ok(ParseMessage {
            name,
            sql,
            param_oids,
        })
    }
}

/// Bind ('B'): portal name, statement name, parameter values.
///
/// Parameter format codes are consumed but ignored; values arrive in the
/// text format and are typed later. A length of -1 is the SQL null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub params: Vec<Option<String>>,
}

impl BindMessage {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        let portal = r.read_cstring()?;
        let statement = r.read_cstring()?;

        let format_count = r.read_i16()?.max(0) as usize;
        for _ in 0..format_count {
            r.read_i16()?;
        }

        let value_count = r.read_i16()?.max(0) as usize;
        let mut params = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let len = r.read_i32()?;
            if len == -1 {
                params.push(None);
            } else if len < -1 {
                return Err(Error::ProtocolSyncError(
                    "bind parameter length is invalid".to_string(),
                ));
            } else {
                let raw = r.read_bytes(len as usize)?;
                params.push(Some(String::from_utf8_lossy(raw).into_owned()));
            }
        }
        // Result-column format codes follow; nothing here needs them.
        Ok(BindMessage {
            portal,
            statement,
            params,
        })
    }
}

/// Describe ('D'): target kind ('S' or 'P') and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeMessage {
    pub target: u8,
    pub name: String,
}

impl DescribeMessage {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        Ok(DescribeMessage {
            target: r.read_u8()?,
            name: r.read_cstring()?,
        })
    }
}

/// Execute ('E'): portal name and row limit (the limit is ignored).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

impl ExecuteMessage {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        Ok(ExecuteMessage {
            portal: r.read_cstring()?,
            max_rows: r.read_i32()?,
        })
    }
}

/// CopyFail ('f'): the client-supplied failure reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailMessage {
    pub message: String,
}

impl CopyFailMessage {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        Ok(CopyFailMessage {
            message: r.read_cstring().unwrap_or_default(),
        })
    }
}

/// The password-family messages all share tag 'p'; during a SASL exchange
/// the first one is an initial response (mechanism + payload) and the
/// following ones are bare payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslInitialResponse {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl SaslInitialResponse {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(body);
        let mechanism = r.read_cstring()?;
        let len = r.read_i32()?;
        let data = if len <= 0 {
            Vec::new()
        } else {
            if len as usize != r.remaining() {
                return Err(Error::ProtocolSyncError(
                    "invalid SASL initial response length".to_string(),
                ));
            }
            r.read_bytes(len as usize)?.to_vec()
        };
        Ok(SaslInitialResponse { mechanism, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslResponse {
    pub data: Vec<u8>,
}

impl SaslResponse {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        Ok(SaslResponse {
            data: body.to_vec(),
        })
    }
}

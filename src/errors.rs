//! Errors.

/// Various errors.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    SocketError(String),
    ClientBadStartup,
    ProtocolSyncError(String),
    EngineError(String),
    AuthError(String),
    ScramError(String),
    ConvertError(String),
    BadConfig(String),
    Canceled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Error::SocketError(msg) => write!(f, "Socket connection error: {msg}"),
            Error::ClientBadStartup => write!(f, "Client sent an invalid startup message"),
            Error::ProtocolSyncError(msg) => write!(f, "Protocol synchronization error: {msg}"),
            Error::EngineError(msg) => write!(f, "{msg}"),
            Error::AuthError(msg) => write!(f, "Authentication failed: {msg}"),
            Error::ScramError(msg) => write!(f, "SCRAM error: {msg}"),
            Error::ConvertError(msg) => write!(f, "Data conversion error: {msg}"),
            Error::BadConfig(msg) => write!(f, "Configuration error: {msg}"),
            Error::Canceled => write!(f, "query canceled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::SocketError(err.to_string())
    }
}

impl From<duckdb::Error> for Error {
    fn from(err: duckdb::Error) -> Self {
        Error::EngineError(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::ConvertError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ConvertError(err.to_string())
    }
}

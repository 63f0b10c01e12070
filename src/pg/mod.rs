//! The PostgreSQL front-end: accept loop, per-connection state machine,
//! and COPY IN ingest.

pub mod connection;
pub mod copy;
pub mod server;

pub use server::{CancelHandle, CancelKey, CancelMap, CancelToken};

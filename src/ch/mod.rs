//! The ClickHouse-style HTTP front-end: request classification, SELECT
//! streaming and INSERT ingest through pluggable format codecs.

pub mod formats;
pub mod server;

pub use server::router;

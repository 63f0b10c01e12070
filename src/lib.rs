pub mod ch;
pub mod cmd_args;
pub mod engine;
pub mod errors;
pub mod logger;
pub mod messages;
pub mod pg;
pub mod scram;
pub mod types;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The server version advertised to PostgreSQL clients.
pub const SERVER_VERSION: &str = "16.0-duckdb-1.0.0";

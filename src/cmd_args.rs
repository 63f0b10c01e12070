use clap::Parser;
use tracing::Level;

/// duckgate: PostgreSQL and ClickHouse wire front-ends for embedded DuckDB.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Postgres listen address.
    #[arg(long, default_value_t = String::from(":5432"), env)]
    pub pg_listen: String,

    /// Clickhouse HTTP listen address.
    #[arg(long, default_value_t = String::from(":8123"), env)]
    pub ch_listen: String,

    /// Path to the database file.
    #[arg(long, default_value_t = String::from("./test.db"), env)]
    pub db_path: String,

    #[arg(long, default_value_t = Level::INFO, env)]
    pub log_level: Level,

    /// Project engine catalogs into a PostgreSQL-compatible shape at startup.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub hack: bool,

    /// Require SCRAM-SHA-256 authentication against the credentials table.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auth: bool,
}

pub fn parse() -> Args {
    Args::parse()
}

/// Listen addresses are accepted in the short `:port` form.
pub fn listen_addr(addr: &str) -> String {
    if let Some(stripped) = addr.strip_prefix(':') {
        format!("0.0.0.0:{stripped}")
    } else {
        addr.to_string()
    }
}

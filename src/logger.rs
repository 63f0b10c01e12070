use crate::cmd_args::Args;
use tracing_subscriber::EnvFilter;

pub fn init(args: &Args) {
    // Initialize a default filter, and then override the builtin default
    // "warning" with our commandline (default: "info").
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use parking_lot::Mutex;
use tokio::runtime::Builder;
#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use duckgate::cmd_args::{self, listen_addr};
use duckgate::engine::{Engine, EngineOptions};
use duckgate::pg::CancelMap;
use duckgate::{ch, logger, pg, VERSION};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cmd_args::parse();
    logger::init(&args);

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    info!("Welcome to duckgate! (Version {VERSION})");

    let engine = match Engine::open(&EngineOptions {
        db_path: args.db_path.clone(),
        hack: args.hack,
        auth: args.auth,
    }) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            error!("Engine error: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };
    info!("Open DuckDB database at {}", args.db_path);

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("worker-duckgate")
        .build()?;

    runtime.block_on(async move {
        let cancel_map: CancelMap = Arc::new(Mutex::new(HashMap::new()));

        let pg_addr = listen_addr(&args.pg_listen);
        let pg_listener = match tokio::net::TcpListener::bind(&pg_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("Listener socket error: {err:?}");
                std::process::exit(exitcode::UNAVAILABLE);
            }
        };
        info!("Listening postgresql wire protocol on {pg_addr}");

        let ch_addr = listen_addr(&args.ch_listen);
        let ch_listener = match tokio::net::TcpListener::bind(&ch_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("Listener socket error: {err:?}");
                std::process::exit(exitcode::UNAVAILABLE);
            }
        };
        info!("Listening clickhouse http protocol on {ch_addr}");

        let ch_router = ch::router(engine.clone());
        tokio::task::spawn(async move {
            if let Err(err) = axum::serve(ch_listener, ch_router).await {
                error!("Clickhouse http server error: {err}");
                std::process::exit(exitcode::SOFTWARE);
            }
        });

        let pg_engine = engine.clone();
        let pg_cancel_map = cancel_map.clone();
        tokio::task::spawn(async move {
            pg::server::run(pg_listener, pg_engine, pg_cancel_map).await;
        });

        wait_for_shutdown().await;
        info!("Shutting down...");
    });

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    let mut term_signal = unix_signal(SignalKind::terminate()).unwrap();
    let mut interrupt_signal = unix_signal(SignalKind::interrupt()).unwrap();
    tokio::select! {
        _ = term_signal.recv() => info!("Got SIGTERM"),
        _ = interrupt_signal.recv() => info!("Got SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

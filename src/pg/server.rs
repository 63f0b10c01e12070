//! The accept loop and the process-wide cancel-key registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::engine::Engine;
use crate::pg::connection;

/// Per-connection 8-byte secret by which a cancel-request connection
/// identifies its target.
pub type CancelKey = [u8; 8];

pub type CancelToken = Arc<AtomicBool>;

/// The cancellation slot of one connection. A token lives in the slot
/// only while a query is in flight; tripping an empty slot is a no-op.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<Mutex<Option<CancelToken>>>,
}

impl CancelHandle {
    pub fn arm(&self) -> CancelToken {
        let token: CancelToken = Arc::new(AtomicBool::new(false));
        *self.inner.lock() = Some(token.clone());
        token
    }

    pub fn disarm(&self) {
        *self.inner.lock() = None;
    }

    pub fn trip(&self) {
        if let Some(token) = self.inner.lock().as_ref() {
            token.store(true, Ordering::SeqCst);
        }
    }
}

pub type CancelMap = Arc<Mutex<HashMap<CancelKey, CancelHandle>>>;

/// Accepts PostgreSQL connections and serves each on its own worker
/// thread. The worker owns its engine connection exclusively.
pub async fn run(listener: TcpListener, engine: Arc<Engine>, cancel_map: CancelMap) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("accept error: {err:?}");
                continue;
            }
        };
        let _ = socket.set_nodelay(true);
        let stream = match socket.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
        }) {
            Ok(stream) => stream,
            Err(err) => {
                error!("cannot hand off client socket: {err:?}");
                continue;
            }
        };

        debug!("Client {addr:?} connected");
        let engine = engine.clone();
        let cancel_map = cancel_map.clone();
        tokio::task::spawn_blocking(move || {
            match connection::handle(stream, engine, cancel_map) {
                Ok(()) => debug!("Client {addr:?} disconnected"),
                Err(err) => warn!("Client {addr:?} disconnected with error: {err}"),
            }
        });
    }
}

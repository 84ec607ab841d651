//! The strata window server.
//!
//! Wiring: [`Server`] owns the socket loop and the compositor table;
//! [`ServerState`] owns layers, client sessions, and surfaces and
//! implements every built-in request; [`Dispatcher`] carries
//! application-registered handlers outside the system id band.

mod client;
mod config;
mod dispatch;
mod error;
mod layer;
mod server;

pub use client::{ClientPhase, ClientRecord};
pub use config::ServerConfig;
pub use dispatch::{Dispatcher, Handler, Reply, ServerState, SurfaceTable};
pub use error::ServerError;
pub use layer::{Layer, LayerTable, DEFAULT_LAYER_NAME};
pub use server::Server;

use std::sync::atomic::{AtomicU64, Ordering};

/// A process-unique shared-memory object name.
pub(crate) fn unique_shm_name(kind: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("/strata-{}-{}-{}", kind, std::process::id(), seq)
}

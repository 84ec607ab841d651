//! The compositor table and selection.

use std::sync::Mutex;

use thiserror::Error;

use crate::ops::{CompositorContext, CompositorOps};

/// Maximum number of simultaneously registered compositors, the built-in
/// fallback included.
pub const MAX_COMPOSITORS: usize = 8;

/// Name the built-in fallback compositor registers under.
pub const FALLBACK_NAME: &str = "fallback";

/// Errors from compositor registration and selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompositorError {
    /// The table already holds [`MAX_COMPOSITORS`] entries.
    #[error("compositor table is full")]
    TableFull,
    /// A compositor with this name is already registered.
    #[error("compositor {0:?} is already registered")]
    Duplicate(String),
    /// No compositor with this name is registered.
    #[error("no compositor named {0:?}")]
    Unknown(String),
    /// The fallback and the active compositor cannot be unregistered.
    #[error("compositor {0:?} cannot be unregistered")]
    Pinned(String),
}

struct Inner {
    table: Vec<(String, Box<dyn CompositorOps + Send>)>,
    active: usize,
}

/// Owns every registered compositor and the active selection.
///
/// One mutex guards both the table and the active compositor, so a
/// selection (terminate, initialize, refresh, swap) can never interleave
/// with damage dispatch running through [`CompositorManager::with_active`].
pub struct CompositorManager {
    inner: Mutex<Inner>,
}

impl CompositorManager {
    /// A manager holding only `fallback`, which starts active.  The
    /// fallback is registered under [`FALLBACK_NAME`] regardless of what
    /// its `name()` says.
    pub fn new(fallback: Box<dyn CompositorOps + Send>) -> CompositorManager {
        CompositorManager {
            inner: Mutex::new(Inner {
                table: vec![(FALLBACK_NAME.to_owned(), fallback)],
                active: 0,
            }),
        }
    }

    /// Registers a compositor under `name`.
    pub fn register(
        &self,
        name: &str,
        ops: Box<dyn CompositorOps + Send>,
    ) -> Result<(), CompositorError> {
        let mut inner = self.inner.lock().expect("compositor table poisoned");
        if inner.table.iter().any(|(n, _)| n == name) {
            return Err(CompositorError::Duplicate(name.to_owned()));
        }
        if inner.table.len() >= MAX_COMPOSITORS {
            return Err(CompositorError::TableFull);
        }
        log::info!("compositor {:?} registered", name);
        inner.table.push((name.to_owned(), ops));
        Ok(())
    }

    /// Unregisters a compositor.  The fallback and the active compositor
    /// are refused.
    pub fn unregister(&self, name: &str) -> Result<(), CompositorError> {
        let mut inner = self.inner.lock().expect("compositor table poisoned");
        let pos = inner
            .table
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| CompositorError::Unknown(name.to_owned()))?;
        if name == FALLBACK_NAME || pos == inner.active {
            return Err(CompositorError::Pinned(name.to_owned()));
        }
        inner.table.remove(pos);
        if pos < inner.active {
            inner.active -= 1;
        }
        log::info!("compositor {:?} unregistered", name);
        Ok(())
    }

    /// The active compositor's registered name.
    pub fn active_name(&self) -> String {
        let inner = self.inner.lock().expect("compositor table poisoned");
        inner.table[inner.active].0.clone()
    }

    /// Makes `name` the active compositor.  Selecting the active one is a
    /// no-op.  Otherwise: the outgoing compositor's `terminate` runs and
    /// its per-record private data is purged, then the incoming one's
    /// `initialize` runs, the active pointer swaps, and `refresh` redraws
    /// the screen.  All under the table lock, so damage dispatch never
    /// sees a half-switched compositor.
    pub fn select(&self, ctx: &CompositorContext<'_>, name: &str) -> Result<(), CompositorError> {
        let mut inner = self.inner.lock().expect("compositor table poisoned");
        let pos = inner
            .table
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| CompositorError::Unknown(name.to_owned()))?;
        if pos == inner.active {
            return Ok(());
        }
        let old = inner.active;
        inner.table[old].1.terminate(ctx);
        if let Err(err) = ctx.registry.purge_private_data(|idx, data| {
            log::debug!("purged private data {:#x} of record {}", data, idx);
        }) {
            log::warn!("private-data purge failed: {}", err);
        }
        inner.table[pos].1.initialize(ctx);
        inner.active = pos;
        inner.table[pos].1.refresh(ctx);
        log::info!(
            "active compositor switched from {:?} to {:?}",
            inner.table[old].0,
            name
        );
        Ok(())
    }

    /// Runs `f` against the active compositor, holding the table lock so
    /// the selection cannot change underneath it.
    pub fn with_active<R>(&self, f: impl FnOnce(&mut dyn CompositorOps) -> R) -> R {
        let mut inner = self.inner.lock().expect("compositor table poisoned");
        let active = inner.active;
        f(inner.table[active].1.as_mut())
    }
}

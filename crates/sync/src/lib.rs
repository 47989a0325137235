//! Per-type propagation engine: placement, overrides, version records,
//! status, and the sync controller that orchestrates them across clusters.

#![forbid(unsafe_code)]

pub mod controller;
pub mod overrides;
pub mod placement;
pub mod status;
pub mod version;

pub use controller::{start_sync_controller, SyncController, SYNC_FINALIZER};

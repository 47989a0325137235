//! Watch caches and reconcile workers driving the federation controllers.

#![forbid(unsafe_code)]

pub mod informer;
pub mod worker;

pub use informer::{EventFilter, Informer, StoreHandle};
pub use worker::{ReconcileStatus, ReconcileWorker, WorkerOptions};

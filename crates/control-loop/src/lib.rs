//! Event routing and worker pool for multi-target Kubernetes controllers
//!
//! Watches feed [`ObjectEvent`]s through an [`EventFilter`] and a
//! [`FanOutRouter`] into a deduplicating [`WorkQueue`]. A [`Controller`] runs
//! a bounded pool of workers draining the queue into a [`Reconciler`], never
//! running the same target twice at once.

pub mod backoff;
pub mod controller;
pub mod error;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod router;
mod source;

pub use backoff::{ExponentialBackoff, ItemBackoff};
pub use controller::{Controller, ControllerOptions, Reconciler};
pub use error::ControlLoopError;
pub use event::ObjectEvent;
pub use filter::{EventFilter, ManagedByFilter};
pub use metrics::ControllerMetrics;
pub use queue::WorkQueue;
pub use request::ReconcileRequest;
pub use router::{FanOutRouter, TargetRegistry};

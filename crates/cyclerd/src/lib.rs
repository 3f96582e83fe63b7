//! Battery-cycler fleet daemon.
//!
//! `cyclerd` owns a set of cycler devices, exposes them as named pipelines,
//! and schedules queued measurement jobs onto whichever pipeline becomes
//! eligible. Clients talk to it through the serialized command service; the
//! daemon loop in [`daemon`] is the single writer to all live state.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod ops;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod sink;

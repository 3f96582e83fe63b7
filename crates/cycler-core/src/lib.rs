//! Core types and traits shared by the cycler fleet daemon and its drivers.
//!
//! This crate holds everything both sides of the driver boundary need to
//! agree on: the job/pipeline/payload data model, the typed error enum, the
//! instrument driver contract, the bounded retry policy, the cross-process
//! device lock, and the request/reply command envelope.

pub mod devlock;
pub mod driver;
pub mod error;
pub mod job;
pub mod payload;
pub mod pipeline;
pub mod request;
pub mod retry;

pub use error::{CyclerError, CyclerResult, ErrorKind};

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Garbage-collection leases scoped to a request context.
//!
//! A content store only keeps objects that something still references. Long
//! running client operations (pulling an image, preparing a snapshot) take a
//! lease first so that half-written content is not collected underneath
//! them. [`LeaseScope`] creates that lease on demand, attaches its ID to the
//! [`Context`], and hands back a [`Release`] for the caller to invoke when
//! the operation is over.

pub mod config;
pub mod context;
pub mod error;
pub mod lease;
pub mod memory;
pub mod scope;
pub mod service;

pub mod test_utils;

pub use config::ScopeConfig;
pub use context::{CancelHandle, Context};
pub use error::{Error, Result, ServiceError};
pub use lease::{DeleteOpt, Filter, Lease, LeaseId, LeaseOpt, Resource};
pub use scope::{LeaseScope, Release};
pub use service::{from_context, with_lease, LeaseService};

//! Client-side data synchronization for the operator console.
//!
//! The building blocks, bottom up:
//! - [`coordinator`]: one in-flight request per key, shared by every caller
//! - [`cache`]: stale-while-revalidate values with durable snapshots
//! - [`pagination`]: cursor pages that reset when filters change
//! - [`polling`]: adaptive poll loops owned by a handle
//! - [`metrics`]: pure derivations for charts
//!
//! [`api`] and [`app`] wire them to the console backend.

pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pagination;
pub mod polling;

//! labwarden: isolated lab provisioning for untrusted tenants.
//!
//! Two processes share this library. `labwarden netd` is the only
//! privileged piece: it owns bridges, TAP devices and NAT rules, and speaks
//! NDJSON over a Unix socket. `labwarden serve` runs the lifecycle manager,
//! the reconciliation worker and the HTTP API unprivileged, reaching the
//! host network only through netd.

pub mod api;
pub mod config;
pub mod error;
pub mod lab;
pub mod logging;
pub mod netd;
pub mod recipe;
pub mod reconcile;
pub mod runtime;
pub mod vm;
pub mod wire;

pub use error::{LabError, LabResult};

#![deny(missing_docs)]

//! Shared configuration, error types, ids, caller identity, and observability
//! primitives for keymux crates.
//!
//! Architecture role:
//! - defines planner/tablet configuration passed across layers
//! - provides common [`KmxError`] / [`Result`] contracts with RPC code mapping
//! - hosts caller identity and per-request cancellation context
//! - hosts metrics and optional exporter utilities
//!
//! Key modules:
//! - [`callerid`]
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

/// Caller identity and request cancellation context.
pub mod callerid;
/// Shared planner/tablet configuration types.
pub mod config;
/// Shared error taxonomy and RPC code mapping.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;
#[cfg(feature = "profiling")]
/// Optional HTTP metrics exporter.
pub mod metrics_exporter;

pub use callerid::{principal, username, CallerId, GatewayCallerId, RequestContext};
pub use config::{PlannerConfig, TabletConfig};
pub use error::{ErrorCode, KmxError, Result};
pub use ids::ConnId;
pub use metrics::{global_metrics, MetricsRegistry, USER_LABEL_DISABLED};
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;

//! Prometheus exporter for Varnish.
//!
//! ## Basics
//!
//! `varnishprom` runs as a sidecar next to a Varnish cache. It periodically
//! polls `varnishadm` and `varnishstat`, normalizes the opaque hierarchical
//! counter keys into labeled metric families, and tails `varnishlog` for
//! ad hoc counters that operators emit from VCL routing logic. The result
//! is served on an HTTP endpoint in the Prometheus text exposition format.
//!
//! ## Behavior
//!
//! This exporter makes some explicit trade-offs to accomplish its task:
//!
//! - Backend counter keys are decomposed into a stable metric name plus
//!   `backend`/`director`/`type` labels; the addressing scheme (plain, goto,
//!   udo) decides how.
//! - `fail_*` sub-counters fold into a single family with a `fail` label to
//!   bound family cardinality.
//! - Gauge label-instances not observed in the latest poll generation are
//!   evicted, so decommissioned backends do not leak series forever.
//!   Counter instances are never evicted.
//! - Values are not aggregated, rated, or persisted; that is the scrape
//!   side's job.
//!
//! The stats poller and the log tailer run as independent tasks and share
//! nothing but the metric registry, which is safe for concurrent use from
//! both.

pub mod admin;
pub mod classify;
pub mod common;
pub mod formatting;
pub mod poller;
pub mod registry;
pub mod server;
pub mod staleness;
pub mod stats;
pub mod tailer;

pub use self::classify::{BackendAddressing, CanonicalMetric, Classifier};
pub use self::common::{
    ClassifyError, RawCounter, RegistryError, SourceError, StatKind, StatsSchema, TailError,
};
pub use self::registry::{CounterFamily, GaugeFamily, MetricStore};

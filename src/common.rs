use std::time::Duration;

use thiserror::Error;

/// Namespace of backend counters in the varnishstat dump.
pub const BACKEND_NAMESPACE: &str = "VBE";

/// Prefix of every metric derived from polled statistics.
pub const STATS_PREFIX: &str = "varnish_stats_";

/// Prefix of every counter driven by varnishlog directive lines.
pub const LOG_PREFIX: &str = "varnish_log_";

/// Backend label value substituted when the collapse pattern matches a
/// director, so ephemeral per-instance backends share one series.
pub const COLLAPSED_BACKEND: &str = "collapsed";

/// Upper bound on any single varnishadm/varnishstat/varnishlog invocation.
/// A hung subprocess must not block every future poll cycle.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of a polled statistic, from the dump's `c`/`g` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Counter,
    Gauge,
}

/// One entry of a varnishstat snapshot, uniform across dump schemas.
///
/// Ephemeral: a fresh set is decoded on every poll cycle. `format` is
/// informational only and never used for computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCounter {
    pub key: String,
    pub kind: StatKind,
    pub value: u64,
    pub description: String,
    pub format: Option<String>,
}

/// Which varnishstat dump schema the running Varnish speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSchema {
    /// 6.0.x line-oriented `key value rate description` text.
    LegacyText,
    /// Self-describing JSON object with a version tag and a counters map.
    Json,
}

impl StatsSchema {
    /// The 6.0 release line still emits the line-oriented dump; everything
    /// newer is self-describing JSON. The check is anchored on the release
    /// token so 7.6.0 or a future 16.0.x never reads as legacy.
    pub fn for_version(version: &str) -> Self {
        if version.starts_with("varnish-6.0") {
            StatsSchema::LegacyText
        } else {
            StatsSchema::Json
        }
    }
}

/// Failures of the external stat/admin sources. All of these abandon the
/// current poll cycle; the next tick retries from scratch.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to run `{command}`: {source}")]
    Unavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("could not decode stats payload: {0}")]
    Schema(String),
}

/// A single key matched a backend-scheme prefix but not the shape the
/// scheme requires. The key is skipped; the cycle continues.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("key {key:?} matched the {scheme} prefix but not its shape")]
    Shape { key: String, scheme: &'static str },
}

/// Registry invariant violations. A conflict means the classifier produced
/// two different label schemas for one metric name, which is unrecoverable
/// on the poll path.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("metric {name} already registered with labels {existing:?}, got {requested:?}")]
    Conflict {
        name: String,
        existing: Vec<String>,
        requested: Vec<String>,
    },
}

/// Failures of the varnishlog tail task. Fatal to that task only; the
/// stats poller is unaffected.
#[derive(Error, Debug)]
pub enum TailError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("log stream ended")]
    StreamLost,

    #[error("error reading log stream: {0}")]
    Read(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_sniffing_follows_release_line() {
        assert_eq!(
            StatsSchema::for_version("varnish-6.0.12"),
            StatsSchema::LegacyText
        );
        assert_eq!(
            StatsSchema::for_version("varnish-7.4.2"),
            StatsSchema::Json
        );
        assert_eq!(StatsSchema::for_version("varnish-6.6.1"), StatsSchema::Json);
        // A 6.0 elsewhere in the version must not read as the legacy line.
        assert_eq!(StatsSchema::for_version("varnish-7.6.0"), StatsSchema::Json);
        assert_eq!(
            StatsSchema::for_version("varnish-16.0.1"),
            StatsSchema::Json
        );
    }
}

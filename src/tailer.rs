//! varnishlog tailer.
//!
//! Operators can emit ad hoc counters from VCL by logging a directive such
//! as `std.log("prom=orders_total region=eu,tier=gold")`. The tailer
//! streams `varnishlog -i VCL_Log`, extracts those directives, and bumps
//! the matching counters in the shared registry.

use std::process::Stdio;

use indexmap::IndexMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::common::{TailError, LOG_PREFIX};
use crate::registry::MetricStore;

const DEFAULT_HELP: &str = "Varnishlog counter";

/// One parsed directive line.
#[derive(Debug, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub help: String,
    pub labels: IndexMap<String, String>,
}

/// Extracts a directive from a log line, given the precomputed `marker=`
/// token. Returns `None` for lines without a directive or with nothing
/// usable in one; malformed `k=v` pairs are dropped individually. A `desc`
/// pair becomes the counter's help text instead of a label.
pub fn parse_directive(line: &str, marker_eq: &str) -> Option<Directive> {
    let start = line.find(marker_eq)?;
    let extracted = &line[start + marker_eq.len()..];

    let (name, rest) = match extracted.split_once(' ') {
        Some((name, rest)) => (name.trim(), rest.trim()),
        None => (extracted.trim(), ""),
    };
    if name.is_empty() {
        return None;
    }

    let mut help = DEFAULT_HELP.to_string();
    let mut labels = IndexMap::new();
    if !rest.is_empty() {
        for pair in rest.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            if key == "desc" {
                help = value.to_string();
                continue;
            }
            labels.insert(key.to_string(), value.to_string());
        }
    }

    Some(Directive {
        name: name.to_string(),
        help,
        labels,
    })
}

/// Consumes the varnishlog stream until it ends. Stream loss is fatal to
/// this task only; the stats poller keeps running.
pub async fn run_log_tailer(store: MetricStore, marker: String) -> Result<(), TailError> {
    let command = "varnishlog -i VCL_Log";
    let mut child = Command::new("varnishlog")
        .args(["-i", "VCL_Log"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TailError::Spawn {
            command: command.to_string(),
            source,
        })?;
    let stdout = child.stdout.take().ok_or(TailError::StreamLost)?;

    info!(marker = %marker, "starting varnishlog tailer");
    let marker_eq = format!("{marker}=");
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await? {
        let Some(directive) = parse_directive(&line, &marker_eq) else {
            continue;
        };

        let name = format!("{LOG_PREFIX}{}", directive.name);
        let label_names: Vec<&str> = directive.labels.keys().map(String::as_str).collect();
        let label_values: Vec<&str> = directive.labels.values().map(String::as_str).collect();

        // Directives are operator input: a label-schema conflict here is
        // treated as a malformed line, not a process-fatal inconsistency.
        match store.counter(&name, &directive.help, &label_names) {
            Ok(family) => family.increment(&label_values),
            Err(err) => warn!(line = %line, %err, "directive conflicts with existing counter, skipping"),
        }
    }

    Err(TailError::StreamLost)
}

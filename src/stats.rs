//! Stats source adapter.
//!
//! Invokes `varnishstat` and decodes its dump into a uniform
//! [`RawCounter`] sequence. Two dump schemas exist in the wild: the 6.0
//! line-oriented text dump and the newer self-describing JSON object. Both
//! normalize to the same records so everything downstream stays
//! schema-agnostic.

use std::collections::HashMap;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::common::{RawCounter, SourceError, StatKind, StatsSchema, COMMAND_TIMEOUT};

/// Runs an external command to completion with a bounded timeout, returning
/// its stdout. Used for varnishstat, varnishadm, and the git check.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<String, SourceError> {
    let command = format!("{} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match time::timeout(COMMAND_TIMEOUT, child).await {
        Ok(result) => result.map_err(|source| SourceError::Unavailable {
            command: command.clone(),
            source,
        })?,
        Err(_) => {
            return Err(SourceError::TimedOut {
                command,
                timeout: COMMAND_TIMEOUT,
            })
        }
    };

    if !output.status.success() {
        return Err(SourceError::Failed {
            command,
            status: output.status,
        });
    }

    String::from_utf8(output.stdout).map_err(|e| SourceError::Schema(e.to_string()))
}

/// Fetches one snapshot. Any failure abandons the whole cycle; there are
/// never partial metric updates from a half-decoded dump.
pub async fn fetch_snapshot(schema: StatsSchema) -> Result<Vec<RawCounter>, SourceError> {
    match schema {
        StatsSchema::LegacyText => {
            let payload = run_command("varnishstat", &["-1"]).await?;
            parse_legacy_dump(&payload)
        }
        StatsSchema::Json => {
            let payload = run_command("varnishstat", &["-1", "-j"]).await?;
            parse_json_dump(&payload)
        }
    }
}

#[derive(Deserialize)]
struct JsonCounter {
    description: String,
    flag: String,
    #[serde(default)]
    format: Option<String>,
    value: u64,
}

#[derive(Deserialize)]
struct JsonStats {
    version: u32,
    timestamp: String,
    counters: HashMap<String, JsonCounter>,
}

/// Decodes the self-describing JSON dump (varnishstat 7.x).
pub fn parse_json_dump(payload: &str) -> Result<Vec<RawCounter>, SourceError> {
    let stats: JsonStats =
        serde_json::from_str(payload).map_err(|e| SourceError::Schema(e.to_string()))?;
    debug!(
        schema_version = stats.version,
        timestamp = %stats.timestamp,
        counters = stats.counters.len(),
        "decoded stats dump",
    );

    let mut entries = Vec::with_capacity(stats.counters.len());
    for (key, counter) in stats.counters {
        let kind = match counter.flag.as_str() {
            "c" => StatKind::Counter,
            "g" => StatKind::Gauge,
            flag => {
                debug!(key = %key, flag = %flag, "unknown stat flag, skipping");
                continue;
            }
        };
        entries.push(RawCounter {
            key,
            kind,
            value: counter.value,
            description: counter.description,
            format: counter.format,
        });
    }
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

/// Decodes the legacy line-oriented dump (`key value rate description`).
///
/// The dump interleaves a volatile timestamp pseudo-counter that changes on
/// every invocation; it is stripped before decoding. The text format
/// carries no kind flag, so every legacy entry is exported as a gauge.
pub fn parse_legacy_dump(payload: &str) -> Result<Vec<RawCounter>, SourceError> {
    let mut entries = Vec::new();
    for line in payload.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let key = fields
            .next()
            .ok_or_else(|| SourceError::Schema(format!("unparseable stats line: {line:?}")))?;
        if key.contains("timestamp") {
            continue;
        }
        let value = fields
            .next()
            .ok_or_else(|| SourceError::Schema(format!("stats line without a value: {line:?}")))?
            .parse::<u64>()
            .map_err(|e| SourceError::Schema(format!("bad value in {line:?}: {e}")))?;
        // Third column is the per-second rate; informational only.
        let _rate = fields.next();
        let description = fields.collect::<Vec<_>>().join(" ");

        entries.push(RawCounter {
            key: key.to_string(),
            kind: StatKind::Gauge,
            value,
            description,
            format: None,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_dump_decodes_lines() {
        let payload = concat!(
            "timestamp 1700000000 . Current time\n",
            "VBE.boot.web1.happy 1 0 Happy health probes\n",
            "MAIN.uptime 12345 1.00 Child process uptime\n",
            "\n",
        );
        let entries = parse_legacy_dump(payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "VBE.boot.web1.happy");
        assert_eq!(entries[0].kind, StatKind::Gauge);
        assert_eq!(entries[0].value, 1);
        assert_eq!(entries[0].description, "Happy health probes");
        assert_eq!(entries[1].key, "MAIN.uptime");
        assert_eq!(entries[1].value, 12345);
    }

    #[test]
    fn legacy_dump_rejects_bad_values() {
        assert!(matches!(
            parse_legacy_dump("MAIN.uptime notanumber 1.00 Uptime"),
            Err(SourceError::Schema(_))
        ));
        assert!(matches!(
            parse_legacy_dump("loneword"),
            Err(SourceError::Schema(_))
        ));
    }

    #[test]
    fn json_dump_decodes_counters_and_gauges() {
        let payload = r#"{
            "version": 1,
            "timestamp": "2024-01-01T00:00:00",
            "counters": {
                "MAIN.cache_hit": {
                    "description": "Cache hits",
                    "flag": "c",
                    "format": "i",
                    "value": 41
                },
                "VBE.boot.web1.happy": {
                    "description": "Happy health probes",
                    "flag": "g",
                    "format": "b",
                    "value": 3
                },
                "MAIN.weird": {
                    "description": "Unknown flag",
                    "flag": "x",
                    "format": "i",
                    "value": 1
                }
            }
        }"#;
        let entries = parse_json_dump(payload).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "MAIN.cache_hit");
        assert_eq!(entries[0].kind, StatKind::Counter);
        assert_eq!(entries[0].value, 41);
        assert_eq!(entries[0].format.as_deref(), Some("i"));
        assert_eq!(entries[1].key, "VBE.boot.web1.happy");
        assert_eq!(entries[1].kind, StatKind::Gauge);
    }

    #[test]
    fn json_dump_without_version_tag_is_a_schema_error() {
        let payload = r#"{"counters": {}}"#;
        assert!(matches!(
            parse_json_dump(payload),
            Err(SourceError::Schema(_))
        ));
    }
}

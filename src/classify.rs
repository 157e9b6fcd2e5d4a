//! Stat-key classification.
//!
//! Varnish counter keys are dot-delimited and irregular; backend keys embed
//! their addressing scheme in the path:
//!
//! ```text
//! VBE.boot.goto.00000928.(52.2.2.2).(http://acme.example.com:80).(ttl:10.000000).happy
//! VBE.boot.web_01.happy
//! VBE.boot.udo.acme_udo.(sa4:10.2.3.4:3005).happy
//! MAIN.cache_hit
//! ```
//!
//! `classify` decomposes each raw key into a canonical metric name plus an
//! ordered label set. Scheme precedence is udo, then goto, then plain; the
//! shapes are ambiguous under looser matching.

use regex::Regex;

use crate::common::{
    ClassifyError, RawCounter, StatKind, StatsSchema, BACKEND_NAMESPACE, COLLAPSED_BACKEND,
    STATS_PREFIX,
};

/// How a backend key encodes its topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddressing {
    /// Single static backend; the director is the backend itself.
    Simple { backend: String },
    /// Numbered replica of a director group: a trailing `[-_0-9]+` run was
    /// stripped from the backend name to get the director.
    SimpleDirector { backend: String, director: String },
    /// Dynamically resolved (DNS/goto) backend.
    Goto { resolved: String, director: String },
    /// Explicit socket-address-backed backend (`sa4:`/`sa6:` literal).
    Udo { director: String, address: String },
}

impl BackendAddressing {
    /// Value of the `type` label, keeping the exposition vocabulary of the
    /// exporter's dashboards: `single`, `simple`, `goto`, `udo`.
    pub fn type_label(&self) -> &'static str {
        match self {
            BackendAddressing::Simple { .. } => "single",
            BackendAddressing::SimpleDirector { .. } => "simple",
            BackendAddressing::Goto { .. } => "goto",
            BackendAddressing::Udo { .. } => "udo",
        }
    }

    fn into_backend_director(self) -> (String, String) {
        match self {
            BackendAddressing::Simple { backend } => (backend.clone(), backend),
            BackendAddressing::SimpleDirector { backend, director } => (backend, director),
            BackendAddressing::Goto { resolved, director } => (resolved, director),
            BackendAddressing::Udo { director, address } => (address, director),
        }
    }
}

/// A raw key decomposed into its exported identity. Per-cycle, discarded
/// after the registry write.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMetric {
    pub name: String,
    pub kind: StatKind,
    pub help: String,
    pub label_names: Vec<&'static str>,
    pub label_values: Vec<String>,
}

pub struct Classifier {
    udo_re: Regex,
    goto_re: Regex,
    backend_re: Regex,
    suffix_re: Regex,
    collapse: Option<Regex>,
}

impl Classifier {
    /// `collapse` merges high-cardinality ephemeral backends: when a
    /// director matches it, the backend label is replaced by a sentinel.
    pub fn new(collapse: Option<Regex>) -> Self {
        Classifier {
            udo_re: Regex::new(r"^udo\.(?P<director>[^.(]+)\.\(sa[46]:(?P<address>[^)]+)\)\.(?P<counter>\w+)$")
                .expect("hard-coded pattern"),
            goto_re: Regex::new(
                r"^goto\.[^.(]+\.\((?P<resolved>[^)]+)\)\.\((?P<director>[^)]+)\)(?:\.\([^)]*\))*\.(?P<counter>\w+)$",
            )
            .expect("hard-coded pattern"),
            backend_re: Regex::new(r"^(?P<backend>[^.]+)\.(?P<counter>\w+)$")
                .expect("hard-coded pattern"),
            suffix_re: Regex::new(r"[-_0-9]+$").expect("hard-coded pattern"),
            collapse,
        }
    }

    /// Decomposes one raw counter. `Ok(None)` means the entry is dropped on
    /// purpose (zero-suppressed, or belongs to a superseded VCL); an error
    /// means a backend prefix matched but the key shape did not, which the
    /// caller reports and skips without aborting the cycle.
    pub fn classify(
        &self,
        raw: &RawCounter,
        active_vcl: &str,
        schema: StatsSchema,
    ) -> Result<Option<CanonicalMetric>, ClassifyError> {
        if raw.value == 0 && !zero_exempt(&raw.key) {
            return Ok(None);
        }

        if !raw.key.starts_with(BACKEND_NAMESPACE) || !raw.key[BACKEND_NAMESPACE.len()..].starts_with('.') {
            // Global counter: flatten the hierarchy into the metric name.
            return Ok(Some(CanonicalMetric {
                name: format!("{STATS_PREFIX}{}", raw.key.replace('.', "_")),
                kind: raw.kind,
                help: raw.description.clone(),
                label_names: Vec::new(),
                label_values: Vec::new(),
            }));
        }

        let vcl_prefix = format!("{BACKEND_NAMESPACE}.{active_vcl}.");
        let Some(rest) = raw.key.strip_prefix(&vcl_prefix) else {
            // A superseded VCL still draining; not ours.
            return Ok(None);
        };

        let (addressing, counter) = self.parse_backend(rest, &raw.key)?;
        let type_label = addressing.type_label();
        let (mut backend, director) = addressing.into_backend_director();

        if let Some(collapse) = &self.collapse {
            if collapse.is_match(&director) {
                backend = COLLAPSED_BACKEND.to_string();
            }
        }

        let metric = if let Some(reason) = counter.strip_prefix("fail_") {
            // Fold the failure scenarios into one family; the reason rides
            // in the `fail` label instead of exploding the family count.
            let name = match schema {
                StatsSchema::Json => format!("{STATS_PREFIX}backend_failstate"),
                StatsSchema::LegacyText => format!("{STATS_PREFIX}backend_fail"),
            };
            CanonicalMetric {
                name,
                kind: raw.kind,
                help: raw.description.clone(),
                label_names: vec!["backend", "director", "fail", "type"],
                label_values: vec![
                    backend,
                    director,
                    reason.to_string(),
                    type_label.to_string(),
                ],
            }
        } else {
            CanonicalMetric {
                name: format!("{STATS_PREFIX}backend_{counter}"),
                kind: raw.kind,
                help: raw.description.clone(),
                label_names: vec!["backend", "director", "type"],
                label_values: vec![backend, director, type_label.to_string()],
            }
        };

        Ok(Some(metric))
    }

    /// Applies the scheme precedence to the key remainder after the VCL
    /// segment, returning the addressing and the counter suffix.
    fn parse_backend(
        &self,
        rest: &str,
        key: &str,
    ) -> Result<(BackendAddressing, String), ClassifyError> {
        if rest.starts_with("udo.") {
            let caps = self.udo_re.captures(rest).ok_or_else(|| ClassifyError::Shape {
                key: key.to_string(),
                scheme: "udo",
            })?;
            return Ok((
                BackendAddressing::Udo {
                    director: caps["director"].to_string(),
                    address: caps["address"].to_string(),
                },
                caps["counter"].to_string(),
            ));
        }

        if rest.starts_with("goto.") {
            let caps = self.goto_re.captures(rest).ok_or_else(|| ClassifyError::Shape {
                key: key.to_string(),
                scheme: "goto",
            })?;
            return Ok((
                BackendAddressing::Goto {
                    resolved: caps["resolved"].to_string(),
                    director: caps["director"].to_string(),
                },
                caps["counter"].to_string(),
            ));
        }

        let caps = self.backend_re.captures(rest).ok_or_else(|| ClassifyError::Shape {
            key: key.to_string(),
            scheme: "backend",
        })?;
        let backend = caps["backend"].to_string();
        let counter = caps["counter"].to_string();

        let addressing = match self.suffix_re.find(&backend) {
            Some(suffix) if suffix.start() > 0 => BackendAddressing::SimpleDirector {
                director: backend[..suffix.start()].to_string(),
                backend,
            },
            _ => BackendAddressing::Simple { backend },
        };
        Ok((addressing, counter))
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new(None)
    }
}

/// Zero-valued entries are dropped unless the key's final segment is a
/// health or request-count counter, which must always register.
fn zero_exempt(key: &str) -> bool {
    let last = key.rsplit('.').next().unwrap_or(key);
    last == "req" || last == "happy"
}

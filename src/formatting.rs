//! Prometheus text exposition formatting.
//!
//! ```text
//! # HELP <NAME> <HELP>
//! # TYPE <NAME> <counter|gauge>
//! <NAME>{<LABEL>="<VALUE>",...} <SAMPLE>
//! ```

use indexmap::IndexMap;
use metrics::Key;

/// Splits a registry key into the exposition metric name and its label
/// pairs, merged with the store-wide global labels (a label on the key
/// itself wins over a global one). Pairs come back sorted by label name so
/// rendered output is deterministic.
pub fn key_to_parts(
    key: &Key,
    global_labels: &IndexMap<String, String>,
) -> (String, Vec<(String, String)>) {
    let name = sanitize_metric_name(key.name());
    let mut values = global_labels.clone();
    key.labels().for_each(|label| {
        values.insert(label.key().to_string(), label.value().to_string());
    });
    let mut labels: Vec<(String, String)> = values
        .into_iter()
        .map(|(k, v)| (sanitize_label_name(&k), v))
        .collect();
    labels.sort();

    (name, labels)
}

/// Sanitizes a metric name to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/
pub fn sanitize_metric_name(name: &str) -> String {
    // The first character must be [a-zA-Z_:], and all subsequent characters
    // must be [a-zA-Z0-9_:].
    let mut out = String::with_capacity(name.len());
    let mut is_invalid: fn(char) -> bool = invalid_metric_name_start_character;
    for c in name.chars() {
        if is_invalid(c) {
            out.push('_');
        } else {
            out.push(c);
        }
        is_invalid = invalid_metric_name_character;
    }
    out
}

/// Sanitizes a label name. Label names are a strict subset of metric names:
/// no colons allowed.
pub fn sanitize_label_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut is_invalid: fn(char) -> bool = invalid_label_start_character;
    for c in name.chars() {
        if is_invalid(c) {
            out.push('_');
        } else {
            out.push(c);
        }
        is_invalid = invalid_label_character;
    }
    out
}

/// Escapes a label value for the exposition format: backslash, double
/// quote, and line feed.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Escapes free-text HELP content: backslash and line feed only.
pub fn escape_help(help: &str) -> String {
    let mut out = String::with_capacity(help.len());
    for c in help.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

pub fn write_help_line(buffer: &mut String, name: &str, help: &str) {
    if help.is_empty() {
        return;
    }
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(&escape_help(help));
    buffer.push('\n');
}

pub fn write_type_line(buffer: &mut String, name: &str, mtype: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(mtype);
    buffer.push('\n');
}

pub fn write_sample_line<T>(buffer: &mut String, name: &str, labels: &[(String, String)], value: T)
where
    T: std::fmt::Display,
{
    buffer.push_str(name);

    if !labels.is_empty() {
        buffer.push('{');
        let mut first = true;
        for (key, val) in labels {
            if first {
                first = false;
            } else {
                buffer.push(',');
            }
            buffer.push_str(key);
            buffer.push_str("=\"");
            buffer.push_str(&escape_label_value(val));
            buffer.push('"');
        }
        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(value.to_string().as_str());
    buffer.push('\n');
}

#[inline]
fn invalid_metric_name_start_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z_:].
    !(c.is_ascii_alphabetic() || c == '_' || c == ':')
}

#[inline]
fn invalid_metric_name_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z0-9_:].
    !(c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[inline]
fn invalid_label_start_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z_].
    !(c.is_ascii_alphabetic() || c == '_')
}

#[inline]
fn invalid_label_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z0-9_].
    !(c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Label;

    #[test]
    fn name_sanitization() {
        assert_eq!(
            sanitize_metric_name("varnish_stats_MAIN_uptime"),
            "varnish_stats_MAIN_uptime"
        );
        assert_eq!(sanitize_metric_name("0bad.name"), "_bad_name");
        assert_eq!(sanitize_metric_name("a:b"), "a:b");
    }

    #[test]
    fn label_name_sanitization() {
        assert_eq!(sanitize_label_name("backend"), "backend");
        assert_eq!(sanitize_label_name("1fail"), "_fail");
        assert_eq!(sanitize_label_name("a:b"), "a_b");
    }

    #[test]
    fn label_value_escaping() {
        assert_eq!(escape_label_value("plain"), "plain");
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn sample_line_without_labels() {
        let mut out = String::new();
        write_sample_line(&mut out, "varnish_stats_MAIN_uptime", &[], 17_u64);
        assert_eq!(out, "varnish_stats_MAIN_uptime 17\n");
    }

    #[test]
    fn sample_line_with_labels() {
        let mut out = String::new();
        let labels = vec![
            ("backend".to_string(), "web1".to_string()),
            ("host".to_string(), "cache01".to_string()),
        ];
        write_sample_line(&mut out, "varnish_stats_backend_happy", &labels, 1_u64);
        assert_eq!(
            out,
            "varnish_stats_backend_happy{backend=\"web1\",host=\"cache01\"} 1\n"
        );
    }

    #[test]
    fn key_merges_and_sorts_global_labels() {
        let mut global = IndexMap::new();
        global.insert("host".to_string(), "cache01".to_string());
        let key = Key::from_parts(
            "varnish_stats_backend_happy".to_string(),
            vec![Label::new("backend", "web1"), Label::new("director", "web")],
        );
        let (name, labels) = key_to_parts(&key, &global);
        assert_eq!(name, "varnish_stats_backend_happy");
        assert_eq!(
            labels,
            vec![
                ("backend".to_string(), "web1".to_string()),
                ("director".to_string(), "web".to_string()),
                ("host".to_string(), "cache01".to_string()),
            ]
        );
    }

    #[test]
    fn key_labels_override_globals() {
        let mut global = IndexMap::new();
        global.insert("host".to_string(), "cache01".to_string());
        let key = Key::from_parts("m".to_string(), vec![Label::new("host", "overridden")]);
        let (_, labels) = key_to_parts(&key, &global);
        assert_eq!(labels, vec![("host".to_string(), "overridden".to_string())]);
    }

    #[test]
    fn help_lines() {
        let mut out = String::new();
        write_help_line(&mut out, "m", "two\nlines");
        write_type_line(&mut out, "m", "gauge");
        assert_eq!(out, "# HELP m two\\nlines\n# TYPE m gauge\n");

        let mut out = String::new();
        write_help_line(&mut out, "m", "");
        assert_eq!(out, "");
    }
}

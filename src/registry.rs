//! Dynamic metric registry.
//!
//! Create-or-get cache of exported metric families, safe for concurrent use
//! by the stats poller and the log tailer. The first caller for a name fixes
//! that family's label schema for the process lifetime; a later caller with
//! a different schema gets [`RegistryError::Conflict`]. Gauge and counter
//! namespaces are independent, as they render as different exported types.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use metrics::{Key, Label};
use metrics_util::registry::{AtomicStorage, Registry};

use indexmap::IndexMap;

use crate::common::RegistryError;
use crate::formatting::{
    key_to_parts, sanitize_label_name, sanitize_metric_name, write_help_line, write_sample_line,
    write_type_line,
};
use crate::staleness::GenerationMap;

/// Per-family metadata, fixed at first registration.
struct Family {
    help: String,
    label_names: Vec<String>,
}

pub(crate) struct Inner {
    pub registry: Registry<Key, AtomicStorage>,
    gauges: Mutex<HashMap<String, Arc<Family>>>,
    counters: Mutex<HashMap<String, Arc<Family>>>,
    staleness: GenerationMap,
    global_labels: IndexMap<String, String>,
}

impl Inner {
    fn resolve(
        families: &Mutex<HashMap<String, Arc<Family>>>,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<Arc<Family>, RegistryError> {
        let requested: Vec<String> = label_names
            .iter()
            .map(|n| sanitize_label_name(n))
            .collect();

        let mut families = families.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(family) = families.get(name) {
            if family.label_names != requested {
                return Err(RegistryError::Conflict {
                    name: name.to_string(),
                    existing: family.label_names.clone(),
                    requested,
                });
            }
            return Ok(Arc::clone(family));
        }

        let family = Arc::new(Family {
            help: help.to_string(),
            label_names: requested,
        });
        families.insert(name.to_string(), Arc::clone(&family));
        Ok(family)
    }

    fn render(&self) -> String {
        let mut output = String::new();

        let mut counter_families: BTreeMap<String, Vec<(Vec<(String, String)>, u64)>> =
            BTreeMap::new();
        for (key, counter) in self.registry.get_counter_handles() {
            let (name, labels) = key_to_parts(&key, &self.global_labels);
            let value = counter.load(Ordering::Acquire);
            counter_families.entry(name).or_default().push((labels, value));
        }
        let counter_help = self.help_snapshot(&self.counters);
        for (name, mut samples) in counter_families {
            let help = counter_help.get(&name).cloned().unwrap_or_default();
            write_help_line(&mut output, &name, &help);
            write_type_line(&mut output, &name, "counter");
            samples.sort_by(|a, b| a.0.cmp(&b.0));
            for (labels, value) in samples {
                write_sample_line(&mut output, &name, &labels, value);
            }
        }

        let mut gauge_families: BTreeMap<String, Vec<(Vec<(String, String)>, f64)>> =
            BTreeMap::new();
        for (key, gauge) in self.registry.get_gauge_handles() {
            let (name, labels) = key_to_parts(&key, &self.global_labels);
            let value = f64::from_bits(gauge.load(Ordering::Acquire));
            gauge_families.entry(name).or_default().push((labels, value));
        }
        let gauge_help = self.help_snapshot(&self.gauges);
        for (name, mut samples) in gauge_families {
            let help = gauge_help.get(&name).cloned().unwrap_or_default();
            write_help_line(&mut output, &name, &help);
            write_type_line(&mut output, &name, "gauge");
            samples.sort_by(|a, b| a.0.cmp(&b.0));
            for (labels, value) in samples {
                write_sample_line(&mut output, &name, &labels, value);
            }
        }

        output
    }

    fn help_snapshot(
        &self,
        families: &Mutex<HashMap<String, Arc<Family>>>,
    ) -> HashMap<String, String> {
        let families = families.lock().unwrap_or_else(|e| e.into_inner());
        families
            .iter()
            .map(|(name, family)| (name.clone(), family.help.clone()))
            .collect()
    }
}

/// Handle to the shared metric registry. Cheap to clone; the poller, the
/// tailer, and the exposition endpoint all hold one.
#[derive(Clone)]
pub struct MetricStore {
    inner: Arc<Inner>,
}

impl MetricStore {
    /// Creates an empty store. `global_labels` (typically just `host`) are
    /// merged into every rendered sample; a family's own labels win on
    /// collision.
    pub fn new(global_labels: IndexMap<String, String>) -> Self {
        let inner = Inner {
            registry: Registry::new(AtomicStorage),
            gauges: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            staleness: GenerationMap::new(),
            global_labels,
        };
        MetricStore {
            inner: Arc::new(inner),
        }
    }

    /// Create-or-get a gauge family handle. Idempotent; the schema passed by
    /// the first caller wins and later mismatches are a conflict.
    pub fn gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<GaugeFamily, RegistryError> {
        let name = sanitize_metric_name(name);
        let family = Inner::resolve(&self.inner.gauges, &name, help, label_names)?;
        Ok(GaugeFamily {
            inner: Arc::clone(&self.inner),
            name,
            family,
        })
    }

    /// Create-or-get a counter family handle.
    pub fn counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<CounterFamily, RegistryError> {
        let name = sanitize_metric_name(name);
        let family = Inner::resolve(&self.inner.counters, &name, help, label_names)?;
        Ok(CounterFamily {
            inner: Arc::clone(&self.inner),
            name,
            family,
        })
    }

    /// Starts a new poll generation. Every gauge written afterwards is
    /// stamped with it until the next call.
    pub fn begin_generation(&self) -> u64 {
        self.inner.staleness.begin()
    }

    /// Evicts every gauge label-instance not written during the current
    /// generation, returning how many were dropped. Runs after all of a
    /// cycle's writes; counters are never evicted.
    pub fn reconcile(&self) -> usize {
        let stale = self.inner.staleness.sweep();
        for key in &stale {
            self.inner.registry.delete_gauge(key);
        }
        stale.len()
    }

    /// Renders the current registry contents in the Prometheus text
    /// exposition format. Takes a snapshot of the live handles; never waits
    /// for a poll cycle.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

fn make_key(name: &str, label_names: &[String], label_values: &[&str]) -> Key {
    assert_eq!(
        label_names.len(),
        label_values.len(),
        "label value arity for {} does not match its schema {:?}",
        name,
        label_names,
    );
    let labels: Vec<Label> = label_names
        .iter()
        .zip(label_values)
        .map(|(n, v)| Label::new(n.clone(), v.to_string()))
        .collect();
    Key::from_parts(name.to_string(), labels)
}

/// One exported gauge family; writes target a label-instance within it.
pub struct GaugeFamily {
    inner: Arc<Inner>,
    name: String,
    family: Arc<Family>,
}

impl GaugeFamily {
    /// Sets the instance to `value` (last write wins) and stamps it as seen
    /// in the current generation.
    pub fn set(&self, label_values: &[&str], value: f64) {
        let key = make_key(&self.name, &self.family.label_names, label_values);
        self.inner
            .registry
            .get_or_create_gauge(&key, |gauge| gauge.store(value.to_bits(), Ordering::Release));
        self.inner.staleness.mark(&key);
    }
}

/// One exported counter family.
pub struct CounterFamily {
    inner: Arc<Inner>,
    name: String,
    family: Arc<Family>,
}

impl CounterFamily {
    /// Stores an absolute cumulative value, as polled from varnishstat.
    pub fn store(&self, label_values: &[&str], value: u64) {
        let key = make_key(&self.name, &self.family.label_names, label_values);
        self.inner
            .registry
            .get_or_create_counter(&key, |counter| counter.store(value, Ordering::Release));
    }

    /// Increments the instance by one, for log-driven counters.
    pub fn increment(&self, label_values: &[&str]) {
        let key = make_key(&self.name, &self.family.label_names, label_values);
        self.inner
            .registry
            .get_or_create_counter(&key, |counter| {
                counter.fetch_add(1, Ordering::AcqRel);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_host() -> MetricStore {
        let mut global = IndexMap::new();
        global.insert("host".to_string(), "cache01".to_string());
        MetricStore::new(global)
    }

    #[test]
    fn render_gauge_with_global_host_label() {
        let store = store_with_host();
        store.begin_generation();
        let gauge = store
            .gauge(
                "varnish_stats_backend_happy",
                "Happy health probes",
                &["backend", "director", "type"],
            )
            .unwrap();
        gauge.set(&["web1", "web", "simple"], 1.0);

        let rendered = store.render();
        let expected = concat!(
            "# HELP varnish_stats_backend_happy Happy health probes\n",
            "# TYPE varnish_stats_backend_happy gauge\n",
            "varnish_stats_backend_happy{backend=\"web1\",director=\"web\",host=\"cache01\",type=\"simple\"} 1\n",
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn render_counter_before_gauge_sections() {
        let store = store_with_host();
        store
            .counter("varnish_log_orders_total", "Varnishlog Counter", &["region"])
            .unwrap()
            .increment(&["eu"]);
        store.begin_generation();
        store
            .gauge("varnish_stats_MAIN_uptime", "Uptime", &[])
            .unwrap()
            .set(&[], 120.0);

        let rendered = store.render();
        let expected = concat!(
            "# HELP varnish_log_orders_total Varnishlog Counter\n",
            "# TYPE varnish_log_orders_total counter\n",
            "varnish_log_orders_total{host=\"cache01\",region=\"eu\"} 1\n",
            "# HELP varnish_stats_MAIN_uptime Uptime\n",
            "# TYPE varnish_stats_MAIN_uptime gauge\n",
            "varnish_stats_MAIN_uptime{host=\"cache01\"} 120\n",
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn first_registration_fixes_label_schema() {
        let store = store_with_host();
        store
            .gauge("varnish_stats_backend_conn", "c", &["backend", "director", "type"])
            .unwrap();
        let Err(err) = store.gauge("varnish_stats_backend_conn", "c", &["backend"]) else {
            panic!("mismatched schema must be rejected");
        };
        match err {
            RegistryError::Conflict {
                name,
                existing,
                requested,
            } => {
                assert_eq!(name, "varnish_stats_backend_conn");
                assert_eq!(existing, vec!["backend", "director", "type"]);
                assert_eq!(requested, vec!["backend"]);
            }
        }
    }

    #[test]
    fn gauge_and_counter_namespaces_are_independent() {
        let store = store_with_host();
        store.gauge("varnish_stats_same", "g", &["a"]).unwrap();
        // Same name as a counter with a different schema is fine.
        store.counter("varnish_stats_same", "c", &[]).unwrap();
    }

    #[test]
    fn stale_gauges_are_evicted_but_counters_remain() {
        let store = store_with_host();

        store.begin_generation();
        let gauge = store
            .gauge("varnish_stats_backend_happy", "h", &["backend", "director", "type"])
            .unwrap();
        let counter = store
            .counter("varnish_stats_backend_req", "r", &["backend", "director", "type"])
            .unwrap();
        gauge.set(&["web1", "web", "simple"], 1.0);
        gauge.set(&["web2", "web", "simple"], 1.0);
        counter.store(&["web2", "web", "simple"], 7);
        assert_eq!(store.reconcile(), 0);

        // web2 disappears in the next cycle.
        store.begin_generation();
        gauge.set(&["web1", "web", "simple"], 1.0);
        assert_eq!(store.reconcile(), 1);

        let rendered = store.render();
        assert!(rendered.contains("backend=\"web1\""));
        assert!(!rendered.contains("varnish_stats_backend_happy{backend=\"web2\""));
        // The counter instance for the removed backend is retained.
        assert!(rendered.contains("varnish_stats_backend_req{backend=\"web2\""));
    }

    #[test]
    fn repeat_cycle_with_same_topology_evicts_nothing() {
        let store = store_with_host();
        let gauge = store
            .gauge("varnish_stats_backend_happy", "h", &["backend", "director", "type"])
            .unwrap();

        store.begin_generation();
        gauge.set(&["web1", "web", "simple"], 3.0);
        assert_eq!(store.reconcile(), 0);

        store.begin_generation();
        gauge.set(&["web1", "web", "simple"], 3.0);
        assert_eq!(store.reconcile(), 0);

        assert!(store
            .render()
            .contains("varnish_stats_backend_happy{backend=\"web1\""));
    }

    #[test]
    fn counter_store_is_absolute_and_increment_is_monotonic() {
        let store = store_with_host();
        let counter = store.counter("varnish_log_hits", "c", &[]).unwrap();
        counter.increment(&[]);
        counter.increment(&[]);
        assert!(store.render().contains("varnish_log_hits{host=\"cache01\"} 2\n"));

        let polled = store.counter("varnish_stats_MAIN_req", "c", &[]).unwrap();
        polled.store(&[], 100);
        polled.store(&[], 100);
        assert!(store
            .render()
            .contains("varnish_stats_MAIN_req{host=\"cache01\"} 100\n"));
    }

    #[test]
    fn names_are_sanitized_on_registration() {
        let store = store_with_host();
        store
            .gauge("varnish_log_bad name", "g", &[])
            .unwrap()
            .set(&[], 1.0);
        assert!(store.render().contains("varnish_log_bad_name{host=\"cache01\"} 1\n"));
    }
}

//! Poll scheduler and stats cycle.
//!
//! A fixed-interval ticker drives the cycle: query the admin interface for
//! the version banner and the active VCL, fetch a stats snapshot, classify
//! and write every entry, then reconcile stale gauge instances. At most one
//! cycle is ever in flight; a tick that fires while the previous cycle is
//! still running is dropped, not queued.

use std::sync::Arc;
use std::time::Duration;

use quanta::Clock;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::admin::AdminClient;
use crate::classify::Classifier;
use crate::common::{RawCounter, RegistryError, SourceError, StatsSchema, STATS_PREFIX};
use crate::registry::MetricStore;
use crate::stats;

/// Admin-derived state carried across cycles. Guarded by the single-flight
/// gate, so only the in-flight cycle ever touches it.
struct CycleState {
    active_vcl: String,
    version: String,
}

struct Shared {
    store: MetricStore,
    admin: AdminClient,
    classifier: Classifier,
    git_check: Option<String>,
    clock: Clock,
}

pub struct Poller {
    shared: Arc<Shared>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        store: MetricStore,
        admin: AdminClient,
        classifier: Classifier,
        git_check: Option<String>,
        interval: Duration,
    ) -> Self {
        Poller {
            shared: Arc::new(Shared {
                store,
                admin,
                classifier,
                git_check,
                clock: Clock::new(),
            }),
            interval,
        }
    }

    /// Runs the scheduler until a fatal registry inconsistency surfaces.
    /// Source and schema failures abandon the affected cycle and are
    /// retried on the next tick.
    pub async fn run(self) -> Result<(), RegistryError> {
        info!(interval = ?self.interval, "starting varnishstat poller");

        let gate = Arc::new(Mutex::new(CycleState {
            active_vcl: "boot".to_string(),
            version: String::new(),
        }));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<RegistryError>(1);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match Arc::clone(&gate).try_lock_owned() {
                        Ok(state) => {
                            let shared = Arc::clone(&self.shared);
                            let fatal_tx = fatal_tx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = run_cycle(&shared, state).await {
                                    let _ = fatal_tx.send(err).await;
                                }
                            });
                        }
                        Err(_) => {
                            warn!("previous stats cycle still running, skipping tick");
                        }
                    }
                }
                Some(err) = fatal_rx.recv() => return Err(err),
            }
        }
    }
}

async fn run_cycle(
    shared: &Shared,
    mut state: OwnedMutexGuard<CycleState>,
) -> Result<(), RegistryError> {
    let started = shared.clock.now();
    let generation = shared.store.begin_generation();

    let version = match shared.admin.banner_version().await {
        Ok(version) => version,
        Err(err) => {
            warn!(generation, %err, "cannot query varnishadm banner, abandoning cycle");
            return Ok(());
        }
    };
    if version != state.version {
        info!(old = %state.version, new = %version, "varnish version changed");
        state.version = version;
    }

    if let Err(err) = export_version(shared, &state.version).await {
        match err {
            CycleError::Registry(err) => return Err(err),
            CycleError::Source(err) => {
                warn!(generation, %err, "version check failed, abandoning cycle");
                return Ok(());
            }
        }
    }

    match shared.admin.active_vcl().await {
        Ok(Some(vcl)) => {
            if vcl != state.active_vcl {
                info!(old = %state.active_vcl, new = %vcl, "active VCL changed");
                state.active_vcl = vcl;
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!(generation, %err, "cannot query vcl.list, abandoning cycle");
            return Ok(());
        }
    }

    let schema = StatsSchema::for_version(&state.version);
    let snapshot = match stats::fetch_snapshot(schema).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(generation, %err, "stats snapshot failed, abandoning cycle");
            return Ok(());
        }
    };

    apply_snapshot(
        &shared.store,
        &shared.classifier,
        &snapshot,
        &state.active_vcl,
        schema,
        generation,
    )?;

    let elapsed = (shared.clock.now() - started).as_secs_f64();
    shared
        .store
        .gauge(
            &format!("{STATS_PREFIX}cycle_seconds"),
            "Duration of the last stats poll cycle",
            &[],
        )?
        .set(&[], elapsed);

    let evicted = shared.store.reconcile();
    debug!(
        generation,
        entries = snapshot.len(),
        evicted,
        elapsed,
        "stats cycle complete",
    );
    Ok(())
}

enum CycleError {
    Registry(RegistryError),
    Source(SourceError),
}

/// Exports the `varnish_stats_version` gauge, optionally carrying the git
/// commit hash of a deployment work tree.
async fn export_version(shared: &Shared, version: &str) -> Result<(), CycleError> {
    let name = format!("{STATS_PREFIX}version");
    let help = "Version of the running Varnish";
    match &shared.git_check {
        Some(dir) => {
            let hash = stats::run_command("git", &["-C", dir, "log", "-n", "1", "--pretty=format:%H"])
                .await
                .map_err(CycleError::Source)?;
            shared
                .store
                .gauge(&name, help, &["version", "githash"])
                .map_err(CycleError::Registry)?
                .set(&[version, hash.trim()], 1.0);
        }
        None => {
            shared
                .store
                .gauge(&name, help, &["version"])
                .map_err(CycleError::Registry)?
                .set(&[version], 1.0);
        }
    }
    Ok(())
}

/// Writes one decoded snapshot into the registry. Classification failures
/// skip the key and keep going; only a registry schema conflict aborts,
/// since it means the classifier itself is inconsistent.
pub fn apply_snapshot(
    store: &MetricStore,
    classifier: &Classifier,
    entries: &[RawCounter],
    active_vcl: &str,
    schema: StatsSchema,
    generation: u64,
) -> Result<(), RegistryError> {
    for raw in entries {
        let canonical = match classifier.classify(raw, active_vcl, schema) {
            Ok(Some(canonical)) => canonical,
            Ok(None) => continue,
            Err(err) => {
                warn!(key = %raw.key, generation, %err, "skipping unclassifiable key");
                continue;
            }
        };

        let values: Vec<&str> = canonical.label_values.iter().map(String::as_str).collect();
        match canonical.kind {
            crate::common::StatKind::Gauge => {
                store
                    .gauge(&canonical.name, &canonical.help, &canonical.label_names)?
                    .set(&values, raw.value as f64);
            }
            crate::common::StatKind::Counter => {
                store
                    .counter(&canonical.name, &canonical.help, &canonical.label_names)?
                    .store(&values, raw.value);
            }
        }
    }
    Ok(())
}

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indexmap::IndexMap;
use regex::Regex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use varnishprom::admin::AdminClient;
use varnishprom::classify::Classifier;
use varnishprom::poller::Poller;
use varnishprom::registry::MetricStore;
use varnishprom::{server, tailer};

#[derive(Parser, Debug)]
#[command(name = "varnishprom", version, about = "Prometheus exporter for Varnish")]
struct Args {
    /// Listen address for the metrics endpoint
    #[arg(short = 'i', long = "listen", default_value = "127.0.0.1:7083")]
    listen: SocketAddr,

    /// Path for the metrics endpoint
    #[arg(short = 'p', long = "path", default_value = "/metrics")]
    path: String,

    /// Directive marker to look for in varnishlog lines
    #[arg(short = 'k', long = "log-key", default_value = "prom")]
    log_key: String,

    /// Start the varnishlog tailer
    #[arg(short = 'l', long = "log")]
    log: bool,

    /// Start the varnishstat poller
    #[arg(short = 's', long = "stats")]
    stats: bool,

    /// Seconds between stats polls
    #[arg(long = "interval", default_value_t = 10)]
    interval: u64,

    /// Varnish admin interface address (host:port); local instance if unset
    #[arg(short = 'T', long = "admin-host")]
    admin_host: Option<String>,

    /// Varnish admin secret file
    #[arg(short = 'S', long = "secrets-file", default_value = "/etc/varnish/secretsfile")]
    secrets_file: String,

    /// Report the git commit hash of this work tree in the version metric
    #[arg(short = 'g', long = "git-check")]
    git_check: Option<String>,

    /// Collapse backends whose director matches this pattern into one series
    #[arg(short = 'c', long = "collapse")]
    collapse: Option<String>,

    /// Host label value, defaults to the machine's short hostname
    #[arg(short = 'H', long = "host")]
    host: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'v', long = "log-level", default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) -> Result<()> {
    match level {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        other => bail!("invalid log level: {other}"),
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn validate(args: &Args) -> Result<()> {
    if !args.stats && !args.log {
        bail!("nothing to do: enable --stats, --log, or both");
    }
    if !args.path.starts_with('/') {
        bail!("metrics path must start with '/'");
    }
    if args.interval == 0 {
        bail!("poll interval must be at least one second");
    }
    Ok(())
}

fn short_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .and_then(|raw| raw.trim().split('.').next().map(str::to_string))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    validate(&args)?;

    let host = args.host.unwrap_or_else(short_hostname);
    let collapse = args
        .collapse
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid collapse pattern")?;

    let mut global_labels = IndexMap::new();
    global_labels.insert("host".to_string(), host);
    let store = MetricStore::new(global_labels);

    if args.log {
        let store = store.clone();
        let marker = args.log_key.clone();
        tokio::spawn(async move {
            // Stream loss only takes down the tailer; stats keep polling.
            if let Err(err) = tailer::run_log_tailer(store, marker).await {
                error!(%err, "varnishlog tailer stopped");
            }
        });
    }

    let poller = args.stats.then(|| {
        Poller::new(
            store.clone(),
            AdminClient::new(args.admin_host.clone(), args.secrets_file.clone()),
            Classifier::new(collapse),
            args.git_check.clone(),
            Duration::from_secs(args.interval),
        )
    });
    let poll_task = async {
        match poller {
            Some(poller) => poller.run().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = poll_task => {
            result.context("stats poller hit an unrecoverable registry inconsistency")?;
        }
        result = server::serve(store.clone(), args.listen, args.path) => {
            result.context("metrics endpoint failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, exiting");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once(&"varnishprom").chain(argv))
    }

    #[test]
    fn rejects_running_with_nothing_enabled() {
        assert!(validate(&parse(&[])).is_err());
        assert!(validate(&parse(&["-s"])).is_ok());
        assert!(validate(&parse(&["-l"])).is_ok());
    }

    #[test]
    fn rejects_relative_metrics_path() {
        assert!(validate(&parse(&["-s", "-p", "metrics"])).is_err());
    }

    #[test]
    fn rejects_zero_poll_interval() {
        assert!(validate(&parse(&["-s", "--interval", "0"])).is_err());
        assert!(validate(&parse(&["-s", "--interval", "1"])).is_ok());
    }
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use podtime_controller::Lifecycle;
use podtime_core::{ControllerConfig, Markers, DEFAULT_MAX_RETRIES, DEFAULT_PROCESSED_ANNOTATION, DEFAULT_RESYNC_SECS, DEFAULT_TRIGGER_ANNOTATION};
use tracing::{error, info, warn};

/// Populated by the build (`PODTIME_GIT_COMMIT=$(git rev-parse --short HEAD) cargo build`).
const GIT_COMMIT: &str = match option_env!("PODTIME_GIT_COMMIT") {
    Some(c) => c,
    None => "unknown",
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "pod-time-controller", version = VERSION, about = "Annotate pods carrying a trigger annotation with the current date and time")]
struct Cli {
    /// Path to a kubeconfig file (defaults to the in-cluster service account)
    #[arg(long = "kubeconfig", env = "KUBECONFIG_PATH")]
    kubeconfig: Option<PathBuf>,

    /// Only watch pods in this namespace (default: all namespaces)
    #[arg(long = "namespace", env = "PODTIME_NAMESPACE")]
    namespace: Option<String>,

    /// Annotation that must exist for a pod to be stamped
    #[arg(long = "trigger-annotation", default_value = DEFAULT_TRIGGER_ANNOTATION)]
    trigger_annotation: String,

    /// Annotation set to the current date and time
    #[arg(long = "time-annotation", default_value = DEFAULT_PROCESSED_ANNOTATION)]
    time_annotation: String,

    /// Requeues allowed after a failed patch before the pod is given up on
    #[arg(long = "max-retries", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Full cache resync interval in seconds (0 disables)
    #[arg(long = "resync-secs", default_value_t = DEFAULT_RESYNC_SECS)]
    resync_secs: u64,

    /// Seconds to wait for the initial pod listing
    #[arg(long = "sync-timeout-secs", default_value_t = 120)]
    sync_timeout_secs: u64,

    /// Concurrent workers draining the queue
    #[arg(long = "workers", default_value_t = 1)]
    workers: usize,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "PODTIME_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Enable debug logging
    #[arg(long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    /// Print the resolved configuration as JSON and exit
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    print_config: bool,
}

impl Cli {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            markers: Markers { trigger: self.trigger_annotation.clone(), processed: self.time_annotation.clone() },
            max_retries: self.max_retries,
            resync: Duration::from_secs(self.resync_secs),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            workers: self.workers,
            namespace: self.namespace.clone(),
            kubeconfig: self.kubeconfig.clone(),
            ..ControllerConfig::default()
        }
    }
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let env = std::env::var("PODTIME_LOG").unwrap_or_else(|_| fallback.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid metrics address; expected host:port"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config();
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing(cli.debug);
    init_metrics(cli.metrics_addr.as_deref());
    info!(version = VERSION, commit = GIT_COMMIT, "pod-time-controller");

    let lifecycle = Lifecycle::new();
    let signals = lifecycle.install_signal_handlers();
    let res = podtime_controller::run(config, lifecycle.token()).await;
    lifecycle.shutdown();
    if let Err(e) = signals.await {
        warn!(error = %e, "signal handler task failed");
    }
    if let Err(e) = &res {
        error!(error = %e, "controller failed");
    }
    res.context("pod-time-controller")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::parse_from(["pod-time-controller"]);
        let cfg = cli.config();
        assert_eq!(cfg.markers.trigger, "addtime");
        assert_eq!(cfg.markers.processed, "timestamp");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.resync, Duration::from_secs(60));
        assert!(cfg.kubeconfig.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "pod-time-controller",
            "--kubeconfig",
            "/tmp/kc",
            "--namespace",
            "team-a",
            "--trigger-annotation",
            "stamp-me",
            "--time-annotation",
            "stamped-at",
            "--max-retries",
            "2",
            "--workers",
            "3",
            "--debug",
        ]);
        let cfg = cli.config();
        assert_eq!(cfg.kubeconfig.as_deref(), Some(std::path::Path::new("/tmp/kc")));
        assert_eq!(cfg.namespace.as_deref(), Some("team-a"));
        assert_eq!(cfg.markers.trigger, "stamp-me");
        assert_eq!(cfg.markers.processed, "stamped-at");
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.workers, 3);
        assert!(cli.debug);
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::core::GroupVersionKind;
use meridian_core::labels;
use meridian_detector::{DefaultInterpreter, DetectorConfig, ResourceDetector, SkippedResourceConfig};
use meridian_kubehub::{watch_resources, KubeStore};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "meridian-controller", version, about = "Meridian resource detector")]
struct Cli {
    /// tracing filter directives, e.g. "info,meridian_detector=debug"
    #[arg(long, env = "MERIDIAN_LOG", global = true, default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this host:port
    #[arg(long, env = "MERIDIAN_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the detector against the current kube context
    Run(RunArgs),
    /// Print the kinds the detector would watch
    Discover {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
}

/// Flags win over `MERIDIAN_*` variables, which win over defaults.
#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long, env = "MERIDIAN_CONCURRENT_POLICY_SYNCS")]
    concurrent_policy_syncs: Option<usize>,
    #[arg(long, env = "MERIDIAN_CONCURRENT_CLUSTER_POLICY_SYNCS")]
    concurrent_cluster_policy_syncs: Option<usize>,
    #[arg(long, env = "MERIDIAN_CONCURRENT_RESOURCE_TEMPLATE_SYNCS")]
    concurrent_resource_template_syncs: Option<usize>,
    /// Namespace regexes, anchored at both ends
    #[arg(long, env = "MERIDIAN_SKIPPED_NAMESPACES", value_delimiter = ',')]
    skipped_namespaces: Option<Vec<String>>,
    /// e.g. "networking.k8s.io,apps/v1/Deployment,v1/Secret"
    #[arg(long, env = "MERIDIAN_SKIPPED_RESOURCES")]
    skipped_resources: Option<String>,
    #[arg(long, env = "MERIDIAN_RATE_LIMITER_BASE_DELAY_MS")]
    rate_limiter_base_delay_ms: Option<u64>,
    #[arg(long, env = "MERIDIAN_RATE_LIMITER_MAX_DELAY_SECS")]
    rate_limiter_max_delay_secs: Option<u64>,
    #[arg(long, env = "MERIDIAN_RATE_LIMITER_QPS")]
    rate_limiter_qps: Option<f64>,
    #[arg(long, env = "MERIDIAN_RATE_LIMITER_BURST")]
    rate_limiter_burst: Option<u32>,
    #[arg(long, env = "MERIDIAN_PRIORITY_BASED_SCHEDULING")]
    priority_based_scheduling: Option<bool>,
    #[arg(long, env = "MERIDIAN_POLICY_PREEMPTION")]
    policy_preemption: Option<bool>,
    #[arg(long, env = "MERIDIAN_DISCOVERY_PERIOD_SECS")]
    discovery_period_secs: Option<u64>,
    #[arg(long, env = "MERIDIAN_FIELD_MANAGER")]
    field_manager: Option<String>,
    #[arg(long, env = "MERIDIAN_EVENT_CHANNEL_CAP")]
    event_channel_capacity: Option<usize>,
}

impl RunArgs {
    fn apply(self, mut cfg: DetectorConfig) -> DetectorConfig {
        if let Some(v) = self.concurrent_policy_syncs {
            cfg.concurrent_policy_syncs = v;
        }
        if let Some(v) = self.concurrent_cluster_policy_syncs {
            cfg.concurrent_cluster_policy_syncs = v;
        }
        if let Some(v) = self.concurrent_resource_template_syncs {
            cfg.concurrent_resource_template_syncs = v;
        }
        if let Some(v) = self.skipped_namespaces {
            cfg.skipped_namespaces = v.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = self.skipped_resources {
            cfg.skipped_resources = v;
        }
        if let Some(v) = self.rate_limiter_base_delay_ms {
            cfg.rate_limiter.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.rate_limiter_max_delay_secs {
            cfg.rate_limiter.max_delay = Duration::from_secs(v);
        }
        if let Some(v) = self.rate_limiter_qps {
            cfg.rate_limiter.qps = v;
        }
        if let Some(v) = self.rate_limiter_burst {
            cfg.rate_limiter.burst = v;
        }
        if let Some(v) = self.priority_based_scheduling {
            cfg.priority_based_scheduling = v;
        }
        if let Some(v) = self.policy_preemption {
            cfg.policy_preemption = v;
        }
        if let Some(v) = self.discovery_period_secs {
            cfg.discovery_period = Duration::from_secs(v.max(1));
        }
        if let Some(v) = self.field_manager {
            cfg.field_manager = v;
        }
        if let Some(v) = self.event_channel_capacity {
            cfg.event_channel_capacity = v.max(1);
        }
        cfg
    }
}

fn init_tracing(directives: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "serving metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not installed"),
    }
}

/// Kinds worth watching: policies plus every kind not skipped by config.
fn watch_filter(skipped: SkippedResourceConfig) -> impl Fn(&GroupVersionKind) -> bool + Send + Sync + 'static {
    let policies = [labels::propagation_policy_gvk(), labels::cluster_propagation_policy_gvk()];
    move |gvk| policies.contains(gvk) || !skipped.is_skipped(gvk)
}

async fn run(cfg: DetectorConfig) -> Result<()> {
    let store = Arc::new(KubeStore::try_default(cfg.field_manager.clone()).await.context("connecting to cluster")?);
    let client = store.client();
    let skipped = SkippedResourceConfig::parse(&cfg.skipped_resources)?;
    let (period, capacity) = (cfg.discovery_period, cfg.event_channel_capacity);
    let detector = ResourceDetector::new(store, Arc::new(DefaultInterpreter), cfg)?;

    let token = CancellationToken::new();
    let mut handles = detector.start(token.clone());
    let (tx, rx) = mpsc::channel(capacity);
    handles.push(tokio::spawn(watch_resources(client, tx, token.clone(), period, watch_filter(skipped))));
    let ingest = {
        let detector = Arc::clone(&detector);
        let token = token.clone();
        tokio::spawn(async move { detector.ingest(rx, token).await })
    };
    handles.push(ingest);

    match signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received; shutting down"),
        Err(e) => error!(error = %e, "failed to listen for Ctrl-C; shutting down"),
    }
    token.cancel();
    for h in handles {
        if let Err(e) = h.await {
            warn!(error = %e, "task ended abnormally");
        }
    }
    info!("detector stopped");
    Ok(())
}

async fn discover(output: Output) -> Result<()> {
    let cfg = DetectorConfig::from_env();
    let accept = watch_filter(SkippedResourceConfig::parse(&cfg.skipped_resources)?);
    let client = kube::Client::try_default().await.context("connecting to cluster")?;
    let mut resources: Vec<_> = meridian_kubehub::discover(client)
        .await?
        .into_iter()
        .map(|(dr, _)| dr)
        .filter(|dr| accept(&dr.gvk()))
        .collect();
    resources.sort_by_key(|dr| dr.gvk_key());
    match output {
        Output::Human => {
            for r in resources {
                let scope = if r.namespaced { "namespaced" } else { "cluster" };
                let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                println!("{} • {} • {}", gv, r.kind, scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr);
    match cli.command {
        Commands::Run(args) => {
            let cfg = args.apply(DetectorConfig::from_env());
            info!(?cfg, "configuration loaded");
            run(cfg).await
        }
        Commands::Discover { output } => {
            info!("discover invoked");
            discover(output).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "meridian-controller",
            "run",
            "--concurrent-resource-template-syncs",
            "9",
            "--skipped-namespaces",
            "kube-.*,istio-system",
            "--policy-preemption",
            "false",
        ])
        .expect("parse");
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        let cfg = args.apply(DetectorConfig::default());
        assert_eq!(cfg.concurrent_resource_template_syncs, 9);
        assert_eq!(cfg.skipped_namespaces, vec!["kube-.*".to_string(), "istio-system".to_string()]);
        assert!(!cfg.policy_preemption);
        assert_eq!(cfg.concurrent_policy_syncs, 1);
    }

    #[test]
    fn metrics_and_log_flags_are_global() {
        let cli = Cli::try_parse_from([
            "meridian-controller",
            "discover",
            "--metrics-addr",
            "127.0.0.1:9090",
            "--log",
            "debug",
        ])
        .expect("parse");
        assert_eq!(cli.metrics_addr, Some("127.0.0.1:9090".parse().expect("addr")));
        assert_eq!(cli.log, "debug");

        let err = Cli::try_parse_from(["meridian-controller", "run", "--metrics-addr", "not-an-addr"]);
        assert!(err.is_err());
    }

    #[test]
    fn watch_filter_keeps_policies() {
        let accept = watch_filter(SkippedResourceConfig::parse("apps").expect("parse"));
        assert!(accept(&labels::propagation_policy_gvk()));
        assert!(accept(&labels::cluster_propagation_policy_gvk()));
        assert!(!accept(&labels::resource_binding_gvk()));
        assert!(!accept(&GroupVersionKind::gvk("apps", "v1", "Deployment")));
        assert!(accept(&GroupVersionKind::gvk("", "v1", "ConfigMap")));
    }
}

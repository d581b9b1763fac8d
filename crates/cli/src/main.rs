use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::Client;
use revgc_core::{split_key, ReadModel};
use revgc_ops::{KubeEventPublisher, KubeOps};
use revgc_reconciler::{Decision, Reconciler};
use revgc_store::{Cache, WorldBuilder};
use tracing::{info, warn};

mod runner;

#[derive(Parser, Debug)]
#[command(name = "revgcctl", version, about = "Garbage-collects superseded serving Revisions")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", env = "REVGC_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "REVGC_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Delta channel capacity between watchers and the cache
        #[arg(long = "queue-cap", env = "REVGC_QUEUE_CAP", default_value_t = 2048)]
        queue_cap: usize,
        /// Requeue delay after a failed reconciliation
        #[arg(long = "error-requeue-secs", env = "REVGC_ERROR_REQUEUE_SECS", default_value_t = 30)]
        error_requeue_secs: u64,
        /// Reporting component on published Events
        #[arg(long = "controller-name", env = "REVGC_CONTROLLER_NAME", default_value = revgc_ops::events::DEFAULT_CONTROLLER_NAME)]
        controller_name: String,
    },
    /// Show which Revisions of a Service would be deleted, without deleting
    Plan {
        /// Service key, e.g. "default/hello"
        key: String,
    },
}

fn init_tracing() {
    let env = std::env::var("REVGC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid metrics address; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    match cli.command {
        Commands::Run { queue_cap, error_requeue_secs, controller_name } => {
            let ns = cli.namespace.as_deref();
            info!(ns = ?ns, queue_cap, "run invoked");
            let client = Client::try_default().await?;

            let (ingest, cache) = revgc_store::spawn_ingest(queue_cap);
            let reconciler = Arc::new(Reconciler::new(
                Arc::new(cache),
                Arc::new(KubeOps::new(client.clone())),
                Arc::new(KubeEventPublisher::new(client.clone(), &controller_name)),
            ));
            runner::run_controller(client, ns, reconciler, ingest, Duration::from_secs(error_requeue_secs)).await;
        }
        Commands::Plan { key } => {
            let (ns, name) = plan_key(&key)?;
            info!(ns = %ns, service = %name, "plan invoked");
            let client = Client::try_default().await?;
            let mut builder = WorldBuilder::new();
            builder.apply(revgc_kubehub::list_once(client, Some(ns)).await?);
            let cache = Cache::from_world((*builder.freeze()).clone());

            let service = cache.get_service(ns, name).map_err(|e| anyhow!("{}", e))?;
            let decision = revgc_reconciler::plan(&cache, &service)?;
            match cli.output {
                Output::Human => print!("{}", render_plan(&decision)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&decision)?),
            }
        }
    }

    Ok(())
}

/// Services are namespaced, so `plan` needs the full `namespace/name` key.
fn plan_key(key: &str) -> Result<(&str, &str)> {
    match split_key(key)? {
        ("", name) => Err(anyhow!("key {:?} has no namespace; use <namespace>/{}", key, name)),
        pair => Ok(pair),
    }
}

fn render_plan(decision: &Decision) -> String {
    let plan = match decision {
        Decision::NoOp(reason) => return format!("nothing to collect: {}\n", reason),
        Decision::Collect(plan) => plan,
    };
    let mut out = format!(
        "service {}/{} follows {} (generation {})\n",
        plan.namespace, plan.service, plan.latest.name, plan.latest.generation
    );
    out.push_str("ACTION   REVISION                       GENERATION\n");
    for c in &plan.superseded {
        out.push_str(&format!("{:<8} {:<30} {}\n", "delete", c.name, c.generation));
    }
    for c in &plan.retained {
        out.push_str(&format!("{:<8} {:<30} {}\n", "keep", c.name, c.generation));
    }
    for u in &plan.unreadable {
        out.push_str(&format!("{:<8} {:<30} {}\n", "skip", u.name, u.error));
    }
    out
}

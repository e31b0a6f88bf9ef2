use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metrics::counter;
use rampart_core::{ObjectRef, ProcessId};
use rampart_persist::{SqliteStore, Store};
use rampart_pipeline::{
    Deployment, Dispatcher, Namespace, NetworkPolicy, ObservedReport, PersistPipeline, ProcessIndicator, Secret,
    SensorEvent,
};
use rampart_reconcile::IdSnapshot;
use rampart_upgrade::{TlsFiles, UpgradeContext, UpgraderConfig, DEFAULT_NAMESPACE};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rampart", version, about = "Rampart sensor upgrader")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    upgrade: UpgradeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct UpgradeArgs {
    /// Upgrade process ID (default: a fresh UUID)
    #[arg(long, env = "RAMPART_PROCESS_ID", global = true)]
    process_id: Option<String>,
    #[arg(long, env = "RAMPART_CLUSTER_ID", global = true, default_value = "")]
    cluster_id: String,
    #[arg(long = "ns", env = "RAMPART_NAMESPACE", global = true, default_value = DEFAULT_NAMESPACE)]
    namespace: String,
    /// Coordinator host:port
    #[arg(long, env = "RAMPART_COORDINATOR_ENDPOINT", global = true)]
    coordinator_endpoint: Option<String>,
    /// Owner of process state, e.g. "apps/v1/Deployment:stackrox/sensor-upgrader"
    #[arg(long, env = "RAMPART_OWNER", global = true)]
    owner: Option<ObjectRef>,
    #[arg(long, env = "RAMPART_TLS_CERT", global = true)]
    tls_cert: Option<PathBuf>,
    #[arg(long, env = "RAMPART_TLS_KEY", global = true)]
    tls_key: Option<PathBuf>,
    #[arg(long, env = "RAMPART_TLS_CA", global = true)]
    tls_ca: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show served resource kinds and what the upgrader uses them for
    Discover,
    /// List objects of the currently installed bundle
    ListCurrent,
    /// Decode and validate manifests against the server schema
    Validate {
        /// YAML or JSON file; multiple YAML documents separated by "---"
        file: PathBuf,
    },
    /// Feed newline-delimited sensor events through the pipelines
    Ingest {
        /// File with one JSON event per line
        events: PathBuf,
        /// JSON object mapping resource kind to the ids the sensor currently reports
        #[arg(long = "reconcile")]
        report: Option<PathBuf>,
        /// SQLite database path (default: RAMPART_DB_PATH or ~/.rampart/rampart.db)
        #[arg(long = "db")]
        db: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("RAMPART_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RAMPART_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RAMPART_METRICS_ADDR; expected host:port");
        }
    }
}

fn tls_files(args: &UpgradeArgs) -> Result<Option<TlsFiles>> {
    match (&args.tls_cert, &args.tls_key, &args.tls_ca) {
        (Some(cert), Some(key), Some(ca)) => Ok(Some(TlsFiles { cert: cert.clone(), key: key.clone(), ca: ca.clone() })),
        (None, None, None) => Ok(None),
        _ => bail!("RAMPART_TLS_CERT, RAMPART_TLS_KEY and RAMPART_TLS_CA must be set together"),
    }
}

async fn upgrader_config(args: &UpgradeArgs) -> Result<UpgraderConfig> {
    let kube = kube::Config::infer().await.context("inferring Kubernetes client configuration")?;
    let process_id = args.process_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut config = UpgraderConfig::new(ProcessId::new(process_id), args.cluster_id.clone(), kube);
    config.namespace = args.namespace.clone();
    config.coordinator_endpoint = args.coordinator_endpoint.clone();
    config.tls = tls_files(args)?;
    config.owner = args.owner.clone();
    Ok(config)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling");
            token.cancel();
        }
    });
}

/// Split a multi-document YAML stream on `---` separator lines.
fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            docs.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    docs.push(current);
    docs.into_iter().filter(|d| d.lines().any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))).collect()
}

const REPORT_KINDS: &[&str] = &["deployment", "processIndicator", "networkPolicy", "namespace", "secret"];

fn observed_report(raw: &str) -> Result<ObservedReport> {
    let mut parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(raw).context("parsing reconcile report")?;
    let mut report = ObservedReport::new();
    for &kind in REPORT_KINDS {
        if let Some(ids) = parsed.remove(kind) {
            report.insert(kind, Box::new(IdSnapshot::new(ids)));
        }
    }
    for kind in parsed.keys() {
        warn!(kind = %kind, "ignoring unknown kind in reconcile report");
    }
    Ok(report)
}

fn dispatcher(store: Arc<dyn Store>) -> Dispatcher {
    Dispatcher::new(
        Arc::new(PersistPipeline::<Deployment>::new(store.clone())),
        Arc::new(PersistPipeline::<ProcessIndicator>::new(store.clone())),
        Arc::new(PersistPipeline::<NetworkPolicy>::new(store.clone())),
        Arc::new(PersistPipeline::<Namespace>::new(store.clone())),
        Arc::new(PersistPipeline::<Secret>::new(store)),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    match cli.command {
        Commands::Discover => {
            let ctx = UpgradeContext::create(cancel, upgrader_config(&cli.upgrade).await?).await?;
            let resources = ctx.resources();
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.gvk, scope, r.purpose);
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> { gvk: String, plural: &'a str, namespaced: bool, purpose: String }
                    let rows: Vec<_> = resources
                        .into_iter()
                        .map(|r| Row { gvk: r.gvk.key(), plural: &r.plural, namespaced: r.namespaced, purpose: r.purpose.to_string() })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::ListCurrent => {
            let ctx = UpgradeContext::create(cancel, upgrader_config(&cli.upgrade).await?).await?;
            let objects = ctx.list_current_objects().await?;
            info!(count = objects.len(), "current bundle objects");
            match cli.output {
                Output::Human => {
                    println!("KIND                         NAMESPACE/NAME                           STATE");
                    for o in &objects {
                        let kind = o.object().gvk().map(|g| g.key()).unwrap_or_else(|| "-".into());
                        let ns = o.object().namespace().unwrap_or("-");
                        let state = if ctx.is_process_state_object(o) { "this-run" } else { "" };
                        println!("{:<28} {:<40} {}", kind, format!("{}/{}", ns, o.object().name().unwrap_or("")), state);
                    }
                }
                Output::Json => {
                    let values = objects.iter().map(|o| o.object().to_value()).collect::<Result<Vec<_>, _>>()?;
                    println!("{}", serde_json::to_string_pretty(&values)?);
                }
            }
        }
        Commands::Validate { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let ctx = UpgradeContext::create(cancel, upgrader_config(&cli.upgrade).await?).await?;
            let mut failed = 0usize;
            for (i, doc) in split_documents(&text).iter().enumerate() {
                match ctx.parse_and_validate_object(doc.as_bytes()) {
                    Ok(obj) => {
                        let kind = obj.object().gvk().map(|g| g.key()).unwrap_or_default();
                        println!("ok    [{}] {} {}", i, kind, obj.object().name().unwrap_or(""));
                    }
                    Err(e) => {
                        failed += 1;
                        println!("error [{}] {}", i, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} document(s) failed validation", failed);
            }
        }
        Commands::Ingest { events, report, db } => {
            let store: Arc<dyn Store> = Arc::new(match db {
                Some(path) => SqliteStore::open(&path)?,
                None => SqliteStore::open_default()?,
            });
            let dispatcher = dispatcher(store);
            let text = std::fs::read_to_string(&events).with_context(|| format!("reading {}", events.display()))?;
            let (mut ok, mut failed) = (0usize, 0usize);
            let mut cluster_id = cli.upgrade.cluster_id.clone();
            for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                if cancel.is_cancelled() {
                    bail!("ingest cancelled");
                }
                let event: SensorEvent = match serde_json::from_str(line) {
                    Ok(ev) => ev,
                    Err(e) => {
                        failed += 1;
                        error!(line = n + 1, error = %e, "undecodable event");
                        continue;
                    }
                };
                if cluster_id.is_empty() {
                    cluster_id = event.cluster_id.clone();
                }
                match dispatcher.dispatch(&event).await {
                    Ok(Some(enforcement)) => {
                        ok += 1;
                        println!("{}", serde_json::to_string(&enforcement)?);
                    }
                    Ok(None) => ok += 1,
                    Err(e) => {
                        failed += 1;
                        error!(line = n + 1, event = %event.id, error = %e, "event failed");
                    }
                }
            }
            counter!("ingest_failed_total", failed as u64);
            info!(ok, failed, "ingest complete");

            if let Some(path) = report {
                let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
                if cluster_id.is_empty() {
                    bail!("reconcile needs a cluster id: set RAMPART_CLUSTER_ID or ingest at least one event");
                }
                dispatcher.reconcile_all(&cluster_id, observed_report(&raw)?).await?;
                info!(cluster = %cluster_id, "reconciliation complete");
            }
        }
    }

    Ok(())
}

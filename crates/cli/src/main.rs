use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kapply_apply::ApplyMode;
use kapply_kubehub::KubeResolver;
use kapply_ops::{backoff_for_timeout, BatchReport, Reconciler, RemovalOptions};
use kapply_sync::{HttpFetcher, LivenessFile, SourceList, SyncLoop};
use tracing::{error, info, warn};

mod catalog;
mod hold;
mod workflow;

use catalog::{Catalog, ComponentPin, FileLocation};
use workflow::{InstallOptions, RemoveOptions, Workflow};

#[derive(Parser, Debug)]
#[command(name = "kapplyctl", version, about = "Reconcile manifest bundles against a cluster")]
struct Cli {
    /// Namespace given to namespaced manifests that do not name one
    #[arg(short = 'n', long = "namespace", global = true, env = "KAPPLY_NAMESPACE", default_value = "kapply")]
    namespace: String,

    /// Stay alive for N minutes logging a countdown, then exit without touching the cluster
    #[arg(short = 'd', long = "debug", global = true, num_args = 0..=1, default_missing_value = "5", value_name = "MINUTES")]
    debug: Option<u64>,

    /// Patch strategy for objects that already exist
    #[arg(long = "patch", global = true, value_enum, default_value_t = Patch::Strategic)]
    patch: Patch,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Patch {
    /// Strategic merge, merge patch for kinds that reject it
    Strategic,
    /// Merge patch only
    Merge,
}

#[derive(Args, Debug)]
struct BundleArgs {
    /// Component catalog (YAML)
    #[arg(long = "catalog", env = "KAPPLY_CATALOG")]
    catalog: PathBuf,
    /// Base URL component bundles are downloaded from
    #[arg(short = 's', long = "file-source", env = "KAPPLY_FILE_SOURCE")]
    file_source: Option<String>,
    /// Path after each component directory; `{version}` is replaced by the component version
    #[arg(long = "file-path", env = "KAPPLY_FILE_PATH")]
    file_path: Option<String>,
    /// Component to act on, optionally pinned; repeatable. None means every component
    #[arg(short = 'c', long = "component", value_name = "NAME[=VERSION]")]
    components: Vec<ComponentPin>,
    /// Extra prerequisite manifests created before and deleted after the components
    #[arg(long = "prereqs", env = "KAPPLY_PREREQS")]
    prereqs: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ensure prerequisites exist and replace every selected component's manifests
    Install {
        #[command(flatten)]
        bundle: BundleArgs,
        /// Record the components' latest URLs for `sync` to keep applied
        #[arg(short = 'a', long = "autoupdate", action = ArgAction::SetTrue)]
        autoupdate: bool,
    },
    /// Delete selected components, their schemas and the prerequisites
    Remove {
        #[command(flatten)]
        bundle: BundleArgs,
        /// Strip finalizers from schema instances instead of waiting for their controllers
        #[arg(short = 'f', long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// Checks that a schema is gone before giving up
        #[arg(long = "attempts", default_value_t = 5)]
        attempts: u32,
        /// Minutes to wait for a schema to disappear
        #[arg(short = 't', long = "timeout", default_value_t = 5)]
        timeout: u64,
        /// Also delete the namespace
        #[arg(long = "delete-namespace", action = ArgAction::SetTrue)]
        delete_namespace: bool,
    },
    /// Poll manifest sources and keep them applied
    Sync {
        /// Source URL; repeatable or comma separated
        #[arg(long = "source", env = "KAPPLY_SOURCES", value_delimiter = ',')]
        sources: Vec<String>,
        /// Directory whose files each hold one source URL
        #[arg(long = "source-dir", env = "KAPPLY_SOURCE_DIR")]
        source_dir: Option<PathBuf>,
        /// Run a single iteration and exit
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KAPPLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAPPLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KAPPLY_METRICS_ADDR; expected host:port");
        }
    }
}

fn summarize(what: &str, report: &BatchReport) -> bool {
    if report.is_success() {
        info!(succeeded = report.succeeded, "{what} finished");
    } else {
        for f in &report.failures {
            warn!(identity = %f.identity, status = ?f.status, "{}", f.message);
        }
        error!(failed = report.failures.len(), total = report.total(), "{what} finished with failures");
    }
    report.is_success()
}

fn removal_backoff(timeout_minutes: u64, attempts: u32) -> Duration {
    backoff_for_timeout(Duration::from_secs(timeout_minutes.saturating_mul(60)), attempts)
}

async fn reconciler(namespace: &str, patch: Patch) -> Result<Reconciler> {
    let resolver = KubeResolver::try_default().await.context("connecting to cluster")?;
    let mode = match patch {
        Patch::Strategic => ApplyMode::StrategicFirst,
        Patch::Merge => ApplyMode::MergeOnly,
    };
    Ok(Reconciler::with_apply_mode(Arc::new(resolver), namespace, mode))
}

/// Returns whether every operation succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let Some(command) = cli.command else {
        bail!("no command given: use install, remove or sync, or --debug to hold");
    };
    let fetcher = Arc::new(HttpFetcher::new()?);
    match command {
        Commands::Install { bundle, autoupdate } => {
            let catalog = Catalog::load(&bundle.catalog)?;
            let location = FileLocation::resolve(&catalog, bundle.file_source.as_deref(), bundle.file_path.as_deref())?;
            let wf = Workflow::new(reconciler(&cli.namespace, cli.patch).await?, fetcher);
            let report = wf
                .install(&InstallOptions {
                    catalog: &catalog,
                    location: &location,
                    pins: &bundle.components,
                    prereqs: bundle.prereqs.as_deref(),
                    autoupdate,
                })
                .await?;
            Ok(summarize("install", &report))
        }
        Commands::Remove { bundle, force, attempts, timeout, delete_namespace } => {
            if attempts == 0 {
                bail!("--attempts must be at least 1");
            }
            let catalog = Catalog::load(&bundle.catalog)?;
            let location = FileLocation::resolve(&catalog, bundle.file_source.as_deref(), bundle.file_path.as_deref())?;
            let backoff = removal_backoff(timeout, attempts);
            info!(force, attempts, backoff_ms = backoff.as_millis() as u64, "remove invoked");
            let wf = Workflow::new(reconciler(&cli.namespace, cli.patch).await?, fetcher);
            let report = wf
                .remove(&RemoveOptions {
                    catalog: &catalog,
                    location: &location,
                    pins: &bundle.components,
                    prereqs: bundle.prereqs.as_deref(),
                    removal: RemovalOptions { force, attempts, backoff },
                    delete_namespace,
                })
                .await?;
            Ok(summarize("remove", &report))
        }
        Commands::Sync { sources, source_dir, once } => {
            let sources: Vec<String> = sources.into_iter().filter(|s| !s.trim().is_empty()).collect();
            if sources.is_empty() && source_dir.is_none() {
                bail!("no sources: pass --source or --source-dir");
            }
            let mut lp = SyncLoop::new(
                reconciler(&cli.namespace, cli.patch).await?,
                fetcher,
                Arc::new(LivenessFile::from_env()),
                SourceList::new(sources, source_dir),
            );
            if once {
                let report = lp.run_once().await;
                return Ok(summarize("sync", &report.manifests) && report.sources_failed == 0);
            }
            lp.run().await;
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if let Some(minutes) = cli.debug {
        hold::hold(minutes).await;
        return Ok(());
    }

    match run(cli).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = ?e, "kapplyctl failed");
            std::process::exit(1);
        }
    }
}

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sandbox_orchestrator::config::Config;
use sandbox_orchestrator::sandbox::backends::dry_run::{DryRunBackend, FaultPoint};
use sandbox_orchestrator::sandbox::{self, SandboxConfig};

#[derive(Parser)]
#[command(name = "sandboxctl", about = "VM sandbox lifecycle runner (dry-run backend)")]
enum Cli {
    /// Create a sandbox from a config file, then clean up its containers
    Run {
        /// Sandbox config, JSON or YAML
        config: PathBuf,
        /// Override the sandbox ID (a random one is used if the config has none)
        #[arg(long)]
        id: Option<String>,
        /// Make an operation fail; may be repeated
        #[arg(long = "fail-at", value_name = "POINT")]
        fail_at: Vec<FaultPoint>,
        /// Clean up with force, skipping stop/delete failures
        #[arg(long)]
        force: bool,
        /// Leave the sandbox running instead of cleaning up
        #[arg(long)]
        keep: bool,
    },
    /// Parse and validate a config file without creating anything
    Validate {
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .init();

    match Cli::parse() {
        Cli::Run {
            config: path,
            id,
            fail_at,
            force,
            keep,
        } => run(&config, &path, id, fail_at, force, keep).await,
        Cli::Validate { config: path } => {
            let sandbox_config = load_sandbox_config(&path)?;
            sandbox_config
                .validate()
                .with_context(|| format!("invalid config: {}", path.display()))?;
            println!(
                "{}: ok ({} vcpus, {} MiB, {} containers)",
                path.display(),
                sandbox_config.hypervisor.vcpus,
                sandbox_config.hypervisor.memory_mb,
                sandbox_config.containers.len()
            );
            Ok(())
        }
    }
}

async fn run(
    config: &Config,
    path: &Path,
    id: Option<String>,
    fail_at: Vec<FaultPoint>,
    force: bool,
    keep: bool,
) -> Result<()> {
    let mut sandbox_config = load_sandbox_config(path)?;
    if let Some(id) = id {
        sandbox_config.id = id;
    }
    if sandbox_config.id.is_empty() {
        sandbox_config.id = uuid::Uuid::new_v4().to_string();
    }
    let sandbox_id = sandbox_config.id.clone();
    let container_ids: Vec<String> = sandbox_config
        .containers
        .iter()
        .map(|c| c.id.clone())
        .collect();

    let backend = Arc::new(DryRunBackend::new());
    let ledger = backend.ledger();
    for point in fail_at {
        tracing::info!(%point, "injecting fault");
        backend.faults().inject(point);
    }
    let orchestrator = sandbox::build_orchestrator(config, backend);

    let ctx = CancellationToken::new();
    let on_signal = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let created = orchestrator
        .create_sandbox(&ctx, sandbox_config, None, None)
        .await;
    if let Err(e) = created {
        print_ledger(&ledger.events());
        bail!("failed to create sandbox {sandbox_id}: {e}");
    }

    let status = orchestrator
        .status_sandbox(&sandbox_id)
        .await
        .context("failed to read sandbox status")?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if !keep {
        for container_id in &container_ids {
            orchestrator
                .cleanup_container(&ctx, &sandbox_id, container_id, force)
                .await
                .with_context(|| format!("failed to clean up container {container_id}"))?;
        }
    }

    print_ledger(&ledger.events());
    if keep || container_ids.is_empty() {
        println!("sandbox {sandbox_id} left running");
    } else if ledger.is_clean(&sandbox_id) {
        println!("sandbox {sandbox_id} fully removed");
    } else {
        bail!("sandbox {sandbox_id} left resources behind");
    }
    Ok(())
}

fn load_sandbox_config(path: &Path) -> Result<SandboxConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

fn print_ledger(events: &[String]) {
    println!("ledger:");
    for event in events {
        println!("  {event}");
    }
}

//! Admin client for the sharding control plane.
//!
//! Metadata lives in a JSON state file; shard data is simulated in process,
//! so a `script` run is the way to exercise data-dependent commands.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_shard::{
    parse_shard_list, AdminService, ClusterContext, CoordinatorConfig, InMemoryLockManager,
    MetadataStateStore, SimulatedShardCluster,
};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "holo-shard")]
#[command(about = "Sharding admin commands over a local metadata file", long_about = None)]
struct Args {
    /// Metadata state file. Created on first use.
    #[arg(long, env = "HOLO_SHARD_STATE", default_value = "holo-shard-state.json")]
    state: PathBuf,
    /// Shards registered when the state file is created (`name@endpoint,...`).
    #[arg(long, env = "HOLO_SHARD_SHARDS", default_value = "")]
    shards: String,
    /// Identity written into lock leases.
    #[arg(long, env = "HOLO_SHARD_PROCESS_ID")]
    process_id: Option<String>,
    #[arg(long, env = "HOLO_SHARD_LOCK_WAIT_MS", default_value_t = 5_000)]
    lock_wait_ms: u64,
    #[arg(long, env = "HOLO_SHARD_LOCK_TTL_MS", default_value_t = 15 * 60 * 1000)]
    lock_ttl_ms: u64,
    #[arg(long, env = "HOLO_SHARD_MAX_CHUNK_SIZE_BYTES", default_value_t = holo_shard::config::DEFAULT_MAX_CHUNK_SIZE_BYTES)]
    max_chunk_size_bytes: u64,
    /// Wait for donor cleanup before answering moveChunk.
    #[arg(long, env = "HOLO_SHARD_WAIT_FOR_DELETE", default_value_t = false)]
    wait_for_delete: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one JSON admin command and print the response.
    Exec { command: String },
    /// Run JSON admin commands from a file, one per line. Blank lines and
    /// lines starting with `#` are skipped.
    Script { path: PathBuf },
    /// Print the metadata state.
    State,
}

fn build_service(args: &Args) -> anyhow::Result<(AdminService, MetadataStateStore)> {
    let seed = parse_shard_list(&args.shards).context("parse --shards")?;
    let store = MetadataStateStore::load_or_init(&args.state, seed)
        .with_context(|| format!("open state file {}", args.state.display()))?;
    let state = store.state()?;

    let mut config = CoordinatorConfig {
        lock_wait: Duration::from_millis(args.lock_wait_ms),
        lock_ttl: Duration::from_millis(args.lock_ttl_ms),
        max_chunk_size_bytes: args.max_chunk_size_bytes,
        default_wait_for_delete: args.wait_for_delete,
        ..CoordinatorConfig::default()
    };
    if let Some(id) = &args.process_id {
        config.process_id = id.clone();
    }
    let locks = InMemoryLockManager::new(
        config.process_id.clone(),
        config.lock_ttl,
        config.lock_retry_interval,
    );
    let sim = SimulatedShardCluster::with_shards(state.shards.iter().map(|s| s.id.clone()));
    let ctx = ClusterContext::new(
        Arc::new(store.clone()),
        Arc::new(locks),
        Arc::new(sim),
        config,
    );
    Ok((AdminService::new(ctx), store))
}

async fn run_one(service: &AdminService, raw: &str) -> anyhow::Result<bool> {
    let doc: Value = serde_json::from_str(raw).with_context(|| format!("parse command {raw}"))?;
    let resp = service.run_command(&doc).await;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(resp.get("ok") == Some(&Value::from(1)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let (service, store) = build_service(&args)?;

    let all_ok = match &args.command {
        Command::Exec { command } => run_one(&service, command).await?,
        Command::Script { path } => {
            let script = std::fs::read_to_string(path)
                .with_context(|| format!("read script {}", path.display()))?;
            let mut all_ok = true;
            for line in script.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                all_ok &= run_one(&service, line).await?;
            }
            all_ok
        }
        Command::State => {
            println!("{}", serde_json::to_string_pretty(&store.state()?)?);
            true
        }
    };

    let drained = service.migrations().wait_for_pending_deletes().await?;
    if drained > 0 {
        tracing::debug!(drained, "finished deferred range deletes");
    }
    if !all_ok {
        std::process::exit(1);
    }
    Ok(())
}

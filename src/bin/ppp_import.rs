use anyhow::{Context, Result};
use clap::Parser;
use serde_json::to_string_pretty;
use std::path::PathBuf;
use tracing::{error, info};

use isp_panel::api::{SyncRequest, SyncResponse};
use isp_panel::config;
use isp_panel::db;
use isp_panel::reconcile::{self, ReconcileOptions};
use isp_panel::store::SqliteStore;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Import a PPPoE account list exported from a router into the subscriber table"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSON file shaped like the sync_ppp_to_db request body
    #[arg(long)]
    input: PathBuf,

    /// Delete subscribers of the router that are missing from the input,
    /// even when the file does not ask for it.
    #[arg(long)]
    prune: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let raw = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let (router_id, users, prune) = SyncRequest::parse(&raw)?;
    let prune = prune || args.prune;

    let database_url = cfg.database_url();
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool.clone());

    info!(router_id = %router_id, users = users.len(), prune, "starting import");
    let result = reconcile::reconcile(
        &store,
        &router_id,
        &users,
        prune,
        &ReconcileOptions::from(&cfg),
    )
    .await;

    match result {
        Ok(report) => {
            let stored = db::count_subscribers(&pool, router_id.trim()).await?;
            pool.close().await;
            info!(router_id = %router_id, stored, "router subscribers after import");
            let out = SyncResponse {
                success: true,
                report,
            };
            println!("{}", to_string_pretty(&out)?);
            Ok(())
        }
        Err(err) => {
            pool.close().await;
            if let Some(partial) = err.partial_report() {
                println!("{}", to_string_pretty(partial)?);
            }
            error!(%err, "import failed");
            Err(err.into())
        }
    }
}

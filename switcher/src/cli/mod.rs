use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::coordinator::{zk::ZkStore, Coordinator};
use crate::http;
use crate::manager::SessionManager;
use crate::upgrade::RuntimeData;

#[derive(Parser, Debug)]
#[command(
    name = "stratum-switcher",
    version,
    about = "Currency-switchable Stratum proxy",
    long_about = "A Stratum proxy that routes each miner to the upstream of its \
                  sub-account's assigned currency and re-homes live sessions when \
                  the assignment changes, without dropping the miner connection."
)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "./config.toml")]
    pub config: PathBuf,

    /// Runtime file written by a zero-downtime upgrade
    #[arg(long, value_name = "FILE")]
    pub runtime: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn setup_logging(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("bad log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args)?;

    let config = Config::load_from_file(&args.config).context("load config failed")?;

    // A missing or unreadable runtime file is not fatal: the process simply
    // starts with no inherited sessions.
    let runtime = args.runtime.as_ref().and_then(|path| {
        RuntimeData::load_from_file(path)
            .map_err(|e| warn!("load runtime file failed: {}", e))
            .ok()
    });
    let prev_server_id = runtime.as_ref().map(|r| r.server_id).unwrap_or(0);

    let store = ZkStore::connect(&config.coordinator.brokers)
        .await
        .context("coordinator connect failed")?;
    let coordinator = Coordinator::new(Arc::new(store));

    let http_debug = config.http_debug.clone();
    let manager = SessionManager::new(config, coordinator, prev_server_id)
        .await
        .context("create session manager failed")?;

    if http_debug.enabled {
        http::spawn_debug_server(Arc::clone(&manager), http_debug.listen_addr);
    }

    manager.run(runtime).await.context("run failed")?;
    Ok(())
}

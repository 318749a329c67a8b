use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tinyweb::config::Config;
use tinyweb::logging;
use tinyweb::server::WebServer;
use tinyweb::store::{UserStore, UserTable};

const DEFAULT_CONFIG_PATH: &str = "config.txt";

/// Static file server with login and registration pages
#[derive(Parser, Debug)]
#[command(name = "tinyweb")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the `key:value` config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port, overriding the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory served as the site root, overriding the config file
    #[arg(long)]
    src_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(src_dir) = args.src_dir {
        config.src_dir = src_dir;
    }

    let _log_guard = logging::init(&config)?;

    let table_path = config.user_table_path();
    let table = UserTable::open(&table_path)
        .with_context(|| format!("failed to open user table {}", table_path.display()))?;
    let store = Arc::new(UserStore::new(table, config.conn_pool_num));

    let mut server = WebServer::new(&config, store.clone())?;
    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        handle.shutdown();
    })
    .context("failed to install signal handler")?;

    server.run()?;
    store.pool().close();

    info!("shutdown complete");
    Ok(())
}

/// An explicit path must exist; the default path is optional.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Ok(Config::load(DEFAULT_CONFIG_PATH)?),
        None => Ok(Config::default()),
    }
}

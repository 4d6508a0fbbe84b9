//! The precache daemon entrypoint: loads configuration, opens the tracking
//! index, wires the upstream gateway and precache manager together, and
//! serves the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use log::warn;

use irobot_precache::auth::AuthChain;
use irobot_precache::backup::upstream::HttpUpstreamGateway;
use irobot_precache::backup::{BoundedUpstreamGateway, PrecacheManager, TrackingIndex, UpstreamGateway};
use irobot_precache::config::Config;
use irobot_precache::server;

#[derive(Parser, Debug)]
#[command(name = "irobotd", about = "Precache broker between an upstream object store and HTTP clients")]
struct Args {
    /// Path to the daemon's TOML configuration file.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(irobot_precache::buildcfg::DEFAULT_CONFIG_FN));
    let config = Config::load(&config_path)?;

    std::fs::create_dir_all(&config.precache_location)
        .with_context(|| format!("unable to create precache location {:?}", config.precache_location))?;

    let index = Arc::new(TrackingIndex::open(&config.precache_index, &config.precache_location)?);

    let upstream_inner = HttpUpstreamGateway::new(config.upstream_base_url.clone());
    let upstream: Arc<dyn UpstreamGateway> =
        Arc::new(BoundedUpstreamGateway::new(upstream_inner, config.max_connections));

    let manager = PrecacheManager::new(index, upstream, config.clone());

    let invalidator = manager.invalidator();
    let _sweep_handle = invalidator.spawn_periodic_sweep();

    // Authentication handlers and their caches are a separate concern; this
    // daemon only knows how to run the empty chain.
    if !config.authentication.is_empty() {
        warn!(
            "httpd.authentication names {:?} but no concrete handler is wired in; falling back to anonymous",
            config.authentication
        );
    }
    let auth = AuthChain::empty_allows_anonymous();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("unable to start the tokio runtime")?;

    runtime.block_on(server::run(manager, auth, config))
}

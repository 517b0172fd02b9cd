use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcpfusion::Config;
use mcpfusion::broker::TokenBroker;
use mcpfusion::http::{AppState, build_router};
use mcpfusion::services::{ServiceEngine, ServiceRegistry};
use mcpfusion::store::{Store, StoreError};

#[derive(Parser, Debug)]
#[command(name = "mcpfusion", about = "Multi-tenant MCP gateway for SaaS APIs")]
struct Args {
	/// Gateway config file (YAML).
	#[arg(long)]
	config: Option<PathBuf>,
	/// Service descriptor file (YAML, `services:` list).
	#[arg(long)]
	services: Option<PathBuf>,
	/// Listen address override.
	#[arg(long)]
	listen: Option<SocketAddr>,
	/// Data directory override.
	#[arg(long)]
	data_dir: Option<PathBuf>,
	/// Verbose diagnostics.
	#[arg(long)]
	debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut config: Config = match &args.config {
		Some(path) => {
			let raw = std::fs::read_to_string(path)
				.with_context(|| format!("reading config {}", path.display()))?;
			serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
		},
		None => Config::default(),
	};
	if let Some(listen) = args.listen {
		config.listen_addr = listen;
	}
	if let Some(data_dir) = args.data_dir {
		config.data_dir = Some(data_dir);
	}
	config.debug |= args.debug;

	init_logging(config.debug)?;

	let registry = Arc::new(match &args.services {
		Some(path) => {
			let raw = std::fs::read_to_string(path)
				.with_context(|| format!("reading services {}", path.display()))?;
			ServiceRegistry::from_yaml(&raw)?
		},
		None => ServiceRegistry::default(),
	});
	if registry.is_empty() {
		warn!("no service descriptors configured; the tool catalog is empty");
	}

	let store = Store::open(config.db_path()).context("opening store")?;
	let http = reqwest::Client::builder()
		.user_agent("mcpfusion")
		.build()
		.context("building http client")?;
	let broker = TokenBroker::with_timing(
		store.clone(),
		registry.clone(),
		http.clone(),
		config.refresh_skew(),
		config.refresh_timeout(),
	);
	let engine = Arc::new(ServiceEngine::new(
		store.clone(),
		registry.clone(),
		broker.clone(),
		http,
		config.provider_timeout(),
	));

	spawn_auth_code_sweeper(store.clone(), config.auth_code_sweep_interval());

	let config = Arc::new(config);
	let state = AppState {
		store: store.clone(),
		registry,
		broker,
		engine,
		config: config.clone(),
	};

	let listener = tokio::net::TcpListener::bind(config.listen_addr)
		.await
		.with_context(|| format!("binding {}", config.listen_addr))?;
	info!(addr = %config.listen_addr, "gateway listening");
	axum::serve(listener, build_router(state))
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("serving")?;

	store.close();
	info!("gateway stopped");
	Ok(())
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
	let default = if debug { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.try_init()
		.map_err(|e| anyhow::anyhow!("logger init: {e}"))
}

fn spawn_auth_code_sweeper(store: Arc<Store>, period: std::time::Duration) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(period);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			interval.tick().await;
			match store.cleanup_expired_auth_codes() {
				Ok(0) => {},
				Ok(swept) => info!(swept, "auth code sweep"),
				Err(StoreError::Closed) => break,
				Err(e) => warn!(error = %e, "auth code sweep failed"),
			}
		}
	});
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(_) => std::future::pending::<()>().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	info!("shutdown signal received");
}

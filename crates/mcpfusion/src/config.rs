use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_FILENAME: &str = "mcpfusion.db";

/// Gateway configuration. Loaded from the app config file and CLI flags; the
/// library never reads the environment or globals itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
	pub listen_addr: SocketAddr,
	/// Data directory override. When unset it is resolved at startup, see
	/// [`resolve_data_dir`].
	pub data_dir: Option<PathBuf>,
	pub db_filename: String,
	/// Verbose diagnostics. Threaded explicitly instead of a process-wide flag.
	pub debug: bool,
	/// Tokens within this many seconds of expiry are treated as expired.
	pub refresh_skew_secs: u64,
	/// Hard cap on a single refresh-token exchange.
	pub refresh_timeout_secs: u64,
	/// Default deadline for outbound provider calls; endpoints may override.
	pub provider_timeout_secs: u64,
	/// Interval of the expired auth-code sweeper.
	pub auth_code_sweep_secs: u64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			listen_addr: "127.0.0.1:8085".parse().expect("static addr"),
			data_dir: None,
			db_filename: DEFAULT_DB_FILENAME.to_string(),
			debug: false,
			refresh_skew_secs: 60,
			refresh_timeout_secs: 30,
			provider_timeout_secs: 30,
			auth_code_sweep_secs: 60,
		}
	}
}

impl Config {
	pub fn refresh_skew(&self) -> Duration {
		Duration::from_secs(self.refresh_skew_secs)
	}

	pub fn refresh_timeout(&self) -> Duration {
		Duration::from_secs(self.refresh_timeout_secs)
	}

	pub fn provider_timeout(&self) -> Duration {
		Duration::from_secs(self.provider_timeout_secs)
	}

	pub fn auth_code_sweep_interval(&self) -> Duration {
		Duration::from_secs(self.auth_code_sweep_secs)
	}

	/// Full path of the store file, resolving the data directory if needed.
	pub fn db_path(&self) -> PathBuf {
		let dir = match &self.data_dir {
			Some(dir) => dir.clone(),
			None => resolve_data_dir(),
		};
		dir.join(&self.db_filename)
	}
}

/// Resolve the directory holding the store file: `/opt/mcpfusion` when
/// writable, then `$HOME/.mcpfusion`, then a temp-dir fallback.
pub fn resolve_data_dir() -> PathBuf {
	let system = PathBuf::from("/opt/mcpfusion");
	if dir_is_writable(&system) {
		return system;
	}
	if let Some(home) = std::env::var_os("HOME") {
		let dir = PathBuf::from(home).join(".mcpfusion");
		if dir_is_writable(&dir) {
			return dir;
		}
	}
	let fallback = std::env::temp_dir().join("mcpfusion");
	let _ = std::fs::create_dir_all(&fallback);
	fallback
}

fn dir_is_writable(dir: &Path) -> bool {
	if std::fs::create_dir_all(dir).is_err() {
		return false;
	}
	let probe = dir.join(".write-probe");
	match std::fs::write(&probe, b"") {
		Ok(()) => {
			let _ = std::fs::remove_file(&probe);
			true
		},
		Err(_) => false,
	}
}

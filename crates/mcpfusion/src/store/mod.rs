//! Embedded persistent store for API tokens, tenants, OAuth bundles,
//! per-tenant service credentials and ephemeral auth codes.
//!
//! One redb file owns all durable state; each logical bucket from the schema
//! is its own table. All writes are transactional and commit-or-abort on
//! every exit path.

mod api_tokens;
mod authcodes;
mod oauth;
mod records;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{RwLock, RwLockReadGuard};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use api_tokens::hash_token;
pub use records::{
	ApiTokenRecord, AuthCodeRecord, RawToken, SHORT_HASH_LEN, ServiceCredentials, TenantRecord,
	TokenBundle, short_hash,
};

use crate::errors::ErrorKind;

pub(crate) const API_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_tokens");
pub(crate) const TOKEN_INDEX_BY_HASH: TableDefinition<&str, &str> =
	TableDefinition::new("token_index/by_hash");
pub(crate) const TOKEN_INDEX_BY_PREFIX: TableDefinition<&str, &str> =
	TableDefinition::new("token_index/by_prefix");
pub(crate) const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");
pub(crate) const OAUTH_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenant/oauth");
pub(crate) const SERVICE_CREDENTIALS: TableDefinition<&str, &[u8]> =
	TableDefinition::new("tenant/credentials");
pub(crate) const AUTH_CODES: TableDefinition<&str, &[u8]> = TableDefinition::new("auth_codes");
pub(crate) const SYSTEM: TableDefinition<&str, &str> = TableDefinition::new("system");

pub(crate) const SCHEMA_VERSION: &str = "1";

/// Queue depth of the asynchronous last-used updater. Touches beyond this are
/// dropped so validation latency never depends on write throughput.
const TOUCH_QUEUE_DEPTH: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	/// Sentinel for access after [`Store::close`]; callers shut down cleanly.
	#[error("store is closed")]
	Closed,
	#[error("{op}: {message}")]
	Validation { op: &'static str, message: String },
	#[error("{op}: not found")]
	NotFound { op: &'static str },
	#[error("{op}: no token stored")]
	TokenNotFound { op: &'static str },
	#[error("{op}: identifier matches {count} tokens")]
	Ambiguous { op: &'static str, count: usize },
	#[error("{op}: duplicate token hash")]
	Duplicate { op: &'static str },
	#[error("{op}: {source}")]
	Database {
		op: &'static str,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
}

impl StoreError {
	pub(crate) fn database(
		op: &'static str,
		source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
	) -> Self {
		StoreError::Database {
			op,
			source: source.into(),
		}
	}

	pub(crate) fn validation(op: &'static str, message: impl Into<String>) -> Self {
		StoreError::Validation {
			op,
			message: message.into(),
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			StoreError::Closed | StoreError::Database { .. } => ErrorKind::Database,
			StoreError::Validation { .. } | StoreError::Ambiguous { .. } => ErrorKind::Validation,
			StoreError::NotFound { .. } => ErrorKind::NotFound,
			StoreError::TokenNotFound { .. } => ErrorKind::TokenNotFound,
			StoreError::Duplicate { .. } => ErrorKind::Duplicate,
		}
	}
}

pub struct Store {
	db: RwLock<Option<Database>>,
	path: PathBuf,
	touch_tx: OnceLock<mpsc::Sender<String>>,
}

impl std::fmt::Debug for Store {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Store").field("path", &self.path).finish()
	}
}

impl Store {
	/// Open (creating if needed) the store file at `path`.
	pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
		const OP: &str = "open";
		let path = path.as_ref().to_path_buf();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| StoreError::database(OP, e))?;
		}
		let db = Database::create(&path).map_err(|e| StoreError::database(OP, e))?;
		restrict_permissions(&path);

		// Create every table up front so reads never race table creation, and
		// stamp or verify the schema version in the same transaction.
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		{
			tx.open_table(API_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			tx.open_table(TOKEN_INDEX_BY_HASH)
				.map_err(|e| StoreError::database(OP, e))?;
			tx.open_table(TOKEN_INDEX_BY_PREFIX)
				.map_err(|e| StoreError::database(OP, e))?;
			tx.open_table(TENANTS)
				.map_err(|e| StoreError::database(OP, e))?;
			tx.open_table(OAUTH_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			tx.open_table(SERVICE_CREDENTIALS)
				.map_err(|e| StoreError::database(OP, e))?;
			tx.open_table(AUTH_CODES)
				.map_err(|e| StoreError::database(OP, e))?;
			let mut system = tx
				.open_table(SYSTEM)
				.map_err(|e| StoreError::database(OP, e))?;
			let stored = system
				.get("schema_version")
				.map_err(|e| StoreError::database(OP, e))?
				.map(|v| v.value().to_string());
			match stored.as_deref() {
				None => {
					system
						.insert("schema_version", SCHEMA_VERSION)
						.map_err(|e| StoreError::database(OP, e))?;
				},
				Some(v) if v != SCHEMA_VERSION => migrate_schema(v),
				Some(_) => {},
			}
		}
		tx.commit().map_err(|e| StoreError::database(OP, e))?;

		info!(path = %path.display(), "store opened");
		Ok(Arc::new(Self {
			db: RwLock::new(Some(db)),
			path,
			touch_tx: OnceLock::new(),
		}))
	}

	/// Close the store. Subsequent access yields [`StoreError::Closed`].
	pub fn close(&self) {
		if self.db.write().take().is_some() {
			info!(path = %self.path.display(), "store closed");
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Copy the live store file to `dest` while holding a read transaction so
	/// no writer commits mid-copy.
	pub fn backup(&self, dest: impl AsRef<Path>) -> Result<u64, StoreError> {
		const OP: &str = "backup";
		let db = self.db()?;
		let _tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;
		let bytes = std::fs::copy(&self.path, dest.as_ref()).map_err(|e| StoreError::database(OP, e))?;
		info!(dest = %dest.as_ref().display(), bytes, "store backed up");
		Ok(bytes)
	}

	pub(crate) fn db(&self) -> Result<MappedDb<'_>, StoreError> {
		RwLockReadGuard::try_map(self.db.read(), |db| db.as_ref()).map_err(|_| StoreError::Closed)
	}

	/// Enqueue an asynchronous `last_used` update. Never blocks: a full queue
	/// drops the touch.
	pub(crate) fn schedule_touch(self: &Arc<Self>, hash: &str) {
		let tx = self.touch_tx.get_or_init(|| {
			let (tx, rx) = mpsc::channel(TOUCH_QUEUE_DEPTH);
			tokio::spawn(touch_worker(Arc::downgrade(self), rx));
			tx
		});
		if tx.try_send(hash.to_string()).is_err() {
			debug!("last-used queue full, dropping update");
		}
	}
}

pub(crate) type MappedDb<'a> = parking_lot::MappedRwLockReadGuard<'a, Database>;

async fn touch_worker(store: Weak<Store>, mut rx: mpsc::Receiver<String>) {
	while let Some(hash) = rx.recv().await {
		let Some(store) = store.upgrade() else {
			return;
		};
		// No retries: a missed touch only staledates a display field.
		if let Err(e) = store.touch_last_used(&hash) {
			warn!(error = %e, "failed to update token last-used");
		}
	}
}

fn migrate_schema(found: &str) {
	// Migration hook: versions are currently compatible, so this only records
	// the mismatch. Real migrations hang off this point.
	warn!(
		found,
		expected = SCHEMA_VERSION,
		"store schema version mismatch"
	);
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
	use std::os::unix::fs::PermissionsExt;
	if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
		warn!(error = %e, path = %path.display(), "failed to restrict store permissions");
	}
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

pub(crate) fn encode<T: Serialize>(op: &'static str, value: &T) -> Result<Vec<u8>, StoreError> {
	serde_json::to_vec(value).map_err(|e| StoreError::database(op, e))
}

pub(crate) fn decode<T: DeserializeOwned>(op: &'static str, bytes: &[u8]) -> Result<T, StoreError> {
	serde_json::from_slice(bytes).map_err(|e| StoreError::database(op, e))
}

/// Composite key for the per-tenant tables.
pub(crate) fn tenant_key(tenant_hash: &str, service: &str) -> String {
	format!("{tenant_hash}/{service}")
}

/// Range bounds covering every `tenant_key` of one tenant. Relies on `0`
/// being the successor of `/` in key order.
pub(crate) fn tenant_range(tenant_hash: &str) -> (String, String) {
	(format!("{tenant_hash}/"), format!("{tenant_hash}0"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn open_close_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.db");
		let store = Store::open(&path).unwrap();
		store.close();
		assert_matches::assert_matches!(
			store.list_api_tokens().unwrap_err(),
			StoreError::Closed
		);
		// A fresh handle opens the same file again.
		let store = Store::open(&path).unwrap();
		assert!(store.list_api_tokens().unwrap().is_empty());
	}

	#[tokio::test]
	async fn backup_copies_file() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(dir.path().join("test.db")).unwrap();
		store.add_api_token("backup me").unwrap();
		let dest = dir.path().join("copy.db");
		let bytes = store.backup(&dest).unwrap();
		assert!(bytes > 0);
		let restored = Store::open(&dest).unwrap();
		assert_eq!(restored.list_api_tokens().unwrap().len(), 1);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn store_file_is_private() {
		use std::os::unix::fs::PermissionsExt;
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.db");
		let _store = Store::open(&path).unwrap();
		let mode = std::fs::metadata(&path).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o600);
	}
}

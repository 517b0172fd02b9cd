use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use redb::ReadableTable;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::records::{RawToken, SHORT_HASH_LEN, short_hash};
use super::{
	API_TOKENS, ApiTokenRecord, Store, StoreError, TENANTS, TOKEN_INDEX_BY_HASH,
	TOKEN_INDEX_BY_PREFIX, TenantRecord, decode, encode,
};

/// Raw tokens are 32 random bytes, hex-encoded to 64 characters.
const RAW_TOKEN_BYTES: usize = 32;
/// Length of a hex SHA-256, the full token/tenant hash.
const HASH_LEN: usize = 64;

pub fn hash_token(raw: &str) -> String {
	hex::encode(Sha256::digest(raw.as_bytes()))
}

impl Store {
	/// Mint a new API token. The raw token is returned exactly once and never
	/// persisted; only its hash and display prefix are.
	pub fn add_api_token(
		&self,
		description: &str,
	) -> Result<(RawToken, ApiTokenRecord), StoreError> {
		const OP: &str = "add_api_token";
		if description.trim().is_empty() {
			return Err(StoreError::validation(OP, "description must not be empty"));
		}
		let mut bytes = [0u8; RAW_TOKEN_BYTES];
		rand::rng().fill_bytes(&mut bytes);
		let raw = hex::encode(bytes);
		let record = self.insert_api_token(&raw, description)?;
		info!(
			tenant = short_hash(&record.hash),
			prefix = %record.prefix,
			"api token created"
		);
		Ok((RawToken::new(raw), record))
	}

	fn insert_api_token(&self, raw: &str, description: &str) -> Result<ApiTokenRecord, StoreError> {
		const OP: &str = "add_api_token";
		let hash = hash_token(raw);
		let record = ApiTokenRecord {
			hash: hash.clone(),
			prefix: raw[..SHORT_HASH_LEN].to_string(),
			description: description.to_string(),
			created_at: Utc::now(),
			last_used: None,
		};
		let encoded = encode(OP, &record)?;

		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		{
			let mut by_hash = tx
				.open_table(TOKEN_INDEX_BY_HASH)
				.map_err(|e| StoreError::database(OP, e))?;
			if by_hash
				.get(hash.as_str())
				.map_err(|e| StoreError::database(OP, e))?
				.is_some()
			{
				return Err(StoreError::Duplicate { op: OP });
			}
			by_hash
				.insert(hash.as_str(), hash.as_str())
				.map_err(|e| StoreError::database(OP, e))?;

			let mut by_prefix = tx
				.open_table(TOKEN_INDEX_BY_PREFIX)
				.map_err(|e| StoreError::database(OP, e))?;
			by_prefix
				.insert(record.prefix.as_str(), hash.as_str())
				.map_err(|e| StoreError::database(OP, e))?;

			let mut tokens = tx
				.open_table(API_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			tokens
				.insert(hash.as_str(), encoded.as_slice())
				.map_err(|e| StoreError::database(OP, e))?;

			let mut tenants = tx
				.open_table(TENANTS)
				.map_err(|e| StoreError::database(OP, e))?;
			let tenant = TenantRecord {
				hash: hash.clone(),
				created_at: record.created_at,
			};
			tenants
				.insert(hash.as_str(), encode(OP, &tenant)?.as_slice())
				.map_err(|e| StoreError::database(OP, e))?;
		}
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		Ok(record)
	}

	/// Check a raw token against the hash index. `Ok(None)` means the token is
	/// unknown; a hit schedules an asynchronous last-used update so the hot
	/// path stays a single read.
	pub fn validate_api_token(
		self: &Arc<Self>,
		raw: &str,
	) -> Result<Option<ApiTokenRecord>, StoreError> {
		const OP: &str = "validate_api_token";
		let hash = hash_token(raw);
		let db = self.db()?;
		let tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;
		let by_hash = tx
			.open_table(TOKEN_INDEX_BY_HASH)
			.map_err(|e| StoreError::database(OP, e))?;
		if by_hash
			.get(hash.as_str())
			.map_err(|e| StoreError::database(OP, e))?
			.is_none()
		{
			return Ok(None);
		}
		let tokens = tx
			.open_table(API_TOKENS)
			.map_err(|e| StoreError::database(OP, e))?;
		let Some(value) = tokens
			.get(hash.as_str())
			.map_err(|e| StoreError::database(OP, e))?
		else {
			warn!(tenant = short_hash(&hash), "token index entry without metadata");
			return Ok(None);
		};
		let record: ApiTokenRecord = decode(OP, value.value())?;
		drop(value);
		drop(tokens);
		drop(by_hash);
		drop(tx);
		drop(db);
		self.schedule_touch(&hash);
		Ok(Some(record))
	}

	/// Resolve a token identifier to its full hash: a 64-char input is taken
	/// as the hash itself, a 12-char input as the exact display prefix, and
	/// anything shorter as a prefix-of-prefix scan that must match uniquely.
	pub fn resolve_api_token(&self, identifier: &str) -> Result<String, StoreError> {
		const OP: &str = "resolve_api_token";
		if identifier.is_empty() {
			return Err(StoreError::validation(OP, "identifier must not be empty"));
		}
		if identifier.len() > HASH_LEN {
			return Err(StoreError::validation(OP, "identifier longer than a hash"));
		}
		let db = self.db()?;
		let tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;

		if identifier.len() == HASH_LEN {
			let tokens = tx
				.open_table(API_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			return match tokens
				.get(identifier)
				.map_err(|e| StoreError::database(OP, e))?
			{
				Some(_) => Ok(identifier.to_string()),
				None => Err(StoreError::TokenNotFound { op: OP }),
			};
		}

		let by_prefix = tx
			.open_table(TOKEN_INDEX_BY_PREFIX)
			.map_err(|e| StoreError::database(OP, e))?;
		if let Some(hash) = by_prefix
			.get(identifier)
			.map_err(|e| StoreError::database(OP, e))?
		{
			return Ok(hash.value().to_string());
		}

		// Scan for stored prefixes extending the identifier.
		let mut matches = Vec::new();
		for item in by_prefix
			.range(identifier..)
			.map_err(|e| StoreError::database(OP, e))?
		{
			let (key, value) = item.map_err(|e| StoreError::database(OP, e))?;
			if !key.value().starts_with(identifier) {
				break;
			}
			matches.push(value.value().to_string());
			if matches.len() > 1 {
				break;
			}
		}
		match matches.len() {
			0 => Err(StoreError::TokenNotFound { op: OP }),
			1 => Ok(matches.remove(0)),
			n => Err(StoreError::Ambiguous { op: OP, count: n }),
		}
	}

	/// Delete a token and its index entries. Missing index entries are logged
	/// and skipped; only missing metadata is an error.
	pub fn delete_api_token(&self, hash: &str) -> Result<(), StoreError> {
		const OP: &str = "delete_api_token";
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		{
			let mut tokens = tx
				.open_table(API_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			let Some(value) = tokens
				.remove(hash)
				.map_err(|e| StoreError::database(OP, e))?
			else {
				return Err(StoreError::TokenNotFound { op: OP });
			};
			let record: ApiTokenRecord = decode(OP, value.value())?;
			drop(value);

			let mut by_hash = tx
				.open_table(TOKEN_INDEX_BY_HASH)
				.map_err(|e| StoreError::database(OP, e))?;
			if by_hash
				.remove(hash)
				.map_err(|e| StoreError::database(OP, e))?
				.is_none()
			{
				debug!(tenant = short_hash(hash), "hash index entry already absent");
			}
			let mut by_prefix = tx
				.open_table(TOKEN_INDEX_BY_PREFIX)
				.map_err(|e| StoreError::database(OP, e))?;
			if by_prefix
				.remove(record.prefix.as_str())
				.map_err(|e| StoreError::database(OP, e))?
				.is_none()
			{
				debug!(tenant = short_hash(hash), "prefix index entry already absent");
			}
			let mut tenants = tx
				.open_table(TENANTS)
				.map_err(|e| StoreError::database(OP, e))?;
			tenants
				.remove(hash)
				.map_err(|e| StoreError::database(OP, e))?;
		}
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		info!(tenant = short_hash(hash), "api token deleted");
		Ok(())
	}

	pub fn get_tenant(&self, hash: &str) -> Result<Option<TenantRecord>, StoreError> {
		const OP: &str = "get_tenant";
		let db = self.db()?;
		let tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;
		let tenants = tx
			.open_table(TENANTS)
			.map_err(|e| StoreError::database(OP, e))?;
		match tenants
			.get(hash)
			.map_err(|e| StoreError::database(OP, e))?
		{
			Some(value) => Ok(Some(decode(OP, value.value())?)),
			None => Ok(None),
		}
	}

	pub fn list_api_tokens(&self) -> Result<Vec<ApiTokenRecord>, StoreError> {
		const OP: &str = "list_api_tokens";
		let db = self.db()?;
		let tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;
		let tokens = tx
			.open_table(API_TOKENS)
			.map_err(|e| StoreError::database(OP, e))?;
		let mut out = Vec::new();
		for item in tokens.iter().map_err(|e| StoreError::database(OP, e))? {
			let (_, value) = item.map_err(|e| StoreError::database(OP, e))?;
			out.push(decode(OP, value.value())?);
		}
		Ok(out)
	}

	pub(crate) fn touch_last_used(&self, hash: &str) -> Result<(), StoreError> {
		const OP: &str = "touch_last_used";
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		{
			let mut tokens = tx
				.open_table(API_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			let Some(value) = tokens
				.get(hash)
				.map_err(|e| StoreError::database(OP, e))?
			else {
				return Err(StoreError::TokenNotFound { op: OP });
			};
			let mut record: ApiTokenRecord = decode(OP, value.value())?;
			drop(value);
			record.last_used = Some(Utc::now());
			tokens
				.insert(hash, encode(OP, &record)?.as_slice())
				.map_err(|e| StoreError::database(OP, e))?;
		}
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	fn open_store() -> (tempfile::TempDir, Arc<Store>) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(dir.path().join("test.db")).unwrap();
		(dir, store)
	}

	#[tokio::test]
	async fn create_and_validate() {
		let (_dir, store) = open_store();
		let (raw, record) = store.add_api_token("ops").unwrap();
		assert_eq!(format!("{raw:?}"), "<redacted>");
		let raw = raw.expose();
		assert_eq!(raw.len(), 64);
		assert!(raw.chars().all(|c| c.is_ascii_hexdigit()));
		assert_eq!(record.hash.len(), 64);
		assert_eq!(record.hash, hash_token(&raw));
		assert_eq!(record.prefix, &raw[..12]);

		let validated = store.validate_api_token(raw).unwrap().unwrap();
		assert_eq!(validated.hash, record.hash);
		assert!(store.validate_api_token("garbage").unwrap().is_none());
		// Minting a token also creates the tenant identity.
		assert!(store.get_tenant(&record.hash).unwrap().is_some());
	}

	#[tokio::test]
	async fn duplicate_hash_rejected() {
		let (_dir, store) = open_store();
		let raw = "aa".repeat(32);
		store.insert_api_token(&raw, "first").unwrap();
		assert_matches!(
			store.insert_api_token(&raw, "second"),
			Err(StoreError::Duplicate { .. })
		);
	}

	#[tokio::test]
	async fn resolve_full_hash_and_prefix() {
		let (_dir, store) = open_store();
		let (raw, record) = store.add_api_token("resolver").unwrap();
		let raw = raw.expose();
		assert_eq!(store.resolve_api_token(&record.hash).unwrap(), record.hash);
		assert_eq!(store.resolve_api_token(&raw[..12]).unwrap(), record.hash);
		assert_eq!(store.resolve_api_token(&raw[..8]).unwrap(), record.hash);
	}

	#[tokio::test]
	async fn resolve_ambiguous_and_missing() {
		let (_dir, store) = open_store();
		let raw_a = format!("abc1{}", "0".repeat(60));
		let raw_b = format!("abc2{}", "0".repeat(60));
		store.insert_api_token(&raw_a, "a").unwrap();
		let b = store.insert_api_token(&raw_b, "b").unwrap();

		assert_matches!(
			store.resolve_api_token("abc"),
			Err(StoreError::Ambiguous { count: 2, .. })
		);
		assert_eq!(store.resolve_api_token("abc2").unwrap(), b.hash);
		assert_matches!(
			store.resolve_api_token("zzzz"),
			Err(StoreError::TokenNotFound { .. })
		);
		assert_matches!(
			store.resolve_api_token(""),
			Err(StoreError::Validation { .. })
		);
	}

	#[tokio::test]
	async fn delete_removes_token_and_indexes() {
		let (_dir, store) = open_store();
		let (raw, record) = store.add_api_token("doomed").unwrap();
		store.delete_api_token(&record.hash).unwrap();
		assert!(store.validate_api_token(raw.expose()).unwrap().is_none());
		assert!(store.get_tenant(&record.hash).unwrap().is_none());
		assert_matches!(
			store.resolve_api_token(&record.prefix),
			Err(StoreError::TokenNotFound { .. })
		);
		assert_matches!(
			store.delete_api_token(&record.hash),
			Err(StoreError::TokenNotFound { .. })
		);
	}

	#[tokio::test]
	async fn touch_updates_last_used() {
		let (_dir, store) = open_store();
		let (_, record) = store.add_api_token("touched").unwrap();
		assert!(record.last_used.is_none());
		store.touch_last_used(&record.hash).unwrap();
		let listed = store.list_api_tokens().unwrap();
		assert!(listed[0].last_used.is_some());
	}
}

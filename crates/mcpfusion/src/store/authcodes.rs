use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use redb::ReadableTable;
use tracing::{debug, info};

use super::records::short_hash;
use super::{AUTH_CODES, AuthCodeRecord, Store, StoreError, decode, encode};

/// Auth codes are 16 random bytes, hex-encoded to 32 characters.
const AUTH_CODE_BYTES: usize = 16;
/// Upper bound on a code's lifetime.
pub const MAX_AUTH_CODE_TTL: Duration = Duration::from_secs(600);

impl Store {
	/// Mint a single-use code binding (tenant, service) for the CLI helper.
	pub fn create_auth_code(
		&self,
		tenant_hash: &str,
		service: &str,
		ttl: Duration,
	) -> Result<String, StoreError> {
		const OP: &str = "create_auth_code";
		if service.is_empty() {
			return Err(StoreError::validation(OP, "service must not be empty"));
		}
		if ttl.is_zero() || ttl > MAX_AUTH_CODE_TTL {
			return Err(StoreError::validation(
				OP,
				format!("ttl must be within (0, {}s]", MAX_AUTH_CODE_TTL.as_secs()),
			));
		}
		let mut bytes = [0u8; AUTH_CODE_BYTES];
		rand::rng().fill_bytes(&mut bytes);
		let code = hex::encode(bytes);
		let now = Utc::now();
		let record = AuthCodeRecord {
			code: code.clone(),
			tenant_hash: tenant_hash.to_string(),
			service: service.to_string(),
			expires_at: now
				+ chrono::Duration::from_std(ttl)
					.map_err(|e| StoreError::validation(OP, e.to_string()))?,
			created_at: now,
		};
		let encoded = encode(OP, &record)?;
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		{
			let mut table = tx
				.open_table(AUTH_CODES)
				.map_err(|e| StoreError::database(OP, e))?;
			table
				.insert(code.as_str(), encoded.as_slice())
				.map_err(|e| StoreError::database(OP, e))?;
		}
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		info!(
			tenant = short_hash(tenant_hash),
			service,
			ttl_secs = ttl.as_secs(),
			"auth code created"
		);
		Ok(code)
	}

	/// Consume a code, returning its (tenant, service) binding. Codes validate
	/// exactly once: the lookup and the delete happen in one transaction, and
	/// an expired code is removed and reported as missing.
	pub fn validate_auth_code(&self, code: &str) -> Result<(String, String), StoreError> {
		const OP: &str = "validate_auth_code";
		if code.is_empty() {
			return Err(StoreError::validation(OP, "code must not be empty"));
		}
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		let record = {
			let mut table = tx
				.open_table(AUTH_CODES)
				.map_err(|e| StoreError::database(OP, e))?;
			let Some(value) = table
				.remove(code)
				.map_err(|e| StoreError::database(OP, e))?
			else {
				return Err(StoreError::NotFound { op: OP });
			};
			decode::<AuthCodeRecord>(OP, value.value())?
		};
		tx.commit().map_err(|e| StoreError::database(OP, e))?;

		if Utc::now() >= record.expires_at {
			debug!(service = %record.service, "auth code expired on validation");
			return Err(StoreError::NotFound { op: OP });
		}
		info!(
			tenant = short_hash(&record.tenant_hash),
			service = %record.service,
			"auth code validated"
		);
		Ok((record.tenant_hash, record.service))
	}

	/// Remove expired codes; returns how many were swept.
	pub fn cleanup_expired_auth_codes(&self) -> Result<usize, StoreError> {
		const OP: &str = "cleanup_expired_auth_codes";
		let now = Utc::now();
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		let swept = {
			let mut table = tx
				.open_table(AUTH_CODES)
				.map_err(|e| StoreError::database(OP, e))?;
			let mut expired = Vec::new();
			for item in table.iter().map_err(|e| StoreError::database(OP, e))? {
				let (key, value) = item.map_err(|e| StoreError::database(OP, e))?;
				let record: AuthCodeRecord = decode(OP, value.value())?;
				if now >= record.expires_at {
					expired.push(key.value().to_string());
				}
			}
			for code in &expired {
				table
					.remove(code.as_str())
					.map_err(|e| StoreError::database(OP, e))?;
			}
			expired.len()
		};
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		if swept > 0 {
			debug!(swept, "expired auth codes removed");
		}
		Ok(swept)
	}
}

use redb::ReadableTable;
use tracing::info;

use super::records::short_hash;
use super::{
	OAUTH_TOKENS, SERVICE_CREDENTIALS, ServiceCredentials, Store, StoreError, TokenBundle, decode,
	encode, tenant_key, tenant_range,
};

impl Store {
	/// Create or replace the OAuth bundle for a (tenant, service) pair.
	pub fn store_oauth_token(
		&self,
		tenant_hash: &str,
		service: &str,
		bundle: &TokenBundle,
	) -> Result<(), StoreError> {
		const OP: &str = "store_oauth_token";
		if service.is_empty() {
			return Err(StoreError::validation(OP, "service must not be empty"));
		}
		let key = tenant_key(tenant_hash, service);
		let encoded = encode(OP, bundle)?;
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		{
			let mut table = tx
				.open_table(OAUTH_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			table
				.insert(key.as_str(), encoded.as_slice())
				.map_err(|e| StoreError::database(OP, e))?;
		}
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		info!(
			tenant = short_hash(tenant_hash),
			service, "oauth bundle stored"
		);
		Ok(())
	}

	/// Fetch a stored bundle. Expiry is a property the caller checks; an
	/// expired bundle is still returned.
	pub fn get_oauth_token(
		&self,
		tenant_hash: &str,
		service: &str,
	) -> Result<TokenBundle, StoreError> {
		const OP: &str = "get_oauth_token";
		let key = tenant_key(tenant_hash, service);
		let db = self.db()?;
		let tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;
		let table = tx
			.open_table(OAUTH_TOKENS)
			.map_err(|e| StoreError::database(OP, e))?;
		match table
			.get(key.as_str())
			.map_err(|e| StoreError::database(OP, e))?
		{
			Some(value) => decode(OP, value.value()),
			None => Err(StoreError::TokenNotFound { op: OP }),
		}
	}

	pub fn delete_oauth_token(&self, tenant_hash: &str, service: &str) -> Result<(), StoreError> {
		const OP: &str = "delete_oauth_token";
		let key = tenant_key(tenant_hash, service);
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		let removed = {
			let mut table = tx
				.open_table(OAUTH_TOKENS)
				.map_err(|e| StoreError::database(OP, e))?;
			table
				.remove(key.as_str())
				.map_err(|e| StoreError::database(OP, e))?
				.is_some()
		};
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		if !removed {
			return Err(StoreError::TokenNotFound { op: OP });
		}
		info!(
			tenant = short_hash(tenant_hash),
			service, "oauth bundle deleted"
		);
		Ok(())
	}

	/// All services holding a bundle for this tenant, with their bundles.
	pub fn list_oauth_tokens(
		&self,
		tenant_hash: &str,
	) -> Result<Vec<(String, TokenBundle)>, StoreError> {
		const OP: &str = "list_oauth_tokens";
		let (start, end) = tenant_range(tenant_hash);
		let db = self.db()?;
		let tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;
		let table = tx
			.open_table(OAUTH_TOKENS)
			.map_err(|e| StoreError::database(OP, e))?;
		let mut out = Vec::new();
		for item in table
			.range(start.as_str()..end.as_str())
			.map_err(|e| StoreError::database(OP, e))?
		{
			let (key, value) = item.map_err(|e| StoreError::database(OP, e))?;
			let service = key
				.value()
				.split_once('/')
				.map(|(_, s)| s.to_string())
				.unwrap_or_default();
			out.push((service, decode(OP, value.value())?));
		}
		Ok(out)
	}

	/// Store the opaque credential map for a non-OAuth service.
	pub fn store_credentials(
		&self,
		tenant_hash: &str,
		service: &str,
		credentials: &ServiceCredentials,
	) -> Result<(), StoreError> {
		const OP: &str = "store_credentials";
		if service.is_empty() {
			return Err(StoreError::validation(OP, "service must not be empty"));
		}
		let key = tenant_key(tenant_hash, service);
		let encoded = encode(OP, credentials)?;
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		{
			let mut table = tx
				.open_table(SERVICE_CREDENTIALS)
				.map_err(|e| StoreError::database(OP, e))?;
			table
				.insert(key.as_str(), encoded.as_slice())
				.map_err(|e| StoreError::database(OP, e))?;
		}
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		info!(
			tenant = short_hash(tenant_hash),
			service, "service credentials stored"
		);
		Ok(())
	}

	pub fn get_credentials(
		&self,
		tenant_hash: &str,
		service: &str,
	) -> Result<ServiceCredentials, StoreError> {
		const OP: &str = "get_credentials";
		let key = tenant_key(tenant_hash, service);
		let db = self.db()?;
		let tx = db.begin_read().map_err(|e| StoreError::database(OP, e))?;
		let table = tx
			.open_table(SERVICE_CREDENTIALS)
			.map_err(|e| StoreError::database(OP, e))?;
		match table
			.get(key.as_str())
			.map_err(|e| StoreError::database(OP, e))?
		{
			Some(value) => decode(OP, value.value()),
			None => Err(StoreError::NotFound { op: OP }),
		}
	}

	pub fn delete_credentials(&self, tenant_hash: &str, service: &str) -> Result<(), StoreError> {
		const OP: &str = "delete_credentials";
		let key = tenant_key(tenant_hash, service);
		let db = self.db()?;
		let tx = db.begin_write().map_err(|e| StoreError::database(OP, e))?;
		let removed = {
			let mut table = tx
				.open_table(SERVICE_CREDENTIALS)
				.map_err(|e| StoreError::database(OP, e))?;
			table
				.remove(key.as_str())
				.map_err(|e| StoreError::database(OP, e))?
				.is_some()
		};
		tx.commit().map_err(|e| StoreError::database(OP, e))?;
		if !removed {
			return Err(StoreError::NotFound { op: OP });
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use chrono::Utc;

	use super::*;

	fn open_store() -> (tempfile::TempDir, std::sync::Arc<Store>) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(dir.path().join("test.db")).unwrap();
		(dir, store)
	}

	const TENANT: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

	#[tokio::test]
	async fn bundle_roundtrip_and_replace() {
		let (_dir, store) = open_store();
		let mut bundle = TokenBundle::new("first");
		store.store_oauth_token(TENANT, "google", &bundle).unwrap();
		assert_eq!(
			store.get_oauth_token(TENANT, "google").unwrap().access_token,
			"first"
		);

		bundle.access_token = "second".to_string();
		bundle.refresh_token = Some("rt".to_string());
		store.store_oauth_token(TENANT, "google", &bundle).unwrap();
		let loaded = store.get_oauth_token(TENANT, "google").unwrap();
		assert_eq!(loaded.access_token, "second");
		assert_eq!(loaded.refresh_token.as_deref(), Some("rt"));
	}

	#[tokio::test]
	async fn get_returns_expired_bundles() {
		let (_dir, store) = open_store();
		let mut bundle = TokenBundle::new("stale");
		bundle.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
		store.store_oauth_token(TENANT, "github", &bundle).unwrap();
		// Retrieval does not delete on expiry; the caller checks.
		let loaded = store.get_oauth_token(TENANT, "github").unwrap();
		assert!(loaded.is_expired(Utc::now()));
	}

	#[tokio::test]
	async fn missing_bundle_is_token_not_found() {
		let (_dir, store) = open_store();
		assert_matches!(
			store.get_oauth_token(TENANT, "nope"),
			Err(StoreError::TokenNotFound { .. })
		);
		assert_matches!(
			store.delete_oauth_token(TENANT, "nope"),
			Err(StoreError::TokenNotFound { .. })
		);
	}

	#[tokio::test]
	async fn list_is_scoped_to_tenant() {
		let (_dir, store) = open_store();
		let other = "beef".repeat(16);
		store
			.store_oauth_token(TENANT, "google", &TokenBundle::new("a"))
			.unwrap();
		store
			.store_oauth_token(TENANT, "github", &TokenBundle::new("b"))
			.unwrap();
		store
			.store_oauth_token(&other, "google", &TokenBundle::new("c"))
			.unwrap();

		let mut services: Vec<String> = store
			.list_oauth_tokens(TENANT)
			.unwrap()
			.into_iter()
			.map(|(s, _)| s)
			.collect();
		services.sort();
		assert_eq!(services, vec!["github", "google"]);
	}

	#[tokio::test]
	async fn credentials_roundtrip() {
		let (_dir, store) = open_store();
		let mut creds = ServiceCredentials::new();
		creds.insert("api_key".into(), serde_json::Value::String("k".into()));
		store.store_credentials(TENANT, "pwndoc", &creds).unwrap();
		assert_eq!(store.get_credentials(TENANT, "pwndoc").unwrap(), creds);
		store.delete_credentials(TENANT, "pwndoc").unwrap();
		assert_matches!(
			store.get_credentials(TENANT, "pwndoc"),
			Err(StoreError::NotFound { .. })
		);
	}
}

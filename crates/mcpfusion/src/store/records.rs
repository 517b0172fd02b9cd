use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Display prefix of a raw API token and of a tenant hash.
pub const SHORT_HASH_LEN: usize = 12;

/// Raw API token material, handed out exactly once at mint time. Wrapped so
/// it cannot leak through Debug formatting.
#[derive(Clone)]
pub struct RawToken(SecretString);

impl RawToken {
	pub(crate) fn new(raw: String) -> Self {
		Self(SecretString::new(raw.into_boxed_str()))
	}

	pub fn expose(&self) -> &str {
		self.0.expose_secret()
	}
}

impl std::fmt::Debug for RawToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "<redacted>")
	}
}

/// Persisted metadata of an API token. The raw token is never stored; its
/// SHA-256 hash doubles as the tenant identity.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiTokenRecord {
	pub hash: String,
	pub prefix: String,
	pub description: String,
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_used: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ApiTokenRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ApiTokenRecord")
			.field("prefix", &self.prefix)
			.field("description", &self.description)
			.field("created_at", &self.created_at)
			.field("last_used", &self.last_used)
			.finish()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
	pub hash: String,
	pub created_at: DateTime<Utc>,
}

fn default_token_type() -> String {
	"Bearer".to_string()
}

/// OAuth credential set for one (tenant, service) pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenBundle {
	pub access_token: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub refresh_token: Option<String>,
	#[serde(default = "default_token_type")]
	pub token_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub scope: Vec<String>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TokenBundle {
	pub fn new(access_token: impl Into<String>) -> Self {
		let now = Utc::now();
		Self {
			access_token: access_token.into(),
			refresh_token: None,
			token_type: default_token_type(),
			expires_at: None,
			scope: Vec::new(),
			metadata: HashMap::new(),
			created_at: now,
			updated_at: now,
		}
	}

	/// Bundles without `expires_at` never expire.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		matches!(self.expires_at, Some(e) if now >= e)
	}

	/// Whether the bundle will be unusable within `skew` from `now`.
	pub fn needs_refresh(&self, now: DateTime<Utc>, skew: std::time::Duration) -> bool {
		let Some(expires_at) = self.expires_at else {
			return false;
		};
		let skew = ChronoDuration::from_std(skew).unwrap_or_else(|_| ChronoDuration::seconds(60));
		now + skew >= expires_at
	}

	/// `"{token_type} {access_token}"`, defaulting the type to `Bearer`.
	pub fn authorization_value(&self) -> String {
		let token_type = if self.token_type.is_empty() {
			"Bearer"
		} else {
			self.token_type.as_str()
		};
		format!("{token_type} {}", self.access_token)
	}
}

impl std::fmt::Debug for TokenBundle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// Token material stays out of logs.
		f.debug_struct("TokenBundle")
			.field("token_type", &self.token_type)
			.field("has_refresh_token", &self.refresh_token.is_some())
			.field("expires_at", &self.expires_at)
			.field("scope", &self.scope)
			.field("updated_at", &self.updated_at)
			.finish()
	}
}

/// Opaque user-supplied secrets for non-OAuth services. Shape is validated by
/// the service engine at call time, not here.
pub type ServiceCredentials = serde_json::Map<String, serde_json::Value>;

/// Ephemeral single-use code binding a (tenant, service) pair for the CLI.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthCodeRecord {
	pub code: String,
	pub tenant_hash: String,
	pub service: String,
	pub expires_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for AuthCodeRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthCodeRecord")
			.field("tenant", &short_hash(&self.tenant_hash))
			.field("service", &self.service)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// First [`SHORT_HASH_LEN`] characters, for logs and admin display.
pub fn short_hash(hash: &str) -> &str {
	&hash[..hash.len().min(SHORT_HASH_LEN)]
}

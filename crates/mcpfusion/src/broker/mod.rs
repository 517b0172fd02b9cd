//! Per-tenant OAuth token cache and refresh pipeline.
//!
//! The broker owns the authoritative "current" view of every (tenant,
//! service) bundle. Lookups hit the in-memory cache first; a stale bundle
//! triggers exactly one refresh exchange per key, shared by every concurrent
//! caller. Refreshes run on detached tasks so a cancelled caller never
//! aborts a flight other callers are waiting on.

mod refresh;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::ErrorKind;
use crate::services::{AuthSpec, ServiceRegistry};
use crate::store::{Store, StoreError, TokenBundle, short_hash};

/// Tokens closer than this to expiry are refreshed eagerly.
pub const DEFAULT_SKEW: Duration = Duration::from_secs(60);
/// Hard cap on a refresh exchange; a slower one is failed and retried later.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug, Clone)]
pub enum BrokerError {
	#[error("malformed cache key {0:?}")]
	MalformedKey(String),
	#[error("unknown service {0:?}")]
	UnknownService(String),
	#[error("service {0:?} does not use oauth2")]
	NotOAuth(String),
	/// The tenant must re-run the interactive OAuth flow.
	#[error("no usable {service} token; re-run the oauth flow")]
	NeedReauth { service: String },
	#[error("token refresh for {service} failed: {detail}")]
	RefreshFailed { service: String, detail: String },
	#[error("token refresh for {service} timed out")]
	RefreshTimeout { service: String },
	#[error("cancelled while waiting for {service} token")]
	Cancelled { service: String },
	#[error("store failure: {detail}")]
	Store { kind: ErrorKind, detail: String },
}

impl BrokerError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			BrokerError::MalformedKey(_)
			| BrokerError::UnknownService(_)
			| BrokerError::NotOAuth(_) => ErrorKind::Validation,
			BrokerError::NeedReauth { .. } => ErrorKind::Unauthenticated,
			BrokerError::RefreshFailed { .. } => ErrorKind::Upstream,
			BrokerError::RefreshTimeout { .. } => ErrorKind::DeadlineExceeded,
			BrokerError::Cancelled { .. } => ErrorKind::Cancelled,
			BrokerError::Store { kind, .. } => *kind,
		}
	}
}

/// Store errors cross into the cloneable broker error as kind + message.
impl From<StoreError> for BrokerError {
	fn from(err: StoreError) -> Self {
		BrokerError::Store {
			kind: err.kind(),
			detail: err.to_string(),
		}
	}
}

/// Cache key for one (tenant, service) bundle. External collaborators may
/// address the cache as `"tenant:{hash}:token:{service}"`; the parser is
/// strict because a malformed key is a usage error, not a miss.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerKey {
	pub tenant_hash: String,
	pub service: String,
}

impl BrokerKey {
	pub fn new(tenant_hash: impl Into<String>, service: impl Into<String>) -> Self {
		Self {
			tenant_hash: tenant_hash.into(),
			service: service.into(),
		}
	}

	pub fn parse(raw: &str) -> Result<Self, BrokerError> {
		let malformed = || BrokerError::MalformedKey(raw.to_string());
		let rest = raw.strip_prefix("tenant:").ok_or_else(malformed)?;
		let (hash, service) = rest.split_once(":token:").ok_or_else(malformed)?;
		if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
			return Err(malformed());
		}
		if service.is_empty() || service.contains(':') {
			return Err(malformed());
		}
		Ok(Self::new(hash, service))
	}
}

impl std::fmt::Display for BrokerKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "tenant:{}:token:{}", self.tenant_hash, self.service)
	}
}

#[derive(Clone, Default)]
enum FlightOutcome {
	#[default]
	Pending,
	Done(Result<TokenBundle, BrokerError>),
}

enum CacheEntry {
	Ready(TokenBundle),
	Pending(watch::Receiver<FlightOutcome>),
}

enum Lookup {
	Fresh(TokenBundle),
	Join(watch::Receiver<FlightOutcome>),
}

#[derive(Clone)]
pub struct TokenBroker {
	inner: Arc<Inner>,
}

struct Inner {
	store: Arc<Store>,
	registry: Arc<ServiceRegistry>,
	http: reqwest::Client,
	skew: Duration,
	refresh_timeout: Duration,
	cache: Mutex<HashMap<BrokerKey, CacheEntry>>,
}

impl TokenBroker {
	pub fn new(store: Arc<Store>, registry: Arc<ServiceRegistry>, http: reqwest::Client) -> Self {
		Self::with_timing(store, registry, http, DEFAULT_SKEW, DEFAULT_REFRESH_TIMEOUT)
	}

	pub fn with_timing(
		store: Arc<Store>,
		registry: Arc<ServiceRegistry>,
		http: reqwest::Client,
		skew: Duration,
		refresh_timeout: Duration,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				store,
				registry,
				http,
				skew,
				refresh_timeout,
				cache: Mutex::new(HashMap::new()),
			}),
		}
	}

	/// A bundle usable for at least `skew` more, refreshing if necessary.
	pub async fn get_access_token(
		&self,
		tenant_hash: &str,
		service: &str,
	) -> Result<TokenBundle, BrokerError> {
		self.get(&BrokerKey::new(tenant_hash, service)).await
	}

	pub async fn get(&self, key: &BrokerKey) -> Result<TokenBundle, BrokerError> {
		let rx = {
			let mut cache = self.inner.cache.lock();
			let hit = match cache.get(key) {
				Some(CacheEntry::Ready(bundle))
					if !bundle.needs_refresh(Utc::now(), self.inner.skew) =>
				{
					Some(Lookup::Fresh(bundle.clone()))
				},
				Some(CacheEntry::Pending(rx)) => Some(Lookup::Join(rx.clone())),
				_ => None,
			};
			match hit {
				Some(Lookup::Fresh(bundle)) => return Ok(bundle),
				Some(Lookup::Join(rx)) => rx,
				None => self.start_flight(&mut cache, key, false),
			}
		};
		await_flight(rx, &key.service).await
	}

	/// Force a refresh exchange for the key, joining one already in flight.
	/// Used after a provider 401 where the cached token is unusable despite
	/// its expiry time.
	pub async fn force_refresh(&self, key: &BrokerKey) -> Result<TokenBundle, BrokerError> {
		let rx = {
			let mut cache = self.inner.cache.lock();
			let pending = match cache.get(key) {
				Some(CacheEntry::Pending(rx)) => Some(rx.clone()),
				_ => None,
			};
			match pending {
				Some(rx) => rx,
				None => self.start_flight(&mut cache, key, true),
			}
		};
		await_flight(rx, &key.service).await
	}

	/// Drop the cached bundle; the next lookup reloads from the store.
	pub fn invalidate(&self, key: &BrokerKey) {
		let mut cache = self.inner.cache.lock();
		if matches!(cache.get(key), Some(CacheEntry::Ready(_))) {
			cache.remove(key);
		}
	}

	/// Persist and cache a bundle handed to us out of band (OAuth bridge).
	pub fn set(&self, key: &BrokerKey, bundle: TokenBundle) -> Result<(), BrokerError> {
		self
			.inner
			.store
			.store_oauth_token(&key.tenant_hash, &key.service, &bundle)?;
		self
			.inner
			.cache
			.lock()
			.insert(key.clone(), CacheEntry::Ready(bundle));
		Ok(())
	}

	/// Remove a bundle everywhere (revocation, service delete).
	pub fn remove(&self, key: &BrokerKey) -> Result<(), BrokerError> {
		self
			.inner
			.store
			.delete_oauth_token(&key.tenant_hash, &key.service)?;
		self.inner.cache.lock().remove(key);
		Ok(())
	}

	/// Must be called with the cache lock held; inserts the pending entry and
	/// spawns the detached flight task.
	fn start_flight(
		&self,
		cache: &mut HashMap<BrokerKey, CacheEntry>,
		key: &BrokerKey,
		force: bool,
	) -> watch::Receiver<FlightOutcome> {
		let (tx, rx) = watch::channel(FlightOutcome::Pending);
		cache.insert(key.clone(), CacheEntry::Pending(rx.clone()));
		let inner = self.inner.clone();
		let key = key.clone();
		tokio::spawn(async move {
			let result = inner.run_flight(&key, force).await;
			let mut cache = inner.cache.lock();
			match &result {
				Ok(bundle) => {
					cache.insert(key.clone(), CacheEntry::Ready(bundle.clone()));
				},
				Err(e) => {
					warn!(
						tenant = short_hash(&key.tenant_hash),
						service = %key.service,
						error = %e,
						"token flight failed"
					);
					// Drop our pending entry so the next call can retry; a
					// bundle set concurrently stays.
					if matches!(cache.get(&key), Some(CacheEntry::Pending(_))) {
						cache.remove(&key);
					}
				},
			}
			drop(cache);
			let _ = tx.send(FlightOutcome::Done(result));
		});
		rx
	}
}

impl Inner {
	/// Load the bundle and bring it up to date. Runs detached from any
	/// caller; its outcome is published to every waiter at once.
	async fn run_flight(&self, key: &BrokerKey, force: bool) -> Result<TokenBundle, BrokerError> {
		let service = key.service.clone();
		let bundle = match self.store.get_oauth_token(&key.tenant_hash, &key.service) {
			Ok(bundle) => bundle,
			Err(e) if e.kind() == ErrorKind::TokenNotFound => {
				return Err(BrokerError::NeedReauth { service });
			},
			Err(e) => return Err(e.into()),
		};
		if !force && !bundle.needs_refresh(Utc::now(), self.skew) {
			return Ok(bundle);
		}
		let Some(refresh_token) = bundle.refresh_token.clone() else {
			return Err(BrokerError::NeedReauth { service });
		};

		let descriptor = self
			.registry
			.get(&key.service)
			.ok_or_else(|| BrokerError::UnknownService(service.clone()))?;
		let AuthSpec::Oauth2(oauth) = &descriptor.auth else {
			return Err(BrokerError::NotOAuth(service));
		};

		debug!(
			tenant = short_hash(&key.tenant_hash),
			service = %key.service,
			"refreshing access token"
		);
		let response = tokio::time::timeout(
			self.refresh_timeout,
			refresh::exchange(&self.http, oauth, &service, &refresh_token),
		)
		.await
		.map_err(|_| BrokerError::RefreshTimeout { service })??;

		let refreshed = refresh::apply(bundle, response);
		// Persist before publishing so no waiter observes a token the store
		// does not yet know about.
		self
			.store
			.store_oauth_token(&key.tenant_hash, &key.service, &refreshed)?;
		info!(
			tenant = short_hash(&key.tenant_hash),
			service = %key.service,
			expires_at = ?refreshed.expires_at,
			"access token refreshed"
		);
		Ok(refreshed)
	}
}

async fn await_flight(
	mut rx: watch::Receiver<FlightOutcome>,
	service: &str,
) -> Result<TokenBundle, BrokerError> {
	let failed = || BrokerError::RefreshFailed {
		service: service.to_string(),
		detail: "flight task dropped".to_string(),
	};
	let guard = rx
		.wait_for(|o| matches!(o, FlightOutcome::Done(_)))
		.await
		.map_err(|_| failed())?;
	match &*guard {
		FlightOutcome::Done(result) => result.clone(),
		FlightOutcome::Pending => Err(failed()),
	}
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

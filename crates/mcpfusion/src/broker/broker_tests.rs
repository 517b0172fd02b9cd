use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::services::{
	AuthSpec, EndpointDescriptor, HintOverrides, OAuth2Config, ServiceDescriptor, ServiceRegistry,
};

const TENANT: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

fn oauth_service(name: &str, token_url: String) -> ServiceDescriptor {
	ServiceDescriptor {
		name: name.to_string(),
		base_url: "https://api.example.com".to_string(),
		auth: AuthSpec::Oauth2(OAuth2Config {
			authorization_url: "https://example.com/auth".to_string(),
			token_url,
			client_id: "client-id".to_string(),
			client_secret: Some("client-secret".to_string()),
			scopes: vec!["mail".to_string()],
			share_client_secret: false,
			extra: serde_json::Map::new(),
		}),
		endpoints: vec![EndpointDescriptor {
			id: "profile_get".to_string(),
			method: "GET".to_string(),
			path: "/profile".to_string(),
			description: None,
			params: Vec::new(),
			body: None,
			transform: None,
			hints: HintOverrides::default(),
			timeout_secs: None,
		}],
		timeout_secs: None,
	}
}

struct Fixture {
	_dir: tempfile::TempDir,
	store: Arc<Store>,
	broker: TokenBroker,
	server: MockServer,
}

async fn fixture() -> Fixture {
	let dir = tempfile::tempdir().unwrap();
	let store = Store::open(dir.path().join("test.db")).unwrap();
	let server = MockServer::start().await;
	let registry = Arc::new(
		ServiceRegistry::new(vec![oauth_service(
			"google",
			format!("{}/token", server.uri()),
		)])
		.unwrap(),
	);
	let broker = TokenBroker::with_timing(
		store.clone(),
		registry,
		reqwest::Client::new(),
		DEFAULT_SKEW,
		Duration::from_secs(5),
	);
	Fixture {
		_dir: dir,
		store,
		broker,
		server,
	}
}

fn expired_bundle(refresh_token: Option<&str>) -> TokenBundle {
	let mut bundle = TokenBundle::new("stale-at");
	bundle.refresh_token = refresh_token.map(str::to_string);
	bundle.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
	bundle
}

#[test]
fn key_format_round_trip() {
	let key = BrokerKey::new(TENANT, "google");
	assert_eq!(key.to_string(), format!("tenant:{TENANT}:token:google"));
	assert_eq!(BrokerKey::parse(&key.to_string()).unwrap(), key);
}

#[test]
fn key_parser_is_strict() {
	for bad in [
		"",
		"google",
		"tenant::token:google",
		"tenant:short:token:google",
		&format!("tenant:{TENANT}:token:"),
		&format!("tenant:{TENANT}:token:a:b"),
		&format!("tenant:{TENANT}:google"),
		&format!("TENANT:{TENANT}:token:google"),
	] {
		assert_matches!(BrokerKey::parse(bad), Err(BrokerError::MalformedKey(_)), "{bad}");
	}
}

#[tokio::test]
async fn fresh_bundle_served_from_store_without_refresh() {
	let f = fixture().await;
	let mut bundle = TokenBundle::new("fresh-at");
	bundle.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
	f.store.store_oauth_token(TENANT, "google", &bundle).unwrap();

	let got = f.broker.get_access_token(TENANT, "google").await.unwrap();
	assert_eq!(got.access_token, "fresh-at");
	// No token endpoint call was mounted; a request would 404 and fail below.
	let again = f.broker.get_access_token(TENANT, "google").await.unwrap();
	assert_eq!(again.access_token, "fresh-at");
}

#[tokio::test]
async fn concurrent_gets_issue_one_refresh() {
	let f = fixture().await;
	f.store
		.store_oauth_token(TENANT, "google", &expired_bundle(Some("rt")))
		.unwrap();
	Mock::given(method("POST"))
		.and(path("/token"))
		.and(body_string_contains("grant_type=refresh_token"))
		.and(body_string_contains("refresh_token=rt"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({"access_token": "new", "expires_in": 3600})),
		)
		.expect(1)
		.mount(&f.server)
		.await;

	let mut handles = Vec::new();
	for _ in 0..10 {
		let broker = f.broker.clone();
		handles.push(tokio::spawn(async move {
			broker.get_access_token(TENANT, "google").await
		}));
	}
	for handle in handles {
		let bundle = handle.await.unwrap().unwrap();
		assert_eq!(bundle.access_token, "new");
	}

	let stored = f.store.get_oauth_token(TENANT, "google").unwrap();
	assert_eq!(stored.access_token, "new");
	let expires_at = stored.expires_at.unwrap();
	let delta = (expires_at - Utc::now()).num_seconds();
	assert!((3590..=3610).contains(&delta), "expires in {delta}s");
	// Refresh token was not rotated, so the old one is kept.
	assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
}

#[tokio::test]
async fn expired_without_refresh_token_needs_reauth() {
	let f = fixture().await;
	f.store
		.store_oauth_token(TENANT, "google", &expired_bundle(None))
		.unwrap();
	assert_matches!(
		f.broker.get_access_token(TENANT, "google").await,
		Err(BrokerError::NeedReauth { .. })
	);
}

#[tokio::test]
async fn missing_bundle_needs_reauth() {
	let f = fixture().await;
	assert_matches!(
		f.broker.get_access_token(TENANT, "google").await,
		Err(BrokerError::NeedReauth { .. })
	);
}

#[tokio::test]
async fn refresh_failure_drops_entry_and_allows_retry() {
	let f = fixture().await;
	f.store
		.store_oauth_token(TENANT, "google", &expired_bundle(Some("rt")))
		.unwrap();
	// Two calls mean two refresh attempts: the failed flight did not wedge
	// the cache entry.
	Mock::given(method("POST"))
		.and(path("/token"))
		.respond_with(ResponseTemplate::new(500).set_body_string("boom"))
		.expect(2)
		.mount(&f.server)
		.await;

	assert_matches!(
		f.broker.get_access_token(TENANT, "google").await,
		Err(BrokerError::RefreshFailed { .. })
	);
	assert_matches!(
		f.broker.get_access_token(TENANT, "google").await,
		Err(BrokerError::RefreshFailed { .. })
	);
}

#[tokio::test]
async fn non_expiring_bundle_never_refreshes_proactively() {
	let f = fixture().await;
	let mut bundle = TokenBundle::new("forever");
	bundle.refresh_token = Some("rt".to_string());
	f.store.store_oauth_token(TENANT, "google", &bundle).unwrap();

	let got = f.broker.get_access_token(TENANT, "google").await.unwrap();
	assert_eq!(got.access_token, "forever");

	// An explicit force still exchanges.
	Mock::given(method("POST"))
		.and(path("/token"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({"access_token": "forced", "expires_in": 60})),
		)
		.expect(1)
		.mount(&f.server)
		.await;
	let forced = f
		.broker
		.force_refresh(&BrokerKey::new(TENANT, "google"))
		.await
		.unwrap();
	assert_eq!(forced.access_token, "forced");
}

#[tokio::test]
async fn cancelled_caller_does_not_abort_shared_refresh() {
	let f = fixture().await;
	f.store
		.store_oauth_token(TENANT, "google", &expired_bundle(Some("rt")))
		.unwrap();
	Mock::given(method("POST"))
		.and(path("/token"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({"access_token": "slow-new", "expires_in": 3600}))
				.set_delay(Duration::from_millis(300)),
		)
		.expect(1)
		.mount(&f.server)
		.await;

	// The caller gives up long before the exchange completes.
	let hurried = tokio::time::timeout(
		Duration::from_millis(50),
		f.broker.get_access_token(TENANT, "google"),
	)
	.await;
	assert!(hurried.is_err());

	// The detached flight finishes and publishes; a later lookup sees its
	// result without a second exchange.
	tokio::time::sleep(Duration::from_millis(500)).await;
	let got = f.broker.get_access_token(TENANT, "google").await.unwrap();
	assert_eq!(got.access_token, "slow-new");
}

#[tokio::test]
async fn set_updates_cache_and_store() {
	let f = fixture().await;
	let key = BrokerKey::new(TENANT, "google");
	let mut bundle = TokenBundle::new("seeded");
	bundle.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
	f.broker.set(&key, bundle).unwrap();

	assert_eq!(
		f.broker.get(&key).await.unwrap().access_token,
		"seeded"
	);
	assert_eq!(
		f.store.get_oauth_token(TENANT, "google").unwrap().access_token,
		"seeded"
	);

	f.broker.remove(&key).unwrap();
	assert_matches!(
		f.store.get_oauth_token(TENANT, "google"),
		Err(crate::store::StoreError::TokenNotFound { .. })
	);
}

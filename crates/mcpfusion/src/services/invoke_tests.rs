use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use serde_json::{Map, Value, json};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::auth::TenantContext;
use crate::broker::TokenBroker;
use crate::services::*;
use crate::store::{Store, TokenBundle};

const TENANT: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

fn endpoint(id: &str, http_method: &str, template: &str) -> EndpointDescriptor {
	EndpointDescriptor {
		id: id.to_string(),
		method: http_method.to_string(),
		path: template.to_string(),
		description: None,
		params: Vec::new(),
		body: None,
		transform: None,
		hints: HintOverrides::default(),
		timeout_secs: None,
	}
}

fn param(name: &str, kind: ParamType, required: bool, location: ParamLocation) -> ParamSpec {
	ParamSpec {
		name: name.to_string(),
		kind,
		required,
		location,
		description: None,
	}
}

fn fixture_registry(base: &str) -> ServiceRegistry {
	let mut profile = endpoint("profile_get", "GET", "/gmail/v1/users/{user_id}/profile");
	profile.params = vec![
		param("user_id", ParamType::String, true, ParamLocation::Path),
		param("format", ParamType::String, false, ParamLocation::Query),
	];
	profile.transform = Some(ResponseTransform {
		pointer: None,
		fields: Some(vec!["emailAddress".to_string()]),
	});

	let google = ServiceDescriptor {
		name: "google".to_string(),
		base_url: base.to_string(),
		auth: AuthSpec::Oauth2(OAuth2Config {
			authorization_url: format!("{base}/auth"),
			token_url: format!("{base}/token"),
			client_id: "cid".to_string(),
			client_secret: Some("shh".to_string()),
			scopes: Vec::new(),
			share_client_secret: false,
			extra: serde_json::Map::new(),
		}),
		endpoints: vec![profile],
		timeout_secs: None,
	};

	let mut audits = endpoint("audit_list", "GET", "/audits");
	audits.params = vec![param("limit", ParamType::Integer, false, ParamLocation::Query)];
	let pwndoc = ServiceDescriptor {
		name: "pwndoc".to_string(),
		base_url: base.to_string(),
		auth: AuthSpec::ApiKey(ApiKeyConfig {
			field: "api_key".to_string(),
			placement: TokenPlacement::Header {
				name: "x-api-key".to_string(),
				prefix: None,
			},
		}),
		endpoints: vec![audits],
		timeout_secs: None,
	};

	let internal = ServiceDescriptor {
		name: "internal".to_string(),
		base_url: base.to_string(),
		auth: AuthSpec::Basic,
		endpoints: vec![endpoint("status_get", "GET", "/status")],
		timeout_secs: None,
	};

	let mut echo = endpoint("echo_post", "POST", "/echo");
	echo.params = vec![
		param("message", ParamType::String, true, ParamLocation::Body),
		param("count", ParamType::Integer, false, ParamLocation::Body),
	];
	let mut slow = endpoint("slow_get", "GET", "/slow");
	slow.timeout_secs = Some(1);
	let open = ServiceDescriptor {
		name: "open".to_string(),
		base_url: base.to_string(),
		auth: AuthSpec::None,
		endpoints: vec![echo, slow],
		timeout_secs: None,
	};

	ServiceRegistry::new(vec![google, pwndoc, internal, open]).unwrap()
}

struct Fixture {
	_dir: tempfile::TempDir,
	store: Arc<Store>,
	engine: ServiceEngine,
	server: MockServer,
}

async fn fixture() -> Fixture {
	let dir = tempfile::tempdir().unwrap();
	let store = Store::open(dir.path().join("test.db")).unwrap();
	let server = MockServer::start().await;
	let registry = Arc::new(fixture_registry(&server.uri()));
	let http = reqwest::Client::new();
	let broker = TokenBroker::new(store.clone(), registry.clone(), http.clone());
	let engine = ServiceEngine::new(
		store.clone(),
		registry,
		broker,
		http,
		Duration::from_secs(30),
	);
	Fixture {
		_dir: dir,
		store,
		engine,
		server,
	}
}

fn tenant() -> TenantContext {
	TenantContext::new(TENANT)
}

fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
	pairs
		.iter()
		.map(|(k, v)| (k.to_string(), v.clone()))
		.collect()
}

fn fresh_bundle(token: &str) -> TokenBundle {
	let mut bundle = TokenBundle::new(token);
	bundle.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
	bundle
}

#[tokio::test]
async fn oauth_invoke_projects_response() {
	let f = fixture().await;
	f.store
		.store_oauth_token(TENANT, "google", &fresh_bundle("at"))
		.unwrap();
	Mock::given(method("GET"))
		.and(path("/gmail/v1/users/me/profile"))
		.and(header("authorization", "Bearer at"))
		.and(query_param("format", "full"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"emailAddress": "me@example.com",
			"messagesTotal": 42,
		})))
		.expect(1)
		.mount(&f.server)
		.await;

	let result = f
		.engine
		.invoke(
			&tenant(),
			"google_profile_get",
			&args(&[
				("user_id", json!("me")),
				("format", json!("full")),
			]),
		)
		.await
		.unwrap();
	assert_eq!(result, json!({"emailAddress": "me@example.com"}));
}

#[tokio::test]
async fn expiring_bundle_without_refresh_is_unauthenticated() {
	let f = fixture().await;
	let mut bundle = TokenBundle::new("dying");
	// Still valid, but inside the refresh skew and with no refresh path.
	bundle.expires_at = Some(Utc::now() + chrono::Duration::seconds(5));
	f.store.store_oauth_token(TENANT, "google", &bundle).unwrap();

	let err = f
		.engine
		.invoke(&tenant(), "google_profile_get", &args(&[("user_id", json!("me"))]))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), crate::errors::ErrorKind::Unauthenticated);

	// Re-seeded with a fresh bundle the same call succeeds; the failed
	// flight dropped its cache entry so the store is re-read.
	f.store
		.store_oauth_token(TENANT, "google", &fresh_bundle("revived"))
		.unwrap();
	Mock::given(method("GET"))
		.and(path("/gmail/v1/users/me/profile"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"emailAddress": "x"})))
		.mount(&f.server)
		.await;
	let result = f
		.engine
		.invoke(&tenant(), "google_profile_get", &args(&[("user_id", json!("me"))]))
		.await
		.unwrap();
	assert_eq!(result, json!({"emailAddress": "x"}));
}

#[tokio::test]
async fn provider_401_triggers_one_refresh_then_retry() {
	let f = fixture().await;
	let mut bundle = fresh_bundle("stale-but-unexpired");
	bundle.refresh_token = Some("rt".to_string());
	f.store.store_oauth_token(TENANT, "google", &bundle).unwrap();

	Mock::given(method("POST"))
		.and(path("/token"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({"access_token": "renewed", "expires_in": 3600})),
		)
		.expect(1)
		.mount(&f.server)
		.await;
	// First call is rejected, the retry with the renewed token succeeds.
	Mock::given(method("GET"))
		.and(path("/gmail/v1/users/me/profile"))
		.and(header("authorization", "Bearer stale-but-unexpired"))
		.respond_with(ResponseTemplate::new(401))
		.expect(1)
		.mount(&f.server)
		.await;
	Mock::given(method("GET"))
		.and(path("/gmail/v1/users/me/profile"))
		.and(header("authorization", "Bearer renewed"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"emailAddress": "ok"})))
		.expect(1)
		.mount(&f.server)
		.await;

	let result = f
		.engine
		.invoke(&tenant(), "google_profile_get", &args(&[("user_id", json!("me"))]))
		.await
		.unwrap();
	assert_eq!(result, json!({"emailAddress": "ok"}));
}

#[tokio::test]
async fn repeated_401_surfaces_need_reauth() {
	let f = fixture().await;
	let mut bundle = fresh_bundle("rejected");
	bundle.refresh_token = Some("rt".to_string());
	f.store.store_oauth_token(TENANT, "google", &bundle).unwrap();

	Mock::given(method("POST"))
		.and(path("/token"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({"access_token": "also-rejected", "expires_in": 3600})),
		)
		.mount(&f.server)
		.await;
	Mock::given(method("GET"))
		.and(path("/gmail/v1/users/me/profile"))
		.respond_with(ResponseTemplate::new(401))
		.expect(2)
		.mount(&f.server)
		.await;

	assert_matches!(
		f.engine
			.invoke(&tenant(), "google_profile_get", &args(&[("user_id", json!("me"))]))
			.await,
		Err(EngineError::NeedReauth { .. })
	);
}

#[tokio::test]
async fn parameter_validation() {
	let f = fixture().await;
	let cases: Vec<(&str, Map<String, Value>)> = vec![
		// Unknown parameter.
		(
			"google_profile_get",
			args(&[("user_id", json!("me")), ("bogus", json!(1))]),
		),
		// Type mismatch.
		("google_profile_get", args(&[("user_id", json!(42))])),
		// Missing required path parameter.
		("google_profile_get", args(&[])),
	];
	for (tool, params) in cases {
		let err = f.engine.invoke(&tenant(), tool, &params).await.unwrap_err();
		assert_eq!(err.kind(), crate::errors::ErrorKind::Validation, "{tool}");
	}

	assert_matches!(
		f.engine.invoke(&tenant(), "nosuch_tool", &args(&[])).await,
		Err(EngineError::UnknownTool(_))
	);
	assert_matches!(
		f.engine.invoke(&tenant(), "plain", &args(&[])).await,
		Err(EngineError::InvalidToolName(_))
	);
}

#[tokio::test]
async fn api_key_auth_from_stored_credentials() {
	let f = fixture().await;
	Mock::given(method("GET"))
		.and(path("/audits"))
		.and(header("x-api-key", "sekrit"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
		.expect(1)
		.mount(&f.server)
		.await;

	// No credentials yet: unauthenticated.
	assert_matches!(
		f.engine.invoke(&tenant(), "pwndoc_audit_list", &args(&[])).await,
		Err(EngineError::MissingCredentials { .. })
	);

	let mut creds = crate::store::ServiceCredentials::new();
	creds.insert("api_key".into(), json!("sekrit"));
	f.store.store_credentials(TENANT, "pwndoc", &creds).unwrap();
	let result = f
		.engine
		.invoke(&tenant(), "pwndoc_audit_list", &args(&[]))
		.await
		.unwrap();
	assert_eq!(result, json!([]));
}

#[tokio::test]
async fn basic_auth_header() {
	let f = fixture().await;
	let mut creds = crate::store::ServiceCredentials::new();
	creds.insert("username".into(), json!("user"));
	creds.insert("password".into(), json!("pass"));
	f.store.store_credentials(TENANT, "internal", &creds).unwrap();

	Mock::given(method("GET"))
		.and(path("/status"))
		.and(header("authorization", "Basic dXNlcjpwYXNz"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
		.expect(1)
		.mount(&f.server)
		.await;

	let result = f
		.engine
		.invoke(&tenant(), "internal_status_get", &args(&[]))
		.await
		.unwrap();
	assert_eq!(result, json!({"ok": true}));

	// A credential map missing a field is unauthenticated, not a 500.
	let mut partial = crate::store::ServiceCredentials::new();
	partial.insert("username".into(), json!("user"));
	f.store.store_credentials(TENANT, "internal", &partial).unwrap();
	assert_matches!(
		f.engine.invoke(&tenant(), "internal_status_get", &args(&[])).await,
		Err(EngineError::BadCredentials { .. })
	);
}

#[tokio::test]
async fn body_params_compose_json_body() {
	let f = fixture().await;
	Mock::given(method("POST"))
		.and(path("/echo"))
		.and(body_json(json!({"message": "hi", "count": 2})))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"echoed": true})))
		.expect(1)
		.mount(&f.server)
		.await;

	let result = f
		.engine
		.invoke(
			&tenant(),
			"open_echo_post",
			&args(&[("message", json!("hi")), ("count", json!(2))]),
		)
		.await
		.unwrap();
	assert_eq!(result, json!({"echoed": true}));
}

#[tokio::test]
async fn endpoint_deadline_enforced() {
	let f = fixture().await;
	Mock::given(method("GET"))
		.and(path("/slow"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({}))
				.set_delay(Duration::from_secs(3)),
		)
		.mount(&f.server)
		.await;

	assert_matches!(
		f.engine.invoke(&tenant(), "open_slow_get", &args(&[])).await,
		Err(EngineError::DeadlineExceeded { .. })
	);
}

#[tokio::test]
async fn upstream_error_carries_status() {
	let f = fixture().await;
	Mock::given(method("POST"))
		.and(path("/echo"))
		.respond_with(ResponseTemplate::new(503).set_body_string("down"))
		.mount(&f.server)
		.await;

	let err = f
		.engine
		.invoke(&tenant(), "open_echo_post", &args(&[("message", json!("x"))]))
		.await
		.unwrap_err();
	assert_matches!(err, EngineError::Upstream { status: 503, .. });
	assert_eq!(err.kind(), crate::errors::ErrorKind::Upstream);
}

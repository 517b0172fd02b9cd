//! CLI-facing OAuth bridge: token seeding, service config handoff and the
//! single-use auth-code exchange.

use std::collections::HashMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::TenantContext;
use crate::broker::BrokerKey;
use crate::http::{ApiError, AppState, mask_secrets};
use crate::services::{AuthSpec, CredentialField, ServiceDescriptor};
use crate::store::TokenBundle;

/// Cap on how much of a notification body lands in the log.
const NOTIFY_LOG_LIMIT: usize = 512;

#[derive(Serialize)]
pub struct PingBody {
	success: bool,
	message: &'static str,
	tenant_id: String,
	timestamp: DateTime<Utc>,
}

pub async fn ping(tenant: TenantContext) -> Json<PingBody> {
	Json(PingBody {
		success: true,
		message: "pong",
		tenant_id: tenant.short_hash().to_string(),
		timestamp: Utc::now(),
	})
}

#[derive(Serialize)]
pub struct VerifyBody {
	success: bool,
	tenant_id: String,
	valid_till: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	created_at: Option<DateTime<Utc>>,
}

/// Token health check. API tokens do not expire, so `valid_till` is null.
pub async fn verify(
	State(state): State<AppState>,
	tenant: TenantContext,
) -> Result<Json<VerifyBody>, ApiError> {
	let record = state.store.get_tenant(tenant.tenant_hash())?;
	Ok(Json(VerifyBody {
		success: true,
		tenant_id: tenant.short_hash().to_string(),
		valid_till: None,
		created_at: record.map(|t| t.created_at),
	}))
}

#[derive(Deserialize)]
pub struct StoreTokensRequest {
	pub service: String,
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub token_type: Option<String>,
	#[serde(default)]
	pub expires_in: Option<i64>,
	#[serde(default)]
	pub scope: Option<Vec<String>>,
	#[serde(default)]
	pub metadata: Option<HashMap<String, String>>,
}

#[derive(Serialize)]
pub struct StoreTokensBody {
	success: bool,
	service: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	expires_at: Option<DateTime<Utc>>,
}

/// Store the bundle the CLI obtained from the provider. Goes through the
/// broker so the cached view updates atomically with the store.
pub async fn store_tokens(
	State(state): State<AppState>,
	tenant: TenantContext,
	Json(req): Json<StoreTokensRequest>,
) -> Result<Json<StoreTokensBody>, ApiError> {
	if req.access_token.is_empty() {
		return Err(ApiError::validation("access_token must not be empty"));
	}
	if state.registry.get(&req.service).is_none() {
		return Err(ApiError::validation(format!(
			"unknown service {:?}",
			req.service
		)));
	}
	let now = Utc::now();
	let mut bundle = TokenBundle::new(req.access_token);
	bundle.refresh_token = req.refresh_token;
	if let Some(token_type) = req.token_type {
		bundle.token_type = token_type;
	}
	bundle.expires_at = req
		.expires_in
		.map(|secs| now + chrono::Duration::seconds(secs));
	bundle.scope = req.scope.unwrap_or_default();
	bundle.metadata = req.metadata.unwrap_or_default();

	let key = BrokerKey::new(tenant.tenant_hash(), &req.service);
	state.broker.set(&key, bundle.clone())?;
	info!(
		tenant = tenant.short_hash(),
		service = %req.service,
		expires_at = ?bundle.expires_at,
		"oauth tokens seeded"
	);
	Ok(Json(StoreTokensBody {
		success: true,
		service: req.service,
		expires_at: bundle.expires_at,
	}))
}

#[derive(Serialize)]
pub struct TokenSummary {
	service: String,
	has_refresh_token: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	expires_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	scope: Vec<String>,
	updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct ListTokensBody {
	success: bool,
	tokens: Vec<TokenSummary>,
}

pub async fn list_tokens(
	State(state): State<AppState>,
	tenant: TenantContext,
) -> Result<Json<ListTokensBody>, ApiError> {
	let tokens = state
		.store
		.list_oauth_tokens(tenant.tenant_hash())?
		.into_iter()
		.map(|(service, bundle)| TokenSummary {
			service,
			has_refresh_token: bundle.refresh_token.is_some(),
			expires_at: bundle.expires_at,
			scope: bundle.scope,
			updated_at: bundle.updated_at,
		})
		.collect();
	Ok(Json(ListTokensBody {
		success: true,
		tokens,
	}))
}

#[derive(Serialize)]
pub struct RevokeBody {
	success: bool,
	service: String,
}

pub async fn revoke_token(
	State(state): State<AppState>,
	tenant: TenantContext,
	Path(service): Path<String>,
) -> Result<Json<RevokeBody>, ApiError> {
	let key = BrokerKey::new(tenant.tenant_hash(), &service);
	state.broker.remove(&key)?;
	info!(
		tenant = tenant.short_hash(),
		service, "oauth bundle revoked"
	);
	Ok(Json(RevokeBody {
		success: true,
		service,
	}))
}

#[derive(Serialize)]
pub struct ServiceSummary {
	name: String,
	auth_type: &'static str,
	endpoints: usize,
}

#[derive(Serialize)]
pub struct ListServicesBody {
	success: bool,
	services: Vec<ServiceSummary>,
}

pub async fn list_services(State(state): State<AppState>) -> Json<ListServicesBody> {
	let services = state
		.registry
		.services()
		.map(|s| ServiceSummary {
			name: s.name.clone(),
			auth_type: s.auth.type_name(),
			endpoints: s.endpoints.len(),
		})
		.collect();
	Json(ListServicesBody {
		success: true,
		services,
	})
}

#[derive(Serialize)]
pub struct ServiceConfigBody {
	success: bool,
	service_name: String,
	auth_type: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	client_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	client_secret: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	scopes: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	authorization_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	token_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	fields: Option<Vec<CredentialField>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	instructions: Option<String>,
}

/// Public OAuth parameters the CLI needs to drive the interactive flow.
/// Secrets are included only when the descriptor marks them shareable.
pub(crate) fn service_config_body(descriptor: &ServiceDescriptor) -> ServiceConfigBody {
	let mut body = ServiceConfigBody {
		success: true,
		service_name: descriptor.name.clone(),
		auth_type: descriptor.auth.type_name(),
		client_id: None,
		client_secret: None,
		scopes: Vec::new(),
		authorization_url: None,
		token_url: None,
		fields: None,
		instructions: None,
	};
	match &descriptor.auth {
		AuthSpec::Oauth2(oauth) => {
			body.client_id = Some(oauth.client_id.clone());
			body.scopes = oauth.scopes.clone();
			body.authorization_url = Some(oauth.authorization_url.clone());
			body.token_url = Some(oauth.token_url.clone());
			if oauth.share_client_secret {
				body.client_secret = oauth.client_secret.clone();
			}
		},
		AuthSpec::UserCredentials(config) => {
			body.fields = Some(config.fields.clone());
			body.instructions = config.instructions.clone();
		},
		AuthSpec::None | AuthSpec::ApiKey(_) | AuthSpec::Basic => {},
	}
	body
}

pub async fn service_config(
	State(state): State<AppState>,
	tenant: TenantContext,
	Path(service): Path<String>,
) -> Result<Json<ServiceConfigBody>, ApiError> {
	let descriptor = state
		.registry
		.get(&service)
		.ok_or_else(|| ApiError::not_found(format!("unknown service {service:?}")))?;
	info!(
		tenant = tenant.short_hash(),
		service, "service config fetched"
	);
	Ok(Json(service_config_body(descriptor)))
}

#[derive(Deserialize)]
pub struct ExchangeRequest {
	pub code: String,
}

#[derive(Serialize)]
pub struct ExchangeBody {
	success: bool,
	tenant_id: String,
	service: String,
	config: ServiceConfigBody,
}

/// Exchange a single-use auth code for the service's public OAuth config and
/// the tenant binding. Unauthenticated: the code itself is the credential.
pub async fn exchange_code(
	State(state): State<AppState>,
	Json(req): Json<ExchangeRequest>,
) -> Result<Json<ExchangeBody>, ApiError> {
	let (tenant_hash, service) = state.store.validate_auth_code(&req.code)?;
	let descriptor = state
		.registry
		.get(&service)
		.ok_or_else(|| ApiError::not_found(format!("unknown service {service:?}")))?;
	Ok(Json(ExchangeBody {
		success: true,
		tenant_id: crate::store::short_hash(&tenant_hash).to_string(),
		service: service.clone(),
		config: service_config_body(descriptor),
	}))
}

#[derive(Serialize)]
pub struct CredentialsBody {
	success: bool,
	service: String,
}

/// Store user-supplied secrets for a non-OAuth service. The map is opaque
/// here; the service engine validates it when a call consumes it.
pub async fn store_credentials(
	State(state): State<AppState>,
	tenant: TenantContext,
	Path(service): Path<String>,
	Json(credentials): Json<crate::store::ServiceCredentials>,
) -> Result<Json<CredentialsBody>, ApiError> {
	if state.registry.get(&service).is_none() {
		return Err(ApiError::validation(format!("unknown service {service:?}")));
	}
	if credentials.is_empty() {
		return Err(ApiError::validation("credentials must not be empty"));
	}
	state
		.store
		.store_credentials(tenant.tenant_hash(), &service, &credentials)?;
	Ok(Json(CredentialsBody {
		success: true,
		service,
	}))
}

pub async fn delete_credentials(
	State(state): State<AppState>,
	tenant: TenantContext,
	Path(service): Path<String>,
) -> Result<Json<CredentialsBody>, ApiError> {
	state
		.store
		.delete_credentials(tenant.tenant_hash(), &service)?;
	Ok(Json(CredentialsBody {
		success: true,
		service,
	}))
}

#[derive(Serialize)]
pub struct AckBody {
	success: bool,
}

/// Flow-completion notification from the CLI. Logged and acknowledged; this
/// endpoint never fails closed.
pub async fn notify_success(tenant: TenantContext, body: Bytes) -> Json<AckBody> {
	info!(
		tenant = tenant.short_hash(),
		detail = %notify_detail(&body),
		"oauth flow completed"
	);
	Json(AckBody { success: true })
}

pub async fn notify_error(tenant: TenantContext, body: Bytes) -> Json<AckBody> {
	warn!(
		tenant = tenant.short_hash(),
		detail = %notify_detail(&body),
		"oauth flow failed"
	);
	Json(AckBody { success: true })
}

fn notify_detail(body: &Bytes) -> String {
	let text = String::from_utf8_lossy(body);
	mask_secrets(&text).chars().take(NOTIFY_LOG_LIMIT).collect()
}

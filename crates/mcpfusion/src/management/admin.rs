//! Operator endpoints: API-token lifecycle, auth-code minting and backups.
//! Tenant-authenticated like everything else; there is no role model beyond
//! tenant isolation.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::TenantContext;
use crate::http::{ApiError, AppState};
use crate::store::ApiTokenRecord;

const DEFAULT_AUTH_CODE_TTL: Duration = Duration::from_secs(300);

#[derive(Deserialize)]
pub struct CreateTokenRequest {
	pub description: String,
}

#[derive(Serialize)]
pub struct CreateTokenBody {
	success: bool,
	/// The raw token; shown exactly once, never recoverable afterwards.
	token: String,
	hash: String,
	prefix: String,
}

pub async fn create_token(
	State(state): State<AppState>,
	tenant: TenantContext,
	Json(req): Json<CreateTokenRequest>,
) -> Result<Json<CreateTokenBody>, ApiError> {
	let (raw, record) = state.store.add_api_token(&req.description)?;
	info!(
		by = tenant.short_hash(),
		prefix = %record.prefix,
		"api token minted"
	);
	Ok(Json(CreateTokenBody {
		success: true,
		token: raw.expose().to_string(),
		hash: record.hash,
		prefix: record.prefix,
	}))
}

#[derive(Serialize)]
pub struct TokenMetadata {
	prefix: String,
	description: String,
	created_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	last_used: Option<DateTime<Utc>>,
}

impl From<ApiTokenRecord> for TokenMetadata {
	fn from(record: ApiTokenRecord) -> Self {
		Self {
			prefix: record.prefix,
			description: record.description,
			created_at: record.created_at,
			last_used: record.last_used,
		}
	}
}

#[derive(Serialize)]
pub struct ListTokensBody {
	success: bool,
	tokens: Vec<TokenMetadata>,
}

pub async fn list_tokens(
	State(state): State<AppState>,
	_tenant: TenantContext,
) -> Result<Json<ListTokensBody>, ApiError> {
	let tokens = state
		.store
		.list_api_tokens()?
		.into_iter()
		.map(TokenMetadata::from)
		.collect();
	Ok(Json(ListTokensBody {
		success: true,
		tokens,
	}))
}

#[derive(Serialize)]
pub struct DeleteTokenBody {
	success: bool,
	prefix: String,
}

/// Delete by full hash or unique prefix, mirroring the resolve semantics.
pub async fn delete_token(
	State(state): State<AppState>,
	tenant: TenantContext,
	Path(identifier): Path<String>,
) -> Result<Json<DeleteTokenBody>, ApiError> {
	let hash = state.store.resolve_api_token(&identifier)?;
	state.store.delete_api_token(&hash)?;
	info!(
		by = tenant.short_hash(),
		deleted = crate::store::short_hash(&hash),
		"api token deleted"
	);
	Ok(Json(DeleteTokenBody {
		success: true,
		prefix: crate::store::short_hash(&hash).to_string(),
	}))
}

#[derive(Deserialize)]
pub struct CreateAuthCodeRequest {
	pub service: String,
	/// Target tenant; defaults to the caller's own tenant.
	#[serde(default)]
	pub tenant: Option<String>,
	#[serde(default)]
	pub ttl_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct CreateAuthCodeBody {
	success: bool,
	code: String,
	service: String,
	expires_at: DateTime<Utc>,
}

pub async fn create_auth_code(
	State(state): State<AppState>,
	tenant: TenantContext,
	Json(req): Json<CreateAuthCodeRequest>,
) -> Result<Json<CreateAuthCodeBody>, ApiError> {
	if state.registry.get(&req.service).is_none() {
		return Err(ApiError::validation(format!(
			"unknown service {:?}",
			req.service
		)));
	}
	let target = req.tenant.as_deref().unwrap_or(tenant.tenant_hash());
	let ttl = req
		.ttl_secs
		.map(Duration::from_secs)
		.unwrap_or(DEFAULT_AUTH_CODE_TTL);
	let code = state.store.create_auth_code(target, &req.service, ttl)?;
	Ok(Json(CreateAuthCodeBody {
		success: true,
		code,
		service: req.service,
		expires_at: Utc::now()
			+ chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
	}))
}

#[derive(Deserialize)]
pub struct BackupRequest {
	pub path: String,
}

#[derive(Serialize)]
pub struct BackupBody {
	success: bool,
	path: String,
	bytes: u64,
}

pub async fn backup(
	State(state): State<AppState>,
	tenant: TenantContext,
	Json(req): Json<BackupRequest>,
) -> Result<Json<BackupBody>, ApiError> {
	let bytes = state.store.backup(&req.path)?;
	info!(
		by = tenant.short_hash(),
		path = %req.path,
		bytes,
		"backup written"
	);
	Ok(Json(BackupBody {
		success: true,
		path: req.path,
		bytes,
	}))
}

//! Inbound API-token authentication: Bearer header → tenant identity.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use http::request::Parts;
use tracing::debug;

use crate::http::{ApiError, AppState};
use crate::store::short_hash;

/// Request-scoped tenant identity derived from a validated API token. Never
/// persisted; carries the token hash which doubles as the tenant hash.
#[derive(Clone)]
pub struct TenantContext {
	tenant_hash: Arc<str>,
}

impl TenantContext {
	pub fn new(tenant_hash: impl Into<Arc<str>>) -> Self {
		Self {
			tenant_hash: tenant_hash.into(),
		}
	}

	pub fn tenant_hash(&self) -> &str {
		&self.tenant_hash
	}

	/// Display form for logs and envelopes.
	pub fn short_hash(&self) -> &str {
		short_hash(&self.tenant_hash)
	}
}

impl std::fmt::Debug for TenantContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TenantContext")
			.field("tenant", &self.short_hash())
			.finish()
	}
}

/// Handlers take `TenantContext` as an extractor; a request that somehow
/// reaches one without the middleware having attached a context is rejected,
/// never treated as anonymous.
impl<S> axum::extract::FromRequestParts<S> for TenantContext
where
	S: Send + Sync,
{
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		parts
			.extensions
			.get::<TenantContext>()
			.cloned()
			.ok_or_else(|| ApiError::unauthenticated("missing tenant context"))
	}
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
	let (scheme, rest) = value.split_once(' ')?;
	if !scheme.eq_ignore_ascii_case("bearer") || rest.is_empty() {
		return None;
	}
	Some(rest)
}

/// Middleware guarding every protected route: validates the Bearer token
/// against the store and attaches the tenant context.
pub async fn require_tenant(
	State(state): State<AppState>,
	mut req: Request,
	next: Next,
) -> Response {
	let Some(token) = bearer_token(req.headers()) else {
		return ApiError::unauthenticated("missing bearer token").into_response();
	};
	match state.store.validate_api_token(token) {
		Ok(Some(record)) => {
			let ctx = TenantContext::new(record.hash);
			debug!(tenant = ctx.short_hash(), "request authenticated");
			req.extensions_mut().insert(ctx);
			next.run(req).await
		},
		Ok(None) => ApiError::unauthenticated("invalid API token").into_response(),
		Err(e) => ApiError::from(e).into_response(),
	}
}

#[cfg(test)]
mod tests {
	use http::HeaderValue;

	use super::*;

	fn headers_with(value: &str) -> HeaderMap {
		let mut headers = HeaderMap::new();
		headers.insert(
			http::header::AUTHORIZATION,
			HeaderValue::from_str(value).unwrap(),
		);
		headers
	}

	#[test]
	fn bearer_extraction() {
		assert_eq!(bearer_token(&headers_with("Bearer abc")), Some("abc"));
		assert_eq!(bearer_token(&headers_with("bearer abc")), Some("abc"));
		assert_eq!(bearer_token(&headers_with("Basic abc")), None);
		assert_eq!(bearer_token(&headers_with("Bearer ")), None);
		assert_eq!(bearer_token(&HeaderMap::new()), None);
	}

	#[test]
	fn context_short_hash() {
		let ctx = TenantContext::new("a".repeat(64));
		assert_eq!(ctx.short_hash(), "aaaaaaaaaaaa");
		assert_eq!(format!("{ctx:?}"), r#"TenantContext { tenant: "aaaaaaaaaaaa" }"#);
	}
}

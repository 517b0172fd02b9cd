//! Router wiring and the middleware chain shared by every endpoint.

mod envelope;
mod masking;

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

pub use envelope::ApiError;
pub use masking::mask_secrets;

use crate::auth;
use crate::broker::TokenBroker;
use crate::config::Config;
use crate::errors::ErrorKind;
use crate::services::{ServiceEngine, ServiceRegistry};
use crate::store::Store;
use crate::{bridge, management, rpc};

#[derive(Clone)]
pub struct AppState {
	pub store: Arc<Store>,
	pub registry: Arc<ServiceRegistry>,
	pub broker: TokenBroker,
	pub engine: Arc<ServiceEngine>,
	pub config: Arc<Config>,
}

/// Request-scoped id attached by the outermost middleware and echoed in the
/// `x-request-id` response header.
#[derive(Clone, Debug)]
pub struct RequestId(pub Arc<str>);

/// Assemble the full router: public liveness and code-exchange endpoints,
/// then everything else behind tenant authentication.
pub fn build_router(state: AppState) -> Router {
	let protected = Router::new()
		.route("/ping", get(bridge::ping))
		.route("/api/v1/auth/verify", get(bridge::verify))
		.route(
			"/api/v1/oauth/tokens",
			post(bridge::store_tokens).get(bridge::list_tokens),
		)
		.route("/api/v1/oauth/tokens/{service}", delete(bridge::revoke_token))
		.route("/api/v1/oauth/success", post(bridge::notify_success))
		.route("/api/v1/oauth/error", post(bridge::notify_error))
		.route("/api/v1/services", get(bridge::list_services))
		.route(
			"/api/v1/services/{service}/config",
			get(bridge::service_config),
		)
		.route(
			"/api/v1/services/{service}/credentials",
			axum::routing::put(bridge::store_credentials).delete(bridge::delete_credentials),
		)
		.route(
			"/api/v1/admin/tokens",
			post(management::create_token).get(management::list_tokens),
		)
		.route(
			"/api/v1/admin/tokens/{identifier}",
			delete(management::delete_token),
		)
		.route("/api/v1/admin/authcodes", post(management::create_auth_code))
		.route("/api/v1/admin/backup", post(management::backup))
		.route("/mcp", post(rpc::handle))
		.layer(middleware::from_fn_with_state(
			state.clone(),
			auth::require_tenant,
		));

	Router::new()
		.route("/healthz", get(healthz))
		.route("/api/v1/auth/exchange", post(bridge::exchange_code))
		.merge(protected)
		.layer(
			// Order: request-id, then logging, then panic recovery; auth sits
			// innermost on the protected routes above.
			ServiceBuilder::new()
				.layer(middleware::from_fn(request_id))
				.layer(middleware::from_fn_with_state(
					state.clone(),
					request_logging,
				))
				.layer(CatchPanicLayer::custom(handle_panic)),
		)
		.with_state(state)
}

async fn healthz() -> &'static str {
	"ok"
}

async fn request_id(mut req: Request, next: Next) -> Response {
	let id: Arc<str> = Uuid::new_v4().to_string().into();
	req.extensions_mut().insert(RequestId(id.clone()));
	let mut response = next.run(req).await;
	if let Ok(value) = http::HeaderValue::from_str(&id) {
		response.headers_mut().insert("x-request-id", value);
	}
	response
}

async fn request_logging(State(state): State<AppState>, req: Request, next: Next) -> Response {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let request_id = req
		.extensions()
		.get::<RequestId>()
		.map(|id| id.0.to_string())
		.unwrap_or_default();
	if state.config.debug {
		// Authorization carries the raw API token; keep it out of the log.
		let headers: Vec<(&str, &str)> = req
			.headers()
			.iter()
			.filter(|(name, _)| *name != http::header::AUTHORIZATION)
			.map(|(name, value)| (name.as_str(), value.to_str().unwrap_or("<binary>")))
			.collect();
		debug!(%method, path, ?headers, "request headers");
	}
	let start = Instant::now();
	let response = next.run(req).await;
	info!(
		%method,
		path,
		request_id,
		status = response.status().as_u16(),
		duration_ms = start.elapsed().as_millis() as u64,
		"request"
	);
	response
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
	let detail = err
		.downcast_ref::<String>()
		.map(String::as_str)
		.or_else(|| err.downcast_ref::<&str>().copied())
		.unwrap_or("panic");
	error!(detail, "handler panicked");
	ApiError::new(ErrorKind::Database, "internal server error").into_response()
}

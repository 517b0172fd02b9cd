use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
	AuthSpec, EndpointDescriptor, EngineError, ParamLocation, ServiceDescriptor, ServiceRegistry,
	TokenPlacement, ToolSchema,
};
use crate::auth::TenantContext;
use crate::broker::{BrokerError, BrokerKey, TokenBroker};
use crate::http::mask_secrets;
use crate::store::{ServiceCredentials, Store};

/// Characters escaped when a parameter value lands in a path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'%')
	.add(b'/')
	.add(b'<')
	.add(b'>')
	.add(b'?')
	.add(b'`')
	.add(b'{')
	.add(b'}');

/// How much upstream error body is kept for diagnostics.
const UPSTREAM_DETAIL_LIMIT: usize = 256;

/// Executes tool calls against the descriptor table: parameter validation,
/// auth resolution, request composition and response shaping.
pub struct ServiceEngine {
	store: Arc<Store>,
	registry: Arc<ServiceRegistry>,
	broker: TokenBroker,
	http: reqwest::Client,
	default_timeout: Duration,
}

enum ResolvedAuth {
	None,
	Header { name: String, value: String },
	Query { name: String, value: String },
}

impl ServiceEngine {
	pub fn new(
		store: Arc<Store>,
		registry: Arc<ServiceRegistry>,
		broker: TokenBroker,
		http: reqwest::Client,
		default_timeout: Duration,
	) -> Self {
		Self {
			store,
			registry,
			broker,
			http,
			default_timeout,
		}
	}

	pub fn list_tools(&self) -> Vec<ToolSchema> {
		self.registry.list_tools()
	}

	/// Execute one tool call for `tenant`. The request-scoped deadline covers
	/// token acquisition and the provider call.
	pub async fn invoke(
		&self,
		tenant: &TenantContext,
		tool: &str,
		params: &Map<String, Value>,
	) -> Result<Value, EngineError> {
		let (service, endpoint) = self.registry.resolve(tool)?;
		validate_params(endpoint, params)?;

		let timeout = endpoint
			.timeout_secs
			.or(service.timeout_secs)
			.map(Duration::from_secs)
			.unwrap_or(self.default_timeout);

		let key = BrokerKey::new(tenant.tenant_hash(), &service.name);
		let mut forced = false;
		loop {
			let auth = self.resolve_auth(tenant, service, timeout).await?;
			let response = self
				.execute(service, endpoint, params, auth, timeout)
				.await?;
			let status = response.status();

			if status == reqwest::StatusCode::UNAUTHORIZED
				&& matches!(service.auth, AuthSpec::Oauth2(_))
			{
				if forced {
					return Err(EngineError::NeedReauth {
						service: service.name.clone(),
					});
				}
				debug!(service = %service.name, "provider rejected token, forcing refresh");
				self.broker.invalidate(&key);
				match self.broker.force_refresh(&key).await {
					Ok(_) => {},
					Err(BrokerError::NeedReauth { service }) => {
						return Err(EngineError::NeedReauth { service });
					},
					Err(e) => return Err(e.into()),
				}
				forced = true;
				continue;
			}

			if !status.is_success() {
				let detail = response.text().await.unwrap_or_default();
				let detail = mask_secrets(&detail);
				let detail = detail.chars().take(UPSTREAM_DETAIL_LIMIT).collect();
				warn!(
					service = %service.name,
					endpoint = %endpoint.id,
					status = status.as_u16(),
					"upstream call failed"
				);
				return Err(EngineError::Upstream {
					service: service.name.clone(),
					status: status.as_u16(),
					detail,
				});
			}

			let text = response
				.text()
				.await
				.map_err(|e| EngineError::Transport {
					service: service.name.clone(),
					detail: e.to_string(),
				})?;
			let value = match serde_json::from_str::<Value>(&text) {
				Ok(value) => value,
				// Not every endpoint speaks JSON; hand back the raw text.
				Err(_) => serde_json::json!({ "raw": text }),
			};
			return Ok(match &endpoint.transform {
				Some(transform) => transform.apply(value),
				None => value,
			});
		}
	}

	async fn resolve_auth(
		&self,
		tenant: &TenantContext,
		service: &ServiceDescriptor,
		timeout: Duration,
	) -> Result<ResolvedAuth, EngineError> {
		let credentials = |field: &str| -> Result<String, EngineError> {
			let creds = self.load_credentials(tenant, &service.name)?;
			credential_field(&creds, &service.name, field)
		};
		match &service.auth {
			AuthSpec::None => Ok(ResolvedAuth::None),
			AuthSpec::Oauth2(_) => {
				let bundle = tokio::time::timeout(
					timeout,
					self
						.broker
						.get_access_token(tenant.tenant_hash(), &service.name),
				)
				.await
				.map_err(|_| {
					BrokerError::Cancelled {
						service: service.name.clone(),
					}
				})??;
				Ok(ResolvedAuth::Header {
					name: http::header::AUTHORIZATION.to_string(),
					value: bundle.authorization_value(),
				})
			},
			AuthSpec::ApiKey(cfg) => {
				let value = credentials(&cfg.field)?;
				Ok(place_token(&cfg.placement, value))
			},
			AuthSpec::Basic => {
				use base64::Engine;
				let creds = self.load_credentials(tenant, &service.name)?;
				let username = credential_field(&creds, &service.name, "username")?;
				let password = credential_field(&creds, &service.name, "password")?;
				let encoded =
					base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
				Ok(ResolvedAuth::Header {
					name: http::header::AUTHORIZATION.to_string(),
					value: format!("Basic {encoded}"),
				})
			},
			AuthSpec::UserCredentials(cfg) => {
				let value = credentials(&cfg.token_field)?;
				Ok(place_token(&cfg.placement, value))
			},
		}
	}

	fn load_credentials(
		&self,
		tenant: &TenantContext,
		service: &str,
	) -> Result<ServiceCredentials, EngineError> {
		self
			.store
			.get_credentials(tenant.tenant_hash(), service)
			.map_err(|e| match e.kind() {
				crate::errors::ErrorKind::NotFound => EngineError::MissingCredentials {
					service: service.to_string(),
				},
				_ => EngineError::Store(e),
			})
	}

	async fn execute(
		&self,
		service: &ServiceDescriptor,
		endpoint: &EndpointDescriptor,
		params: &Map<String, Value>,
		auth: ResolvedAuth,
		timeout: Duration,
	) -> Result<reqwest::Response, EngineError> {
		let url = render_path(service, endpoint, params)?;
		let mut request = self
			.http
			.request(endpoint.http_method(), url)
			.timeout(timeout);

		for param in &endpoint.params {
			let Some(value) = params.get(&param.name) else {
				continue;
			};
			match param.location {
				ParamLocation::Path | ParamLocation::Body => {},
				ParamLocation::Query => match value {
					Value::Array(items) => {
						for item in items {
							request = request.query(&[(&param.name, scalar_string(item)?)]);
						}
					},
					other => {
						request = request.query(&[(&param.name, scalar_string(other)?)]);
					},
				},
				ParamLocation::Header => {
					request = request.header(param.name.as_str(), scalar_string(value)?);
				},
			}
		}

		match auth {
			ResolvedAuth::None => {},
			ResolvedAuth::Header { name, value } => {
				let mut value = http::HeaderValue::from_str(&value).map_err(|_| {
					EngineError::Parameter {
						name: name.clone(),
						message: "credential is not a valid header value".to_string(),
					}
				})?;
				value.set_sensitive(true);
				request = request.header(name.as_str(), value);
			},
			ResolvedAuth::Query { name, value } => {
				request = request.query(&[(name, value)]);
			},
		}

		if let Some(body) = render_body(endpoint, params) {
			request = request.json(&body);
		}

		request.send().await.map_err(|e| {
			if e.is_timeout() {
				EngineError::DeadlineExceeded {
					service: service.name.clone(),
				}
			} else {
				EngineError::Transport {
					service: service.name.clone(),
					detail: e.to_string(),
				}
			}
		})
	}
}

fn place_token(placement: &TokenPlacement, value: String) -> ResolvedAuth {
	match placement {
		TokenPlacement::Header { name, prefix } => ResolvedAuth::Header {
			name: name.clone(),
			value: match prefix {
				Some(prefix) => format!("{prefix} {value}"),
				None => value,
			},
		},
		TokenPlacement::Query { name } => ResolvedAuth::Query {
			name: name.clone(),
			value,
		},
	}
}

fn credential_field(
	creds: &ServiceCredentials,
	service: &str,
	field: &str,
) -> Result<String, EngineError> {
	creds
		.get(field)
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or_else(|| EngineError::BadCredentials {
			service: service.to_string(),
			field: field.to_string(),
		})
}

fn validate_params(
	endpoint: &EndpointDescriptor,
	params: &Map<String, Value>,
) -> Result<(), EngineError> {
	for (name, value) in params {
		let Some(spec) = endpoint.params.iter().find(|p| &p.name == name) else {
			return Err(EngineError::Parameter {
				name: name.clone(),
				message: "unknown parameter".to_string(),
			});
		};
		if !spec.kind.matches(value) {
			return Err(EngineError::Parameter {
				name: name.clone(),
				message: format!("expected {}", spec.kind.json_type()),
			});
		}
	}
	for spec in &endpoint.params {
		let required = spec.required || spec.location == ParamLocation::Path;
		if required && !params.contains_key(&spec.name) {
			return Err(EngineError::Parameter {
				name: spec.name.clone(),
				message: "required parameter missing".to_string(),
			});
		}
	}
	Ok(())
}

fn scalar_string(value: &Value) -> Result<String, EngineError> {
	match value {
		Value::String(s) => Ok(s.clone()),
		Value::Number(n) => Ok(n.to_string()),
		Value::Bool(b) => Ok(b.to_string()),
		other => Err(EngineError::Parameter {
			name: other.to_string(),
			message: "expected a scalar value".to_string(),
		}),
	}
}

fn render_path(
	service: &ServiceDescriptor,
	endpoint: &EndpointDescriptor,
	params: &Map<String, Value>,
) -> Result<String, EngineError> {
	let mut path = endpoint.path.clone();
	for placeholder in super::path_placeholders(&endpoint.path) {
		let value = params
			.get(&placeholder)
			.ok_or_else(|| EngineError::Parameter {
				name: placeholder.clone(),
				message: "required parameter missing".to_string(),
			})?;
		let raw = scalar_string(value)?;
		let encoded = utf8_percent_encode(&raw, PATH_SEGMENT).to_string();
		path = path.replace(&format!("{{{placeholder}}}"), &encoded);
	}
	Ok(format!(
		"{}/{}",
		service.base_url.trim_end_matches('/'),
		path.trim_start_matches('/')
	))
}

/// Body = template with `{param}` substitution, or a plain object of the
/// body-located parameters when no template is declared.
fn render_body(endpoint: &EndpointDescriptor, params: &Map<String, Value>) -> Option<Value> {
	if let Some(template) = &endpoint.body {
		return Some(render_template(template, params));
	}
	let mut body = Map::new();
	for param in &endpoint.params {
		if param.location == ParamLocation::Body {
			if let Some(value) = params.get(&param.name) {
				body.insert(param.name.clone(), value.clone());
			}
		}
	}
	if body.is_empty() {
		None
	} else {
		Some(Value::Object(body))
	}
}

fn render_template(template: &Value, params: &Map<String, Value>) -> Value {
	match template {
		Value::String(s) => render_template_string(s, params),
		Value::Array(items) => Value::Array(
			items
				.iter()
				.map(|item| render_template(item, params))
				.collect(),
		),
		Value::Object(map) => Value::Object(
			map
				.iter()
				.map(|(k, v)| (k.clone(), render_template(v, params)))
				.collect(),
		),
		other => other.clone(),
	}
}

fn render_template_string(s: &str, params: &Map<String, Value>) -> Value {
	// A string that is exactly one placeholder keeps the parameter's JSON
	// type; anything else substitutes textually.
	if let Some(name) = s
		.strip_prefix('{')
		.and_then(|rest| rest.strip_suffix('}'))
	{
		if !name.contains(['{', '}']) {
			if let Some(value) = params.get(name) {
				return value.clone();
			}
		}
	}
	let mut out = s.to_string();
	for (name, value) in params {
		let placeholder = format!("{{{name}}}");
		if out.contains(&placeholder) {
			let replacement = match value {
				Value::String(v) => v.clone(),
				other => other.to_string(),
			};
			out = out.replace(&placeholder, &replacement);
		}
	}
	Value::String(out)
}

#[cfg(test)]
#[path = "invoke_tests.rs"]
mod tests;

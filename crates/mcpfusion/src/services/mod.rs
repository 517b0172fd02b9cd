//! Declarative service descriptors and the engine that turns them into
//! callable tools.

mod invoke;
mod schema;

use std::collections::{BTreeMap, HashSet};

use http::Method;
use serde::Deserialize;
use url::Url;

pub use invoke::ServiceEngine;
pub use schema::{ToolAnnotations, ToolSchema, default_hints, input_schema};

use crate::broker::BrokerError;
use crate::errors::ErrorKind;
use crate::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
	#[error("invalid tool name {0:?}")]
	InvalidToolName(String),
	#[error("unknown tool {0:?}")]
	UnknownTool(String),
	#[error("invalid descriptor for service {service:?}: {message}")]
	InvalidDescriptor { service: String, message: String },
	#[error("parameter {name:?}: {message}")]
	Parameter { name: String, message: String },
	#[error("no {service} credentials stored for this tenant")]
	MissingCredentials { service: String },
	#[error("stored {service} credentials are missing field {field:?}")]
	BadCredentials { service: String, field: String },
	#[error("{service} authentication expired; re-run the oauth flow")]
	NeedReauth { service: String },
	#[error(transparent)]
	Broker(#[from] BrokerError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("{service} returned status {status}")]
	Upstream {
		service: String,
		status: u16,
		detail: String,
	},
	#[error("request to {service} failed: {detail}")]
	Transport { service: String, detail: String },
	#[error("request to {service} timed out")]
	DeadlineExceeded { service: String },
}

impl EngineError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			EngineError::InvalidToolName(_)
			| EngineError::UnknownTool(_)
			| EngineError::InvalidDescriptor { .. }
			| EngineError::Parameter { .. } => ErrorKind::Validation,
			EngineError::MissingCredentials { .. }
			| EngineError::BadCredentials { .. }
			| EngineError::NeedReauth { .. } => ErrorKind::Unauthenticated,
			EngineError::Broker(e) => e.kind(),
			EngineError::Store(e) => e.kind(),
			EngineError::Upstream { .. } | EngineError::Transport { .. } => ErrorKind::Upstream,
			EngineError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
		}
	}
}

/// Static definition of one upstream service: where it lives, how calls are
/// authenticated, and which endpoints it exposes as tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDescriptor {
	pub name: String,
	pub base_url: String,
	#[serde(default)]
	pub auth: AuthSpec,
	pub endpoints: Vec<EndpointDescriptor>,
	/// Per-service deadline override in seconds.
	#[serde(default)]
	pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSpec {
	#[default]
	None,
	Oauth2(OAuth2Config),
	ApiKey(ApiKeyConfig),
	Basic,
	UserCredentials(UserCredentialsConfig),
}

impl AuthSpec {
	pub fn type_name(&self) -> &'static str {
		match self {
			AuthSpec::None => "none",
			AuthSpec::Oauth2(_) => "oauth2",
			AuthSpec::ApiKey(_) => "api_key",
			AuthSpec::Basic => "basic",
			AuthSpec::UserCredentials(_) => "user_credentials",
		}
	}
}

#[derive(Clone, Deserialize)]
pub struct OAuth2Config {
	pub authorization_url: String,
	pub token_url: String,
	pub client_id: String,
	#[serde(default)]
	pub client_secret: Option<String>,
	#[serde(default)]
	pub scopes: Vec<String>,
	/// Whether the client secret may be handed to the CLI helper via the
	/// service-config endpoint.
	#[serde(default)]
	pub share_client_secret: bool,
	/// Forward-compatible extension bag for provider oddities.
	#[serde(default, flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl std::fmt::Debug for OAuth2Config {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OAuth2Config")
			.field("authorization_url", &self.authorization_url)
			.field("token_url", &self.token_url)
			.field("client_id", &self.client_id)
			.field("has_client_secret", &self.client_secret.is_some())
			.field("scopes", &self.scopes)
			.finish()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
	/// Credential-map field holding the key.
	#[serde(default = "default_api_key_field")]
	pub field: String,
	#[serde(default)]
	pub placement: TokenPlacement,
}

fn default_api_key_field() -> String {
	"api_key".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserCredentialsConfig {
	pub fields: Vec<CredentialField>,
	#[serde(default)]
	pub instructions: Option<String>,
	/// Credential-map field placed on outbound requests.
	#[serde(default = "default_token_field")]
	pub token_field: String,
	#[serde(default)]
	pub placement: TokenPlacement,
}

fn default_token_field() -> String {
	"token".to_string()
}

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct CredentialField {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	#[serde(default)]
	pub secret: bool,
	#[serde(default)]
	pub required: bool,
}

/// Where a token or key lands on the outbound request.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "in", rename_all = "snake_case")]
pub enum TokenPlacement {
	Header {
		name: String,
		#[serde(default)]
		prefix: Option<String>,
	},
	Query {
		name: String,
	},
}

impl Default for TokenPlacement {
	fn default() -> Self {
		TokenPlacement::Header {
			name: "Authorization".to_string(),
			prefix: Some("Bearer".to_string()),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDescriptor {
	pub id: String,
	pub method: String,
	/// Path template with `{param}` placeholders, relative to the base URL.
	pub path: String,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub params: Vec<ParamSpec>,
	/// Optional JSON body template; string values may contain `{param}`
	/// placeholders.
	#[serde(default)]
	pub body: Option<serde_json::Value>,
	#[serde(default)]
	pub transform: Option<ResponseTransform>,
	#[serde(default)]
	pub hints: HintOverrides,
	#[serde(default)]
	pub timeout_secs: Option<u64>,
}

impl EndpointDescriptor {
	pub fn http_method(&self) -> Method {
		Method::from_bytes(self.method.to_ascii_uppercase().as_bytes()).unwrap_or(Method::GET)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
	pub name: String,
	#[serde(rename = "type", default)]
	pub kind: ParamType,
	#[serde(default)]
	pub required: bool,
	#[serde(default)]
	pub location: ParamLocation,
	#[serde(default)]
	pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
	#[default]
	String,
	Integer,
	Number,
	Boolean,
	Array,
	Object,
}

impl ParamType {
	pub fn json_type(&self) -> &'static str {
		match self {
			ParamType::String => "string",
			ParamType::Integer => "integer",
			ParamType::Number => "number",
			ParamType::Boolean => "boolean",
			ParamType::Array => "array",
			ParamType::Object => "object",
		}
	}

	pub fn matches(&self, value: &serde_json::Value) -> bool {
		match self {
			ParamType::String => value.is_string(),
			ParamType::Integer => value.is_i64() || value.is_u64(),
			ParamType::Number => value.is_number(),
			ParamType::Boolean => value.is_boolean(),
			ParamType::Array => value.is_array(),
			ParamType::Object => value.is_object(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLocation {
	Path,
	#[default]
	Query,
	Header,
	Body,
}

/// JSON projection applied to a provider response: descend to `pointer`
/// first, then keep only `fields` of the resulting object(s).
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseTransform {
	#[serde(default)]
	pub pointer: Option<String>,
	#[serde(default)]
	pub fields: Option<Vec<String>>,
}

impl ResponseTransform {
	pub fn apply(&self, value: serde_json::Value) -> serde_json::Value {
		let value = match &self.pointer {
			Some(pointer) => value
				.pointer(pointer)
				.cloned()
				.unwrap_or(serde_json::Value::Null),
			None => value,
		};
		let Some(fields) = &self.fields else {
			return value;
		};
		project(value, fields)
	}
}

fn project(value: serde_json::Value, fields: &[String]) -> serde_json::Value {
	match value {
		serde_json::Value::Object(map) => {
			let mut out = serde_json::Map::new();
			for field in fields {
				if let Some(v) = map.get(field) {
					out.insert(field.clone(), v.clone());
				}
			}
			serde_json::Value::Object(out)
		},
		serde_json::Value::Array(items) => serde_json::Value::Array(
			items
				.into_iter()
				.map(|item| project(item, fields))
				.collect(),
		),
		other => other,
	}
}

/// Three-valued per-endpoint hint overrides; unset values fall back to the
/// method heuristics.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HintOverrides {
	#[serde(default)]
	pub read_only: Option<bool>,
	#[serde(default)]
	pub destructive: Option<bool>,
	#[serde(default)]
	pub idempotent: Option<bool>,
	#[serde(default)]
	pub open_world: Option<bool>,
}

pub fn build_tool_name(service: &str, endpoint: &str) -> String {
	format!("{service}_{endpoint}")
}

/// Split a tool name on the first underscore. Endpoint ids may themselves
/// contain underscores; service names may not.
pub fn parse_tool_name(name: &str) -> Result<(&str, &str), EngineError> {
	match name.split_once('_') {
		Some((service, endpoint)) if !service.is_empty() && !endpoint.is_empty() => {
			Ok((service, endpoint))
		},
		_ => Err(EngineError::InvalidToolName(name.to_string())),
	}
}

/// Immutable descriptor table, fully validated at load.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
	services: BTreeMap<String, ServiceDescriptor>,
}

#[derive(Deserialize)]
struct ServicesFile {
	services: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
	pub fn new(descriptors: Vec<ServiceDescriptor>) -> Result<Self, EngineError> {
		let mut services = BTreeMap::new();
		for descriptor in descriptors {
			validate_descriptor(&descriptor)?;
			let name = descriptor.name.clone();
			if services.insert(name.clone(), descriptor).is_some() {
				return Err(EngineError::InvalidDescriptor {
					service: name,
					message: "duplicate service name".to_string(),
				});
			}
		}
		Ok(Self { services })
	}

	/// Parse the `services:` YAML document used by the config collaborator.
	pub fn from_yaml(raw: &str) -> Result<Self, EngineError> {
		let file: ServicesFile =
			serde_yaml::from_str(raw).map_err(|e| EngineError::InvalidDescriptor {
				service: String::new(),
				message: e.to_string(),
			})?;
		Self::new(file.services)
	}

	pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
		self.services.get(name)
	}

	pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
		self.services.values()
	}

	pub fn is_empty(&self) -> bool {
		self.services.is_empty()
	}

	/// Resolve a tool name to its service and endpoint descriptors.
	pub fn resolve(
		&self,
		tool: &str,
	) -> Result<(&ServiceDescriptor, &EndpointDescriptor), EngineError> {
		let (service_name, endpoint_id) = parse_tool_name(tool)?;
		let service = self
			.services
			.get(service_name)
			.ok_or_else(|| EngineError::UnknownTool(tool.to_string()))?;
		let endpoint = service
			.endpoints
			.iter()
			.find(|e| e.id == endpoint_id)
			.ok_or_else(|| EngineError::UnknownTool(tool.to_string()))?;
		Ok((service, endpoint))
	}

	/// One schema per endpoint, sorted by tool name.
	pub fn list_tools(&self) -> Vec<ToolSchema> {
		let mut tools: Vec<ToolSchema> = self
			.services
			.values()
			.flat_map(|service| {
				service
					.endpoints
					.iter()
					.map(|endpoint| schema::tool_schema(service, endpoint))
			})
			.collect();
		tools.sort_by(|a, b| a.name.cmp(&b.name));
		tools
	}
}

fn validate_descriptor(descriptor: &ServiceDescriptor) -> Result<(), EngineError> {
	let invalid = |message: String| EngineError::InvalidDescriptor {
		service: descriptor.name.clone(),
		message,
	};
	if descriptor.name.is_empty() {
		return Err(invalid("service name must not be empty".to_string()));
	}
	if descriptor.name.contains('_') || descriptor.name.contains('/') {
		return Err(invalid(
			"service names may not contain '_' or '/'".to_string(),
		));
	}
	Url::parse(&descriptor.base_url).map_err(|e| invalid(format!("base_url: {e}")))?;
	if let AuthSpec::Oauth2(oauth) = &descriptor.auth {
		if oauth.token_url.is_empty() || oauth.client_id.is_empty() {
			return Err(invalid(
				"oauth2 requires token_url and client_id".to_string(),
			));
		}
	}
	if descriptor.endpoints.is_empty() {
		return Err(invalid("at least one endpoint is required".to_string()));
	}
	let mut seen = HashSet::new();
	for endpoint in &descriptor.endpoints {
		if endpoint.id.is_empty() {
			return Err(invalid("endpoint id must not be empty".to_string()));
		}
		if !seen.insert(endpoint.id.as_str()) {
			return Err(invalid(format!("duplicate endpoint id {:?}", endpoint.id)));
		}
		if Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes()).is_err() {
			return Err(invalid(format!(
				"endpoint {:?}: invalid method {:?}",
				endpoint.id, endpoint.method
			)));
		}
		for placeholder in path_placeholders(&endpoint.path) {
			let covered = endpoint
				.params
				.iter()
				.any(|p| p.name == placeholder && p.location == ParamLocation::Path);
			if !covered {
				return Err(invalid(format!(
					"endpoint {:?}: path placeholder {placeholder:?} has no path parameter",
					endpoint.id
				)));
			}
		}
	}
	Ok(())
}

pub(crate) fn path_placeholders(path: &str) -> Vec<String> {
	let mut out = Vec::new();
	let mut rest = path;
	while let Some(open) = rest.find('{') {
		let Some(close) = rest[open..].find('}') else {
			break;
		};
		out.push(rest[open + 1..open + close].to_string());
		rest = &rest[open + close + 1..];
	}
	out
}

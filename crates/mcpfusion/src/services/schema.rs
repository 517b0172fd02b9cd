use http::Method;
use serde::Serialize;
use serde_json::{Value, json};

use super::{EndpointDescriptor, HintOverrides, ParamSpec, ServiceDescriptor, build_tool_name};

/// Wire-compatible MCP tool schema. Transport framing lives with the MCP
/// collaborator; this is only the shape it serializes.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(rename = "inputSchema")]
	pub input_schema: Value,
	#[serde(skip_serializing_if = "ToolAnnotations::is_unset")]
	pub annotations: ToolAnnotations,
}

/// Three-valued behavior hints. `None` is "unset" and is omitted from the
/// serialized schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub read_only_hint: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub destructive_hint: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub idempotent_hint: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub open_world_hint: Option<bool>,
}

impl ToolAnnotations {
	pub fn is_unset(&self) -> bool {
		self.read_only_hint.is_none()
			&& self.destructive_hint.is_none()
			&& self.idempotent_hint.is_none()
			&& self.open_world_hint.is_none()
	}

	/// Apply per-endpoint overrides; set values win over the defaults.
	pub fn merge(self, overrides: &HintOverrides) -> Self {
		Self {
			read_only_hint: overrides.read_only.or(self.read_only_hint),
			destructive_hint: overrides.destructive.or(self.destructive_hint),
			idempotent_hint: overrides.idempotent.or(self.idempotent_hint),
			open_world_hint: overrides.open_world.or(self.open_world_hint),
		}
	}
}

/// Method heuristics: GET/HEAD are read-only and idempotent, PUT is
/// idempotent, DELETE is destructive, POST/PATCH promise nothing. Every tool
/// talks to a remote API, so OpenWorld defaults to true.
pub fn default_hints(method: &Method) -> ToolAnnotations {
	let hints = |read_only, destructive, idempotent| ToolAnnotations {
		read_only_hint: Some(read_only),
		destructive_hint: Some(destructive),
		idempotent_hint: Some(idempotent),
		open_world_hint: Some(true),
	};
	match *method {
		Method::GET | Method::HEAD => hints(true, false, true),
		Method::PUT => hints(false, false, true),
		Method::DELETE => hints(false, true, false),
		Method::POST | Method::PATCH => hints(false, false, false),
		_ => ToolAnnotations {
			open_world_hint: Some(true),
			..Default::default()
		},
	}
}

/// JSON-schema object describing an endpoint's parameters.
pub fn input_schema(params: &[ParamSpec]) -> Value {
	let mut properties = serde_json::Map::new();
	let mut required = Vec::new();
	for param in params {
		let mut prop = serde_json::Map::new();
		prop.insert("type".to_string(), json!(param.kind.json_type()));
		if let Some(description) = &param.description {
			prop.insert("description".to_string(), json!(description));
		}
		properties.insert(param.name.clone(), Value::Object(prop));
		// Path parameters are always required; the template cannot render
		// without them.
		if param.required || param.location == super::ParamLocation::Path {
			required.push(json!(param.name));
		}
	}
	let mut schema = serde_json::Map::new();
	schema.insert("type".to_string(), json!("object"));
	schema.insert("properties".to_string(), Value::Object(properties));
	if !required.is_empty() {
		schema.insert("required".to_string(), Value::Array(required));
	}
	Value::Object(schema)
}

pub(super) fn tool_schema(
	service: &ServiceDescriptor,
	endpoint: &EndpointDescriptor,
) -> ToolSchema {
	ToolSchema {
		name: build_tool_name(&service.name, &endpoint.id),
		description: endpoint.description.clone(),
		input_schema: input_schema(&endpoint.params),
		annotations: default_hints(&endpoint.http_method()).merge(&endpoint.hints),
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::super::{ParamLocation, ParamType};
	use super::*;

	#[rstest]
	#[case::get("GET", Some(true), Some(false), Some(true), Some(true))]
	#[case::head("HEAD", Some(true), Some(false), Some(true), Some(true))]
	#[case::put("PUT", Some(false), Some(false), Some(true), Some(true))]
	#[case::delete("DELETE", Some(false), Some(true), Some(false), Some(true))]
	#[case::post("POST", Some(false), Some(false), Some(false), Some(true))]
	#[case::patch("PATCH", Some(false), Some(false), Some(false), Some(true))]
	fn method_heuristics(
		#[case] method: &str,
		#[case] read_only: Option<bool>,
		#[case] destructive: Option<bool>,
		#[case] idempotent: Option<bool>,
		#[case] open_world: Option<bool>,
	) {
		let method = Method::from_bytes(method.as_bytes()).unwrap();
		assert_eq!(
			default_hints(&method),
			ToolAnnotations {
				read_only_hint: read_only,
				destructive_hint: destructive,
				idempotent_hint: idempotent,
				open_world_hint: open_world,
			}
		);
	}

	#[test]
	fn overrides_win_over_defaults() {
		let merged = default_hints(&Method::GET).merge(&HintOverrides {
			read_only: Some(false),
			destructive: None,
			idempotent: None,
			open_world: Some(false),
		});
		assert_eq!(merged.read_only_hint, Some(false));
		assert_eq!(merged.destructive_hint, Some(false));
		assert_eq!(merged.idempotent_hint, Some(true));
		assert_eq!(merged.open_world_hint, Some(false));
	}

	#[test]
	fn unset_hints_are_omitted() {
		let annotations = ToolAnnotations {
			read_only_hint: Some(true),
			..Default::default()
		};
		let v = serde_json::to_value(annotations).unwrap();
		assert_eq!(v, serde_json::json!({"readOnlyHint": true}));
	}

	#[test]
	fn input_schema_marks_required() {
		let params = vec![
			ParamSpec {
				name: "user_id".to_string(),
				kind: ParamType::String,
				required: false,
				location: ParamLocation::Path,
				description: Some("target user".to_string()),
			},
			ParamSpec {
				name: "limit".to_string(),
				kind: ParamType::Integer,
				required: false,
				location: ParamLocation::Query,
				description: None,
			},
		];
		let schema = input_schema(&params);
		assert_eq!(schema["type"], "object");
		assert_eq!(schema["properties"]["user_id"]["type"], "string");
		assert_eq!(schema["properties"]["limit"]["type"], "integer");
		// Path params are required even when not marked.
		assert_eq!(schema["required"], serde_json::json!(["user_id"]));
	}
}

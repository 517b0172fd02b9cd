use std::sync::OnceLock;

use regex::Regex;

/// Fields whose values never reach a log line.
const SENSITIVE_FIELDS: &str = "access_token|refresh_token|client_secret|password|api_key|code";

fn json_pattern() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(&format!(
			r#""({SENSITIVE_FIELDS})"(\s*:\s*)"[^"]*""#
		))
		.expect("valid masking regex")
	})
}

fn form_pattern() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(&format!(r#"(^|[&?])({SENSITIVE_FIELDS})=[^&\s"]*"#)).expect("valid masking regex")
	})
}

/// Replace sensitive values in a request/response body with `***`. Handles
/// both JSON (`"k":"v"`) and form (`k=v`) shapes; anything else passes
/// through untouched.
pub fn mask_secrets(body: &str) -> String {
	let masked = json_pattern().replace_all(body, r#""$1"$2"***""#);
	form_pattern()
		.replace_all(&masked, "${1}${2}=***")
		.into_owned()
}

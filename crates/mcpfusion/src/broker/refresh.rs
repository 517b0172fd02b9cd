use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::BrokerError;
use crate::http::mask_secrets;
use crate::services::OAuth2Config;
use crate::store::TokenBundle;

/// Token-endpoint response for a `refresh_token` grant. Providers are loose
/// about optional fields; everything beyond `access_token` may be absent.
#[derive(Debug, Deserialize)]
pub(crate) struct RefreshResponse {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub token_type: Option<String>,
	#[serde(default)]
	pub expires_in: Option<i64>,
	#[serde(default)]
	pub scope: Option<String>,
}

pub(crate) async fn exchange(
	http: &reqwest::Client,
	oauth: &OAuth2Config,
	service: &str,
	refresh_token: &str,
) -> Result<RefreshResponse, BrokerError> {
	let failed = |detail: String| BrokerError::RefreshFailed {
		service: service.to_string(),
		detail,
	};
	let mut form = vec![
		("grant_type", "refresh_token"),
		("refresh_token", refresh_token),
		("client_id", oauth.client_id.as_str()),
	];
	if let Some(secret) = oauth.client_secret.as_deref() {
		form.push(("client_secret", secret));
	}
	let response = http
		.post(&oauth.token_url)
		.form(&form)
		.send()
		.await
		.map_err(|e| failed(e.to_string()))?;
	let status = response.status();
	if !status.is_success() {
		let body = response.text().await.unwrap_or_default();
		debug!(
			service,
			status = status.as_u16(),
			body = %mask_secrets(&body),
			"refresh exchange rejected"
		);
		return Err(failed(format!("token endpoint returned {status}")));
	}
	response
		.json::<RefreshResponse>()
		.await
		.map_err(|e| failed(format!("invalid token response: {e}")))
}

/// Fold a refresh response into the previous bundle. Providers that rotate
/// refresh tokens send a new one; otherwise the old one stays valid.
pub(crate) fn apply(old: TokenBundle, response: RefreshResponse) -> TokenBundle {
	let now = Utc::now();
	TokenBundle {
		access_token: response.access_token,
		refresh_token: response.refresh_token.or(old.refresh_token),
		token_type: response.token_type.unwrap_or(old.token_type),
		expires_at: response
			.expires_in
			.map(|secs| now + chrono::Duration::seconds(secs)),
		scope: response
			.scope
			.map(|s| s.split_whitespace().map(str::to_string).collect())
			.unwrap_or(old.scope),
		metadata: old.metadata,
		created_at: old.created_at,
		updated_at: now,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn apply_keeps_old_refresh_token() {
		let mut old = TokenBundle::new("old-at");
		old.refresh_token = Some("old-rt".to_string());
		old.scope = vec!["mail".to_string()];
		let new = apply(
			old,
			RefreshResponse {
				access_token: "new-at".to_string(),
				refresh_token: None,
				token_type: None,
				expires_in: Some(3600),
				scope: None,
			},
		);
		assert_eq!(new.access_token, "new-at");
		assert_eq!(new.refresh_token.as_deref(), Some("old-rt"));
		assert_eq!(new.scope, vec!["mail".to_string()]);
		assert!(new.expires_at.is_some());
	}

	#[test]
	fn apply_takes_rotated_refresh_token() {
		let mut old = TokenBundle::new("old-at");
		old.refresh_token = Some("old-rt".to_string());
		let new = apply(
			old,
			RefreshResponse {
				access_token: "new-at".to_string(),
				refresh_token: Some("new-rt".to_string()),
				token_type: Some("Bearer".to_string()),
				expires_in: None,
				scope: Some("a b".to_string()),
			},
		);
		assert_eq!(new.refresh_token.as_deref(), Some("new-rt"));
		assert_eq!(new.scope, vec!["a".to_string(), "b".to_string()]);
		// No expires_in means the provider considers it non-expiring.
		assert!(new.expires_at.is_none());
	}
}

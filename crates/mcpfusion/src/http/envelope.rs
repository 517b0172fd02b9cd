use axum::Json;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::BrokerError;
use crate::errors::ErrorKind;
use crate::services::EngineError;
use crate::store::StoreError;

/// Uniform error shape for every admin/bridge endpoint:
/// `{success:false, error:{code,message,type}, timestamp}`.
#[derive(Debug)]
pub struct ApiError {
	pub kind: ErrorKind,
	pub message: String,
}

impl ApiError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}

	pub fn validation(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Validation, message)
	}

	pub fn unauthenticated(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::Unauthenticated, message)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotFound, message)
	}
}

impl std::fmt::Display for ApiError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.kind, self.message)
	}
}

#[derive(Serialize)]
struct ErrorEnvelope {
	success: bool,
	error: ErrorBody,
	timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct ErrorBody {
	code: u16,
	message: String,
	#[serde(rename = "type")]
	error_type: &'static str,
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.kind.http_status();
		let body = ErrorEnvelope {
			success: false,
			error: ErrorBody {
				code: status.as_u16(),
				message: self.message,
				error_type: "api_error",
			},
			timestamp: Utc::now(),
		};
		(status, Json(body)).into_response()
	}
}

impl From<StoreError> for ApiError {
	fn from(err: StoreError) -> Self {
		Self::new(err.kind(), err.to_string())
	}
}

impl From<BrokerError> for ApiError {
	fn from(err: BrokerError) -> Self {
		Self::new(err.kind(), err.to_string())
	}
}

impl From<EngineError> for ApiError {
	fn from(err: EngineError) -> Self {
		Self::new(err.kind(), err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn envelope_shape() {
		let resp = ApiError::validation("bad input").into_response();
		assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
		let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
			.await
			.unwrap();
		let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(v["success"], false);
		assert_eq!(v["error"]["code"], 400);
		assert_eq!(v["error"]["type"], "api_error");
		assert_eq!(v["error"]["message"], "bad input");
		assert!(v["timestamp"].is_string());
	}

	#[tokio::test]
	async fn kind_status_mapping() {
		for (err, status) in [
			(ApiError::unauthenticated("x"), 401),
			(ApiError::not_found("x"), 404),
			(ApiError::new(ErrorKind::Duplicate, "x"), 409),
			(ApiError::new(ErrorKind::Upstream, "x"), 502),
			(ApiError::new(ErrorKind::DeadlineExceeded, "x"), 504),
			(ApiError::new(ErrorKind::Database, "x"), 500),
		] {
			assert_eq!(err.into_response().status().as_u16(), status);
		}
	}
}

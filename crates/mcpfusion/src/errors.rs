use http::StatusCode;

/// Coarse classification shared by every subsystem error. Handlers map a kind
/// to an HTTP status; everything else about an error stays subsystem-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Validation,
	NotFound,
	TokenNotFound,
	Duplicate,
	Unauthenticated,
	Upstream,
	Cancelled,
	DeadlineExceeded,
	Database,
}

impl ErrorKind {
	pub fn http_status(&self) -> StatusCode {
		match self {
			ErrorKind::Validation => StatusCode::BAD_REQUEST,
			ErrorKind::NotFound | ErrorKind::TokenNotFound => StatusCode::NOT_FOUND,
			ErrorKind::Duplicate => StatusCode::CONFLICT,
			ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
			ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
			ErrorKind::Cancelled | ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
			ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::Validation => "validation",
			ErrorKind::NotFound => "not_found",
			ErrorKind::TokenNotFound => "token_not_found",
			ErrorKind::Duplicate => "duplicate",
			ErrorKind::Unauthenticated => "unauthenticated",
			ErrorKind::Upstream => "upstream",
			ErrorKind::Cancelled => "cancelled",
			ErrorKind::DeadlineExceeded => "deadline_exceeded",
			ErrorKind::Database => "database",
		}
	}
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

use std::path::PathBuf;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Config
    #[error("config not found (searched: {searched:?})")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("config parse error in {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    // Keys
    #[error("cannot load key {path}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    #[error("unsupported EC curve in {path}")]
    UnsupportedCurve { path: PathBuf },

    // Tokens
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("failed to sign token: {0}")]
    Signing(String),

    // Requests
    #[error("missing authentication")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigNotFound { .. }
            | Self::ConfigParse { .. }
            | Self::Config(_)
            | Self::KeyLoad { .. }
            | Self::UnsupportedCurve { .. }
            | Self::Signing(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,

            Self::InvalidToken | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Short, stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "config_not_found",
            Self::ConfigParse { .. } => "config_parse_error",
            Self::Config(_) => "config_error",
            Self::KeyLoad { .. } => "key_error",
            Self::UnsupportedCurve { .. } => "unsupported_curve",
            Self::InvalidToken => "invalid_token",
            Self::Signing(_) => "server_error",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::Internal(_) => "server_error",
        }
    }
}

/// Plain-text body in the form `"<code> <reason>"`, e.g. `405 Method not allowed`.
fn plain_text_body(status: StatusCode) -> String {
    let reason = match status {
        StatusCode::METHOD_NOT_ALLOWED => "Method not allowed",
        other => other.canonical_reason().unwrap_or("Error"),
    };
    format!("{} {}", status.as_u16(), reason)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::debug!(error = %self, code = self.error_code(), "request rejected");
        }

        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            plain_text_body(status),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

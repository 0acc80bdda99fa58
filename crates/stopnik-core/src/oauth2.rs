//! OAuth 2.0 vocabulary: grant and response types, token types, error codes
//! and the RFC 6749 section 5.2 error body.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

// --- Parameter names ---

pub const PARAM_CLIENT_ID: &str = "client_id";
pub const PARAM_CLIENT_SECRET: &str = "client_secret";
pub const PARAM_GRANT_TYPE: &str = "grant_type";
pub const PARAM_CODE: &str = "code";
pub const PARAM_CODE_VERIFIER: &str = "code_verifier";
pub const PARAM_REDIRECT_URI: &str = "redirect_uri";
pub const PARAM_RESPONSE_TYPE: &str = "response_type";
pub const PARAM_SCOPE: &str = "scope";
pub const PARAM_STATE: &str = "state";
pub const PARAM_ACCESS_TOKEN: &str = "access_token";
pub const PARAM_TOKEN_TYPE: &str = "token_type";
pub const PARAM_EXPIRES_IN: &str = "expires_in";
pub const PARAM_ID_TOKEN: &str = "id_token";
pub const PARAM_ERROR: &str = "error";
pub const PARAM_ERROR_DESCRIPTION: &str = "error_description";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    Password,
    ClientCredentials,
    RefreshToken,
    Implicit,
}

impl GrantType {
    pub const ALL: [GrantType; 5] = [
        Self::AuthorizationCode,
        Self::ClientCredentials,
        Self::Implicit,
        Self::Password,
        Self::RefreshToken,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "authorization_code" => Some(Self::AuthorizationCode),
            "password" => Some(Self::Password),
            "client_credentials" => Some(Self::ClientCredentials),
            "refresh_token" => Some(Self::RefreshToken),
            "implicit" => Some(Self::Implicit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::Password => "password",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken => "refresh_token",
            Self::Implicit => "implicit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Code,
    Token,
    IdToken,
}

impl ResponseType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "code" => Some(Self::Code),
            "token" => Some(Self::Token),
            "id_token" => Some(Self::IdToken),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Token => "token",
            Self::IdToken => "id_token",
        }
    }
}

/// Parse a space separated `response_type`. Any unknown member fails the whole list.
pub fn parse_response_types(value: &str) -> Option<Vec<ResponseType>> {
    let types: Option<Vec<_>> = value.split(' ').map(ResponseType::parse).collect();
    types.filter(|t| !t.is_empty())
}

/// Where authorization response parameters go on the redirect URI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseMode {
    #[default]
    Query,
    Fragment,
}

impl ResponseMode {
    pub const PARAM: &str = "response_mode";

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "query" => Some(Self::Query),
            "fragment" => Some(Self::Fragment),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Fragment => "fragment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

impl TokenTypeHint {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "access_token" => Some(Self::AccessToken),
            "refresh_token" => Some(Self::RefreshToken),
            _ => None,
        }
    }
}

pub const TOKEN_TYPE_BEARER: &str = "bearer";

/// Split a `scope` parameter on single spaces, dropping empty members.
pub fn split_scopes(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// --- Errors ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    AccessDenied,
    ServerError,
    TemporarilyUnavailable,
    UnsupportedTokenType,
    LoginRequired,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::UnsupportedTokenType => "unsupported_token_type",
            Self::LoginRequired => "login_required",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct OAuthErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
}

/// JSON error returned by the token, introspection and revocation endpoints.
#[derive(Debug, Clone)]
pub struct OAuthError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub description: Option<String>,
}

impl OAuthError {
    pub fn new(status: StatusCode, code: ErrorCode) -> Self {
        Self { status, code, description: None }
    }

    pub fn bad_request(code: ErrorCode) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        tracing::debug!(status = %self.status, error = %self.code, "oauth error");
        let body = OAuthErrorBody {
            error: self.code.as_str(),
            error_description: self.description,
        };
        (
            self.status,
            [(header::CACHE_CONTROL, "no-store")],
            Json(body),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_type_lists() {
        assert_eq!(parse_response_types("code"), Some(vec![ResponseType::Code]));
        assert_eq!(
            parse_response_types("code id_token"),
            Some(vec![ResponseType::Code, ResponseType::IdToken])
        );
        assert_eq!(parse_response_types("code foo"), None);
        assert_eq!(parse_response_types(""), None);
    }

    #[test]
    fn grant_types() {
        for grant in GrantType::ALL {
            assert_eq!(GrantType::parse(grant.as_str()), Some(grant));
        }
        assert_eq!(GrantType::parse("device_code"), None);
    }

    #[test]
    fn scopes_split_on_single_space() {
        assert_eq!(split_scopes(Some("openid profile")), vec!["openid", "profile"]);
        assert_eq!(split_scopes(Some("a  b")), vec!["a", "b"]);
        assert!(split_scopes(None).is_empty());
    }

    #[test]
    fn token_type_hints() {
        assert_eq!(TokenTypeHint::parse("access_token"), Some(TokenTypeHint::AccessToken));
        assert_eq!(TokenTypeHint::parse("refresh_token"), Some(TokenTypeHint::RefreshToken));
        assert_eq!(TokenTypeHint::parse("id_token"), None);
    }
}

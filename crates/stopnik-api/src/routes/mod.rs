use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use axum::{Json, Router};
use serde::Serialize;

use stopnik_core::config::Config;
use stopnik_core::error::Error;
use stopnik_core::oauth2::OAuthError;
use stopnik_core::token::{Bearer, bearer_value};

pub mod account;
pub mod authorize;
pub mod forward_auth;
pub mod introspect;
pub mod metadata;
pub mod oidc;
pub mod token;

use crate::server::AppState;

pub(crate) const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub(crate) const X_FORWARDED_HOST: &str = "x-forwarded-host";

#[derive(Serialize)]
struct HealthResponse {
    ping: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scopes: Option<Vec<String>>,
}

async fn health(State(state): State<AppState>, headers: HeaderMap) -> Json<HealthResponse> {
    let bearer = bearer(&state, &headers);
    Json(HealthResponse {
        ping: "pong",
        username: bearer.as_ref().and_then(|b| b.user).map(|u| u.username.clone()),
        scopes: bearer.map(|b| b.token.scopes),
    })
}

async fn method_not_allowed() -> Error {
    Error::MethodNotAllowed
}

/// Answer unsupported methods with a plain-text 405.
pub(crate) fn methods(router: MethodRouter<AppState>) -> MethodRouter<AppState> {
    router.fallback(method_not_allowed)
}

/// Scheme and host the client used to reach us, honoring proxy headers.
pub(crate) fn request_base(headers: &HeaderMap) -> Option<String> {
    let host = header_value(headers, X_FORWARDED_HOST)
        .or_else(|| header_value(headers, header::HOST.as_str()))?;
    let proto = header_value(headers, X_FORWARDED_PROTO).unwrap_or("http");
    Some(format!("{proto}://{host}"))
}

/// Non-empty header value as text.
pub(crate) fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

pub(crate) fn issuer(state: &AppState, headers: &HeaderMap) -> String {
    state.config.issuer(request_base(headers).as_deref())
}

/// Resolve an `Authorization: Bearer` header to a live access token.
pub(crate) fn bearer<'a>(state: &'a AppState, headers: &HeaderMap) -> Option<Bearer<'a>> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    state.tokens.validate_bearer(bearer_value(value)?)
}

/// Failure of an OAuth endpoint: a protocol error or an internal one.
#[derive(Debug)]
pub(crate) enum Rejection {
    OAuth(OAuthError),
    Internal(Error),
}

impl From<OAuthError> for Rejection {
    fn from(e: OAuthError) -> Self {
        Self::OAuth(e)
    }
}

impl From<Error> for Rejection {
    fn from(e: Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Self::OAuth(e) => e.into_response(),
            Self::Internal(e) => e.into_response(),
        }
    }
}

pub fn router(config: &Config) -> Router<AppState> {
    let mut router = Router::new()
        .route("/health", methods(get(health)))
        .merge(metadata::router())
        .merge(authorize::router())
        .merge(token::router())
        .merge(introspect::router())
        .merge(account::router());

    if config.oidc_enabled() {
        router = router.merge(oidc::router());
    }
    if config.forward_auth_enabled() {
        router = router.merge(forward_auth::router(&config.server.forward_auth.endpoint));
    }
    router
}

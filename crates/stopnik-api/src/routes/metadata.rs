//! Authorization server metadata (RFC 8414) and the JWKS.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use stopnik_core::keys::SigningAlgorithm;
use stopnik_core::oauth2::{GrantType, ResponseMode, ResponseType};
use stopnik_core::pkce::PkceMethod;

use super::{issuer, methods, request_base};
use crate::server::AppState;

pub const AUTH_METHODS: [&str; 2] = ["client_secret_basic", "client_secret_post"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/keys", methods(get(keys)))
        .route("/.well-known/oauth-authorization-server", methods(get(metadata)))
}

async fn keys(State(state): State<AppState>) -> Json<Value> {
    Json(state.keys.jwks().clone())
}

/// Base URL the endpoint URLs are built from.
pub(crate) fn endpoint_base(headers: &HeaderMap) -> String {
    request_base(headers).unwrap_or_default()
}

pub(crate) fn signing_algorithms() -> Vec<&'static str> {
    SigningAlgorithm::ALL.iter().map(|a| a.as_str()).collect()
}

/// Fields shared by the OAuth metadata and the OIDC discovery documents.
pub(crate) fn base_document(state: &AppState, headers: &HeaderMap) -> Value {
    let base = endpoint_base(headers);
    let algorithms = signing_algorithms();
    json!({
        "issuer": issuer(state, headers),
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "introspection_endpoint": format!("{base}/introspect"),
        "revocation_endpoint": format!("{base}/revoke"),
        "jwks_uri": format!("{base}/keys"),
        "response_types_supported": [
            ResponseType::Code.as_str(),
            ResponseType::Token.as_str(),
            ResponseType::IdToken.as_str(),
        ],
        "response_modes_supported": [ResponseMode::Query.as_str(), ResponseMode::Fragment.as_str()],
        "grant_types_supported": GrantType::ALL.iter().map(|g| g.as_str()).collect::<Vec<_>>(),
        "code_challenge_methods_supported": [PkceMethod::Plain.as_str(), PkceMethod::S256.as_str()],
        "token_endpoint_auth_methods_supported": AUTH_METHODS,
        "token_endpoint_auth_signing_alg_values_supported": algorithms,
        "introspection_endpoint_auth_methods_supported": AUTH_METHODS,
        "introspection_endpoint_auth_signing_alg_values_supported": algorithms,
        "revocation_endpoint_auth_methods_supported": AUTH_METHODS,
        "revocation_endpoint_auth_signing_alg_values_supported": algorithms,
    })
}

async fn metadata(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    Json(base_document(&state, &headers))
}

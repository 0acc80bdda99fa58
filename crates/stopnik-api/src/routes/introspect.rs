//! Token introspection (RFC 7662) and revocation (RFC 7009).

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};

use stopnik_core::config::Client;
use stopnik_core::oauth2::{ErrorCode, OAuthError, TOKEN_TYPE_BEARER, TokenTypeHint};

use super::{bearer, methods};
use crate::server::AppState;
use crate::validation;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/introspect", methods(post(introspect)))
        .route("/revoke", methods(post(revoke)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenForm {
    token: String,
    token_type_hint: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl TokenForm {
    /// Which stores to search, in order.
    fn lookup_order(&self) -> &'static [TokenTypeHint] {
        match TokenTypeHint::parse(&self.token_type_hint) {
            Some(TokenTypeHint::AccessToken) => &[TokenTypeHint::AccessToken],
            Some(TokenTypeHint::RefreshToken) => &[TokenTypeHint::RefreshToken],
            None => &[TokenTypeHint::AccessToken, TokenTypeHint::RefreshToken],
        }
    }
}

/// Admit callers with client credentials of a client that has the endpoint
/// enabled, or with a bearer token carrying `scope`.
fn check_caller(
    state: &AppState,
    headers: &HeaderMap,
    form: &TokenForm,
    enabled: fn(&Client) -> bool,
    scope: &str,
    disabled: ErrorCode,
) -> Result<(), OAuthError> {
    match validation::validate_client_credentials(
        &state.config,
        headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    ) {
        Ok(authenticated) if enabled(authenticated.client) => Ok(()),
        Ok(authenticated) => {
            tracing::warn!(client_id = %authenticated.client.id, "endpoint disabled for client");
            Err(OAuthError::new(StatusCode::SERVICE_UNAVAILABLE, disabled))
        }
        Err(_) => bearer(state, headers)
            .filter(|b| b.token.scopes.iter().any(|s| s == scope))
            .map(|_| ())
            .ok_or(OAuthError::new(StatusCode::UNAUTHORIZED, ErrorCode::InvalidRequest)),
    }
}

#[derive(Debug, Default, Serialize)]
struct IntrospectResponse {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn describe(state: &AppState, form: &TokenForm) -> IntrospectResponse {
    for hint in form.lookup_order() {
        match hint {
            TokenTypeHint::AccessToken => {
                if let Some(token) = state.tokens.access_token(&form.token) {
                    return IntrospectResponse {
                        active: true,
                        username: non_empty(token.username),
                        client_id: Some(token.client_id),
                        scope: non_empty(token.scopes.join(" ")),
                        token_type: Some(TOKEN_TYPE_BEARER),
                        exp: Some(token.expires_at.timestamp()),
                    };
                }
            }
            TokenTypeHint::RefreshToken => {
                if let Some(token) = state.tokens.refresh_token(&form.token) {
                    return IntrospectResponse {
                        active: true,
                        username: non_empty(token.username),
                        client_id: Some(token.client_id),
                        scope: non_empty(token.scopes.join(" ")),
                        token_type: None,
                        exp: Some(token.expires_at.timestamp()),
                    };
                }
            }
        }
    }
    IntrospectResponse::default()
}

async fn introspect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Json<IntrospectResponse>, OAuthError> {
    check_caller(
        &state,
        &headers,
        &form,
        |client| client.introspect,
        &state.config.server.introspect_scope,
        ErrorCode::InvalidRequest,
    )?;
    let response = describe(&state, &form);
    tracing::debug!(active = response.active, "token introspected");
    Ok(Json(response))
}

async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<StatusCode, OAuthError> {
    check_caller(
        &state,
        &headers,
        &form,
        |client| client.revoke,
        &state.config.server.revoke_scope,
        ErrorCode::UnsupportedTokenType,
    )?;
    let revoked = form.lookup_order().iter().any(|hint| match hint {
        TokenTypeHint::AccessToken => state.tokens.revoke_access_token(&form.token),
        TokenTypeHint::RefreshToken => state.tokens.revoke_refresh_token(&form.token),
    });
    tracing::debug!(revoked, "token revocation");
    Ok(StatusCode::OK)
}

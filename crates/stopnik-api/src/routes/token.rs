//! `/token`: authenticates the client and dispatches on `grant_type`.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use serde::Deserialize;

use stopnik_core::config::Client;
use stopnik_core::oauth2::{self, ErrorCode, GrantType, OAuthError, ResponseType};
use stopnik_core::pkce::{self, PkceMethod};
use stopnik_core::token::{Grant, TokenResponse};

use super::{Rejection, issuer, methods};
use crate::server::AppState;
use crate::validation;

pub fn router() -> Router<AppState> {
    Router::new().route("/token", methods(post(token)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenRequest {
    grant_type: String,
    code: String,
    code_verifier: String,
    redirect_uri: String,
    scope: String,
    username: String,
    password: String,
    refresh_token: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

fn invalid_grant(description: &str) -> Rejection {
    OAuthError::bad_request(ErrorCode::InvalidGrant)
        .with_description(description)
        .into()
}

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Result<Response, Rejection> {
    let authenticated = validation::validate_client_credentials(
        &state.config,
        &headers,
        request.client_id.as_deref(),
        request.client_secret.as_deref(),
    )
    .map_err(|invalid| {
        let status = if invalid.fallback {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::UNAUTHORIZED
        };
        OAuthError::new(status, ErrorCode::InvalidClient)
    })?;
    let client = authenticated.client;

    let Some(grant_type) = GrantType::parse(&request.grant_type) else {
        return Err(invalid_grant("Invalid grant_type parameter value"));
    };
    tracing::debug!(client_id = %client.id, grant_type = grant_type.as_str(), "token request");

    let issuer = issuer(&state, &headers);
    let response = match grant_type {
        GrantType::AuthorizationCode => authorization_code(&state, &issuer, client, &request)?,
        GrantType::Password => {
            let user = validation::validate_user_password(&state.config, &request.username, &request.password)
                .ok_or_else(|| invalid_grant("Invalid user credentials"))?;
            let scopes = oauth2::split_scopes(Some(&request.scope));
            state
                .tokens
                .create_access_token_response(&issuer, Grant::new(client, &user.username, &scopes))?
        }
        GrantType::ClientCredentials => {
            let scopes = oauth2::split_scopes(Some(&request.scope));
            // RFC 6749 section 4.4.3: no refresh token for client credentials.
            let grant = Grant::new(client, "", &scopes).without_refresh();
            state.tokens.create_access_token_response(&issuer, grant)?
        }
        GrantType::RefreshToken => refresh(&state, &issuer, client, &request)?,
        GrantType::Implicit => {
            return Err(OAuthError::bad_request(ErrorCode::UnsupportedGrantType).into());
        }
    };

    Ok((
        [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")],
        Json(response),
    )
        .into_response())
}

fn authorization_code(
    state: &AppState,
    issuer: &str,
    client: &Client,
    request: &TokenRequest,
) -> Result<TokenResponse, Rejection> {
    let Some(session) = state.sessions.auth.get(&request.code) else {
        state.tokens.revoke_by_authorization_code(&client.id, &request.code);
        return Err(invalid_grant("Invalid authorization code"));
    };

    // Checked before redeeming so another client cannot burn the code.
    if session.client_id != client.id
        || session.username.is_empty()
        || !session.response_types.contains(&ResponseType::Code)
    {
        tracing::warn!(client_id = %client.id, "authorization code not redeemable by client");
        return Err(invalid_grant("Invalid authorization code"));
    }
    if state.sessions.auth.redeem(&request.code).is_none() {
        return Err(invalid_grant("Invalid authorization code"));
    }
    if !request.redirect_uri.is_empty() && request.redirect_uri != session.redirect {
        return Err(invalid_grant("Redirect URI does not match the authorization request"));
    }

    if !request.code_verifier.is_empty() || session.code_challenge.is_some() {
        let method = session.code_challenge_method.unwrap_or(PkceMethod::Plain);
        let challenge = session.code_challenge.as_deref().unwrap_or_default();
        if !pkce::validate(method, challenge, &request.code_verifier) {
            tracing::debug!(client_id = %client.id, "PKCE verification failed");
            return Err(invalid_grant("Invalid code_verifier"));
        }
    }

    let grant = Grant::new(client, &session.username, &session.scopes)
        .nonce(&session.nonce)
        .auth_time(session.auth_time)
        .authorization_code(&session.id);
    Ok(state.tokens.create_access_token_response(issuer, grant)?)
}

fn refresh(
    state: &AppState,
    issuer: &str,
    client: &Client,
    request: &TokenRequest,
) -> Result<TokenResponse, Rejection> {
    if client.refresh_ttl == 0 {
        return Err(invalid_grant("Refresh tokens are disabled for client"));
    }
    let stored = state
        .tokens
        .refresh_token(&request.refresh_token)
        .filter(|token| token.client_id == client.id)
        .ok_or_else(|| invalid_grant("Invalid refresh token"))?;

    let mut grant = Grant::new(client, &stored.username, &stored.scopes).refresh_token(&stored.key);
    if let Some(code) = stored.authorization_code.as_deref() {
        grant = grant.authorization_code(code);
    }
    Ok(state.tokens.create_access_token_response(issuer, grant)?)
}

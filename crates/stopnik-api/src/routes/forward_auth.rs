//! Forward authentication for reverse proxies such as Traefik.
//!
//! The proxy asks this endpoint about every request, passing the original
//! request in `X-Forwarded-Proto`, `X-Forwarded-Host` and `X-Forwarded-Uri`.
//! A browser without a forward cookie is sent through `/authorize` as the
//! forward-auth client, with PKCE, and comes back to the original URI carrying
//! `code`, `state` and the forward session id. The next check exchanges those
//! for a forward cookie.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::CookieJar;
use url::Url;

use stopnik_core::error::{Error, Result};
use stopnik_core::oauth2::{self, ResponseType};
use stopnik_core::pkce::{self, PkceMethod};
use stopnik_core::session::{AuthSession, ForwardSession, new_session_id};

use super::{X_FORWARDED_HOST, X_FORWARDED_PROTO, header_value, methods};
use crate::cookie;
use crate::server::AppState;

const X_FORWARDED_URI: &str = "x-forwarded-uri";

/// Scope requested on behalf of the proxy.
pub const FORWARD_AUTH_SCOPE: &str = "forward:auth";

pub fn router(endpoint: &str) -> Router<AppState> {
    Router::new().route(endpoint, methods(get(forward_auth)))
}

/// Parameters the authorization redirect appended to the original URI.
#[derive(Debug, Default)]
struct Callback {
    code: String,
    state: String,
    forward_id: String,
}

impl Callback {
    fn from_uri(uri: &Url, parameter_name: &str) -> Self {
        let mut callback = Self::default();
        for (key, value) in uri.query_pairs() {
            if key == oauth2::PARAM_CODE {
                callback.code = value.into_owned();
            } else if key == oauth2::PARAM_STATE {
                callback.state = value.into_owned();
            } else if key == parameter_name {
                callback.forward_id = value.into_owned();
            }
        }
        callback
    }

    fn is_empty(&self) -> bool {
        self.code.is_empty() && self.state.is_empty() && self.forward_id.is_empty()
    }

    fn is_complete(&self) -> bool {
        !self.code.is_empty() && !self.state.is_empty() && !self.forward_id.is_empty()
    }
}

fn internal(e: url::ParseError) -> Error {
    Error::Internal(e.into())
}

async fn forward_auth(State(state): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Result<Response> {
    let Some(client) = state.config.forward_auth_client() else {
        return Err(Error::BadRequest("no forward auth client".to_string()));
    };

    let (Some(proto), Some(host), Some(path)) = (
        header_value(&headers, X_FORWARDED_PROTO),
        header_value(&headers, X_FORWARDED_HOST),
        header_value(&headers, X_FORWARDED_URI),
    ) else {
        return Err(Error::BadRequest("missing forwarded request headers".to_string()));
    };
    let forwarded = format!("{proto}://{host}{path}");
    let forward_uri = Url::parse(&forwarded).map_err(internal)?;

    let parameter_name = &state.config.server.forward_auth.parameter_name;
    let callback = Callback::from_uri(&forward_uri, parameter_name);
    let logged_in = cookie::validate_forward_auth_cookie(&state, &jar).is_some();

    if logged_in && callback.is_empty() {
        return Ok(StatusCode::OK.into_response());
    }
    if callback.is_complete() {
        let Some((auth, forward)) = validate_callback(&state, &callback) else {
            return Err(Error::BadRequest("invalid forward auth callback".to_string()));
        };
        if logged_in {
            return Ok(Redirect::temporary(&forward.redirect).into_response());
        }
        let login = state.sessions.login.start(&auth.username);
        let jar = jar.add(cookie::forward_auth_cookie(&state, &login)?);
        tracing::info!(username = %auth.username, "forward auth login");
        return Ok((jar, Redirect::temporary(&forward.redirect)).into_response());
    }

    let forward_id = new_session_id();
    let session_state = new_session_id();
    let verifier = pkce::generate_verifier();
    let challenge = pkce::derive(PkceMethod::S256, &verifier);

    let mut redirect_uri = forward_uri.clone();
    redirect_uri.query_pairs_mut().append_pair(parameter_name, &forward_id);

    let external_url = state.config.server.forward_auth.external_url.as_deref().unwrap_or_default();
    let mut authorize = Url::parse(external_url).map_err(internal)?;
    let path = format!("{}/authorize", authorize.path().trim_end_matches('/'));
    authorize.set_path(&path);
    authorize
        .query_pairs_mut()
        .append_pair(oauth2::PARAM_RESPONSE_TYPE, ResponseType::Code.as_str())
        .append_pair(oauth2::PARAM_CLIENT_ID, &client.id)
        .append_pair(oauth2::PARAM_STATE, &session_state)
        .append_pair(oauth2::PARAM_SCOPE, FORWARD_AUTH_SCOPE)
        .append_pair(oauth2::PARAM_REDIRECT_URI, redirect_uri.as_str())
        .append_pair(pkce::PARAM_CODE_CHALLENGE_METHOD, PkceMethod::S256.as_str())
        .append_pair(pkce::PARAM_CODE_CHALLENGE, &challenge);

    state.sessions.forward.start(ForwardSession {
        id: forward_id,
        code_verifier: verifier,
        redirect: forwarded,
        state: session_state,
    });
    tracing::debug!(redirect = %redirect_uri, "forward auth redirect to authorize");
    Ok(Redirect::temporary(authorize.as_str()).into_response())
}

/// The authorization session behind `code` must have been started by this
/// forward session: same state and a challenge matching its verifier.
fn validate_callback(state: &AppState, callback: &Callback) -> Option<(AuthSession, ForwardSession)> {
    let auth = state.sessions.auth.get(&callback.code)?;
    let forward = state.sessions.forward.get(&callback.forward_id)?;
    if forward.state != callback.state || auth.username.is_empty() {
        return None;
    }
    let method = auth.code_challenge_method?;
    let challenge = auth.code_challenge.as_deref()?;
    pkce::validate(method, challenge, &forward.code_verifier).then_some((auth, forward))
}

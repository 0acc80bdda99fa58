//! `/account` login and logout pages, and `/logout`.

use axum::extract::{OriginalUri, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use stopnik_core::error::Error;
use stopnik_core::session::new_session_id;

use super::methods;
use crate::cookie;
use crate::pages;
use crate::server::AppState;
use crate::validation::{self, LoginForm};

const ACCOUNT_PATH: &str = "/account";

pub fn router() -> Router<AppState> {
    Router::new()
        .route(ACCOUNT_PATH, methods(get(account).post(account_login)))
        .route("/logout", methods(post(logout)))
}

fn see_other(location: &str) -> (StatusCode, [(header::HeaderName, String); 1]) {
    (StatusCode::SEE_OTHER, [(header::LOCATION, location.to_string())])
}

async fn account(State(state): State<AppState>, jar: CookieJar) -> Result<Response, Error> {
    if let Some(login) = cookie::validate_auth_cookie(&state, &jar) {
        return Ok(pages::logout(&state.config.ui, &login.user.username, ACCOUNT_PATH).into_response());
    }
    // not bound to an authorization request
    let login_token = validation::new_login_token(&state.keys, &new_session_id())?;
    let (jar, message) = cookie::take_message(&state, jar);
    let page = pages::login(&state.config.ui, ACCOUNT_PATH, &login_token, message.as_deref());
    Ok((jar, page).into_response())
}

async fn account_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, Error> {
    let login = match validation::validate_form_login(&state.config, &state.keys, &form) {
        Ok(login) => login,
        Err(message) => {
            let jar = jar.add(cookie::message_cookie(&state, &message));
            return Ok((jar, see_other(ACCOUNT_PATH)).into_response());
        }
    };
    let session = state.sessions.login.start(&login.user.username);
    let jar = jar.add(cookie::auth_cookie(&state, &session)?);
    tracing::info!(username = %login.user.username, "account login");
    Ok((jar, see_other(ACCOUNT_PATH)).into_response())
}

/// Same-origin paths and redirects registered by some client.
fn allowed_logout_redirect(state: &AppState, location: &str) -> bool {
    if let Some(path) = location.strip_prefix('/') {
        return !path.starts_with('/') && !path.starts_with('\\');
    }
    state
        .config
        .clients
        .iter()
        .chain(state.config.forward_auth_client())
        .any(|client| client.matches_redirect(location))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogoutForm {
    stopnik_logout_redirect: String,
    stopnik_logout_all: String,
}

async fn logout(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    Form(form): Form<LogoutForm>,
) -> Result<Response, Error> {
    let login = cookie::validate_auth_cookie(&state, &jar).ok_or(Error::Forbidden)?;
    let closed = state
        .sessions
        .login
        .close(&login.session.id, !form.stopnik_logout_all.is_empty());
    tracing::info!(username = %login.user.username, closed, "logout");

    let jar = cookie::remove_auth_cookie(&state, jar);
    let requested = Some(form.stopnik_logout_redirect)
        .filter(|r| !r.is_empty())
        .filter(|r| {
            let allowed = allowed_logout_redirect(&state, r);
            if !allowed {
                tracing::warn!(redirect = %r, "ignoring unregistered logout redirect");
            }
            allowed
        });
    let location = if let Some(redirect) = requested {
        redirect
    } else if let Some(redirect) = state.config.server.logout_redirect.clone().filter(|r| !r.is_empty()) {
        redirect
    } else {
        uri.to_string()
    };
    Ok((jar, see_other(&location)).into_response())
}

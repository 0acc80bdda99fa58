//! `/authorize`: validates the request, shows the login form when needed and
//! redirects back to the client with a code, tokens or an error.

use axum::extract::{OriginalUri, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use url::Url;

use stopnik_core::config::Client;
use stopnik_core::error::Error;
use stopnik_core::oauth2::{
    self, ErrorCode, PARAM_ACCESS_TOKEN, PARAM_CODE, PARAM_ERROR, PARAM_ERROR_DESCRIPTION,
    PARAM_EXPIRES_IN, PARAM_ID_TOKEN, PARAM_STATE, PARAM_TOKEN_TYPE, ResponseMode, ResponseType,
};
use stopnik_core::oidc::{self, Prompt};
use stopnik_core::pkce::PkceMethod;
use stopnik_core::session::{AuthSession, LoginSession, new_session_id};
use stopnik_core::token::Grant;

use super::{issuer, methods};
use crate::cookie::{self, CookieLogin};
use crate::pages;
use crate::server::AppState;
use crate::validation::{self, LoginForm};

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/authorize",
        methods(get(authorize_get).post(authorize_post)),
    )
}

/// Authorization request parameters, from the query or a form body.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub response_mode: String,
    pub scope: String,
    pub state: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub nonce: String,
    pub prompt: String,
    pub max_age: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizePost {
    #[serde(flatten)]
    login: LoginForm,
    #[serde(flatten)]
    params: AuthorizeParams,
}

/// The validated client redirect URI responses are delivered to.
struct RedirectTarget {
    uri: Url,
    mode: ResponseMode,
    state: String,
}

impl RedirectTarget {
    fn send(&self, mut params: Vec<(&'static str, String)>) -> Response {
        if !self.state.is_empty() {
            params.push((PARAM_STATE, self.state.clone()));
        }
        let mut uri = self.uri.clone();
        match self.mode {
            ResponseMode::Query => {
                uri.query_pairs_mut().extend_pairs(&params);
            }
            ResponseMode::Fragment => {
                let fragment = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&params)
                    .finish();
                uri.set_fragment(Some(&fragment));
            }
        }
        (StatusCode::FOUND, [(header::LOCATION, uri.to_string())]).into_response()
    }

    fn error(&self, code: ErrorCode, description: Option<&str>) -> Response {
        tracing::debug!(error = %code, description, "authorization request rejected");
        let mut params = vec![(PARAM_ERROR, code.as_str().to_string())];
        if let Some(description) = description {
            params.push((PARAM_ERROR_DESCRIPTION, description.to_string()));
        }
        self.send(params)
    }
}

async fn authorize_get(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    jar: CookieJar,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    authorize(&state, &uri.to_string(), &headers, jar, params)
}

/// A POST carrying a login token is a submitted login form; any other POST
/// is an authorization request in form encoding.
async fn authorize_post(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    jar: CookieJar,
    Form(form): Form<AuthorizePost>,
) -> Response {
    let request_uri = uri.to_string();
    if form.login.login_token.is_empty() {
        return authorize(&state, &request_uri, &headers, jar, form.params);
    }
    login(&state, &request_uri, &headers, jar, &form.login)
}

fn error_page(state: &AppState, message: &str) -> Response {
    pages::error(&state.config.ui, StatusCode::BAD_REQUEST, message)
}

fn invalid_request(target: &RedirectTarget, description: &str) -> Response {
    target.error(ErrorCode::InvalidRequest, Some(description))
}

fn authorize(
    state: &AppState,
    request_uri: &str,
    headers: &HeaderMap,
    jar: CookieJar,
    params: AuthorizeParams,
) -> Response {
    let Some(client) = state.config.client(&params.client_id) else {
        tracing::warn!(client_id = %params.client_id, "authorize with unknown client");
        return error_page(state, "Invalid client");
    };

    if params.redirect_uri.is_empty() {
        return error_page(state, "No redirect provided");
    }
    let Ok(redirect_uri) = Url::parse(&params.redirect_uri) else {
        return error_page(state, "Invalid redirect");
    };
    if !client.matches_redirect(&params.redirect_uri) {
        tracing::warn!(client_id = %client.id, redirect = %params.redirect_uri, "redirect not registered");
        return error_page(state, &format!("Invalid redirect: {}", params.redirect_uri));
    }

    let mut target = RedirectTarget {
        uri: redirect_uri,
        mode: ResponseMode::Query,
        state: params.state.clone(),
    };
    if !params.response_mode.is_empty() {
        match ResponseMode::parse(&params.response_mode) {
            Some(mode) => target.mode = mode,
            None => return invalid_request(&target, "Invalid response_mode parameter value"),
        }
    }

    let Some(response_types) = oauth2::parse_response_types(&params.response_type) else {
        return invalid_request(&target, "Invalid response_type parameter value");
    };

    let (code_challenge, code_challenge_method) = if params.code_challenge.is_empty() {
        (None, None)
    } else if !response_types.contains(&ResponseType::Code) {
        return invalid_request(&target, "Code challenge should only be used for response type code");
    } else {
        let method = if params.code_challenge_method.is_empty() {
            Some(PkceMethod::Plain)
        } else {
            PkceMethod::parse(&params.code_challenge_method)
        };
        match method {
            Some(method) => (Some(params.code_challenge.clone()), Some(method)),
            None => return invalid_request(&target, "Invalid code_challenge_method parameter value"),
        }
    };

    let scopes = oauth2::split_scopes(Some(&params.scope));
    let openid_request = client.oidc && oidc::has_openid(&scopes);

    if response_types.contains(&ResponseType::IdToken) && !openid_request {
        return target.error(
            ErrorCode::UnsupportedResponseType,
            Some("ID tokens require an OpenID Connect client and the openid scope"),
        );
    }

    if !params.nonce.is_empty() && !openid_request {
        return invalid_request(&target, "Nonce used without OpenID Connect");
    }

    let prompt = if params.prompt.is_empty() {
        None
    } else if !openid_request {
        return invalid_request(&target, "Prompt used without OpenID Connect");
    } else {
        match Prompt::parse(&params.prompt) {
            Some(prompt) => Some(prompt),
            None => return invalid_request(&target, "Invalid prompt parameter value"),
        }
    };

    let max_age = if params.max_age.is_empty() {
        None
    } else if !openid_request {
        return invalid_request(&target, "Max age used without OpenID Connect");
    } else {
        match params.max_age.parse::<u32>() {
            Ok(max_age) => Some(i64::from(max_age)),
            Err(_) => return invalid_request(&target, "Invalid max_age parameter value"),
        }
    };

    let mut session = AuthSession {
        id: new_session_id(),
        client_id: client.id.clone(),
        redirect: params.redirect_uri.clone(),
        auth_uri: request_uri.to_string(),
        code_challenge,
        code_challenge_method,
        response_types,
        response_mode: target.mode,
        scopes,
        state: params.state.clone(),
        nonce: params.nonce.clone(),
        username: String::new(),
        auth_time: None,
        created_at: Utc::now(),
    };

    let login = cookie::validate_auth_cookie(state, &jar)
        .filter(|login| !force_login(&login.session, prompt, max_age, Utc::now()));

    match login {
        Some(CookieLogin { user, session: login }) => {
            session.username = user.username.clone();
            session.auth_time = Some(login.auth_time);
            issue(state, headers, client, &target, session)
        }
        None if prompt == Some(Prompt::None) => target.error(
            ErrorCode::LoginRequired,
            Some("Requested to skip login for unauthenticated user"),
        ),
        None => {
            let login_id = session.id.clone();
            state.sessions.auth.start(session);
            login_page(state, request_uri, jar, &login_id)
        }
    }
}

/// Whether an existing login must be repeated before issuing.
fn force_login(
    login: &LoginSession,
    prompt: Option<Prompt>,
    max_age: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    if prompt == Some(Prompt::Login) {
        return true;
    }
    match max_age {
        Some(0) => true,
        Some(seconds) => now > login.auth_time + Duration::seconds(seconds),
        None => false,
    }
}

fn login_page(state: &AppState, action: &str, jar: CookieJar, auth_session_id: &str) -> Response {
    let login_token = match validation::new_login_token(&state.keys, auth_session_id) {
        Ok(token) => token,
        Err(e) => return e.into_response(),
    };
    let (jar, message) = cookie::take_message(state, jar);
    let page = pages::login(&state.config.ui, action, &login_token, message.as_deref());
    (jar, page).into_response()
}

/// Redirect with a code, implicit tokens or an ID token for a logged-in user.
///
/// `token` wins over `code`; a request for neither yields an ID token, and
/// only to an OpenID Connect client that asked for `openid`.
fn issue(
    state: &AppState,
    headers: &HeaderMap,
    client: &Client,
    target: &RedirectTarget,
    session: AuthSession,
) -> Response {
    let types = &session.response_types;
    let grant = Grant::new(client, &session.username, &session.scopes)
        .nonce(&session.nonce)
        .auth_time(session.auth_time);

    if types.contains(&ResponseType::Token) {
        let issuer = issuer(state, headers);
        // RFC 6749 section 4.2.2: no refresh token for implicit grants.
        let response = match state
            .tokens
            .create_access_token_response(&issuer, grant.without_refresh())
        {
            Ok(response) => response,
            Err(e) => return e.into_response(),
        };
        let mut params = vec![
            (PARAM_ACCESS_TOKEN, response.access_token),
            (PARAM_TOKEN_TYPE, response.token_type.to_string()),
            (PARAM_EXPIRES_IN, response.expires_in.to_string()),
        ];
        if types.contains(&ResponseType::IdToken) {
            if let Some(id_token) = response.id_token {
                params.push((PARAM_ID_TOKEN, id_token));
            }
        }
        tracing::debug!(client_id = %client.id, "implicit grant issued");
        target.send(params)
    } else if types.contains(&ResponseType::Code) {
        let code = session.id.clone();
        state.sessions.auth.start(session);
        tracing::debug!(client_id = %client.id, "authorization code issued");
        target.send(vec![(PARAM_CODE, code)])
    } else if types.contains(&ResponseType::IdToken) && grant.wants_id_token() {
        let issuer = issuer(state, headers);
        match state.tokens.create_id_token(&issuer, grant, None) {
            Ok(id_token) => target.send(vec![(PARAM_ID_TOKEN, id_token)]),
            Err(e) => e.into_response(),
        }
    } else {
        target.error(ErrorCode::UnsupportedResponseType, None)
    }
}

/// Post/Redirect/Get back to the form, optionally with a flash message.
fn retry(state: &AppState, request_uri: &str, jar: CookieJar, message: Option<&str>) -> Response {
    let jar = match message {
        Some(message) => jar.add(cookie::message_cookie(state, message)),
        None => jar,
    };
    (
        jar,
        (StatusCode::SEE_OTHER, [(header::LOCATION, request_uri.to_string())]),
    )
        .into_response()
}

fn login(
    state: &AppState,
    request_uri: &str,
    headers: &HeaderMap,
    jar: CookieJar,
    form: &LoginForm,
) -> Response {
    let login = match validation::validate_form_login(&state.config, &state.keys, form) {
        Ok(login) => login,
        Err(message) => return retry(state, request_uri, jar, Some(message.as_str())),
    };

    let login_session = state.sessions.login.start(&login.user.username);
    let auth_cookie = match cookie::auth_cookie(state, &login_session) {
        Ok(cookie) => cookie,
        Err(e) => return e.into_response(),
    };
    let jar = jar.add(auth_cookie);

    let Some(mut session) = state.sessions.auth.redeem(&login.auth_session_id) else {
        tracing::debug!("login for an expired authorization request");
        let message = state.config.ui.expired_login_message.clone();
        return retry(state, request_uri, jar, Some(message.as_str()));
    };
    session.username = login.user.username.clone();
    session.auth_time = Some(login_session.auth_time);

    let Some(client) = state.config.client(&session.client_id) else {
        return (jar, error_page(state, "Invalid client")).into_response();
    };
    let target = match Url::parse(&session.redirect) {
        Ok(uri) => RedirectTarget {
            uri,
            mode: session.response_mode,
            state: session.state.clone(),
        },
        Err(e) => {
            let error = Error::Internal(anyhow::anyhow!("stored redirect unparsable: {e}"));
            return (jar, error.into_response()).into_response();
        }
    };

    (jar, issue(state, headers, client, &target, session)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_at(auth_time: DateTime<Utc>) -> LoginSession {
        LoginSession {
            id: "l".to_string(),
            username: "foo".to_string(),
            auth_time,
        }
    }

    #[test]
    fn prompt_login_and_max_age_force_login() {
        let now = Utc::now();
        let login = login_at(now - Duration::seconds(30));

        assert!(!force_login(&login, None, None, now));
        assert!(!force_login(&login, Some(Prompt::Consent), None, now));
        assert!(force_login(&login, Some(Prompt::Login), None, now));
        assert!(force_login(&login, None, Some(0), now));
        assert!(force_login(&login, None, Some(10), now));
        assert!(!force_login(&login, None, Some(60), now));
    }

    #[test]
    fn responses_go_to_query_or_fragment() {
        let mut target = RedirectTarget {
            uri: Url::parse("https://example.com/callback?x=1").unwrap(),
            mode: ResponseMode::Query,
            state: "abc".to_string(),
        };
        let response = target.send(vec![(PARAM_CODE, "c0de".to_string())]);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.com/callback?x=1&code=c0de&state=abc"
        );

        target.mode = ResponseMode::Fragment;
        target.state = String::new();
        let response = target.error(ErrorCode::LoginRequired, None);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.com/callback?x=1#error=login_required"
        );
    }
}

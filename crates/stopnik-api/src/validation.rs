//! Client and user credential checks, and the signed login token carried by
//! the login form.

use axum::http::{HeaderMap, header};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use stopnik_core::config::{Client, Config, User};
use stopnik_core::crypto;
use stopnik_core::error::Result;
use stopnik_core::keys::KeyRegistry;

pub const FORM_USERNAME: &str = "stopnik_username";
pub const FORM_PASSWORD: &str = "stopnik_password";
pub const FORM_AUTH_SESSION: &str = "stopnik_auth_session";
pub const FORM_LOGOUT_REDIRECT: &str = "stopnik_logout_redirect";
pub const FORM_LOGOUT_ALL: &str = "stopnik_logout_all";

const LOGIN_TOKEN_TTL: Duration = Duration::minutes(5);
/// `typ` of login tokens, which share the server key with other tokens.
const LOGIN_TOKEN_TYPE: &str = "stopnik/login";

/// A client that presented valid credentials.
#[derive(Debug)]
pub struct AuthenticatedClient<'a> {
    pub client: &'a Client,
    /// Credentials came from the form body instead of HTTP Basic.
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidClient {
    pub fallback: bool,
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

/// Authenticate a client, trying HTTP Basic first and the form body second.
///
/// Public clients authenticate by presenting no secret at all. Form body
/// credentials of confidential clients are only accepted when the client
/// allows the password fallback.
pub fn validate_client_credentials<'a>(
    config: &'a Config,
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> std::result::Result<AuthenticatedClient<'a>, InvalidClient> {
    let (client_id, secret, fallback) = match basic_credentials(headers) {
        Some((id, secret)) => (id, secret, false),
        None => {
            let id = form_client_id.unwrap_or_default().to_string();
            let fallback = !id.is_empty();
            if fallback {
                tracing::warn!(client_id = %id, "missing HTTP Basic authentication, using form credentials");
            }
            (id, form_client_secret.unwrap_or_default().to_string(), fallback)
        }
    };
    let invalid = InvalidClient { fallback };

    if client_id.is_empty() {
        return Err(invalid);
    }
    let client = config.client(&client_id).ok_or(invalid)?;

    if client.is_public() {
        return if secret.is_empty() {
            Ok(AuthenticatedClient { client, fallback })
        } else {
            Err(invalid)
        };
    }

    if fallback && !client.password_fallback_allowed {
        tracing::warn!(client_id = %client.id, "form credentials denied for client");
        return Err(invalid);
    }

    if !crypto::verify_salted(&secret, &client.salt, &client.client_secret) {
        tracing::debug!(client_id = %client.id, "invalid client secret");
        return Err(invalid);
    }

    Ok(AuthenticatedClient { client, fallback })
}

pub fn validate_user_password<'a>(config: &'a Config, username: &str, password: &str) -> Option<&'a User> {
    let user = config.user(username)?;
    crypto::verify_salted(password, &user.salt, &user.password).then_some(user)
}

/// Fields posted by the login form.
#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default, rename = "stopnik_username")]
    pub username: String,
    #[serde(default, rename = "stopnik_password")]
    pub password: String,
    #[serde(default, rename = "stopnik_auth_session")]
    pub login_token: String,
}

/// A successful form login and the auth session its login token names.
#[derive(Debug)]
pub struct FormLogin<'a> {
    pub user: &'a User,
    pub auth_session_id: String,
}

/// Check a posted login form. The error is the message to show to the user.
pub fn validate_form_login<'a>(
    config: &'a Config,
    keys: &KeyRegistry,
    form: &LoginForm,
) -> std::result::Result<FormLogin<'a>, String> {
    if form.username.is_empty() || form.password.is_empty() || form.login_token.is_empty() {
        return Err(config.ui.invalid_credentials_message.clone());
    }
    let Some(auth_session_id) = login_token_subject(keys, &form.login_token) else {
        return Err(config.ui.expired_login_message.clone());
    };
    match validate_user_password(config, &form.username, &form.password) {
        Some(user) => Ok(FormLogin { user, auth_session_id }),
        None => {
            tracing::debug!(username = %form.username, "invalid user credentials");
            Err(config.ui.invalid_credentials_message.clone())
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginTokenClaims {
    typ: String,
    jti: String,
    sub: String,
    iat: i64,
    exp: i64,
}

/// Short-lived token binding a rendered login form to an auth session.
pub fn new_login_token(keys: &KeyRegistry, auth_session_id: &str) -> Result<String> {
    let now = Utc::now();
    let claims = LoginTokenClaims {
        typ: LOGIN_TOKEN_TYPE.to_string(),
        jti: uuid::Uuid::new_v4().to_string(),
        sub: auth_session_id.to_string(),
        iat: now.timestamp(),
        exp: (now + LOGIN_TOKEN_TTL).timestamp(),
    };
    keys.server_key().sign(&claims)
}

/// Auth session id of a valid, unexpired login token.
pub fn login_token_subject(keys: &KeyRegistry, token: &str) -> Option<String> {
    keys.server_key()
        .verify::<LoginTokenClaims>(token)
        .ok()
        .filter(|claims| claims.typ == LOGIN_TOKEN_TYPE)
        .map(|claims| claims.sub)
}

//! Auth, forward-auth and flash message cookies.
//!
//! The auth cookie is an HS256 JWT carrying the username and the id of the
//! login session it belongs to. It is only valid while that session lives.

use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use stopnik_core::config::User;
use stopnik_core::error::Result;
use stopnik_core::session::LoginSession;

use crate::server::AppState;

/// Lifetime of a flash message.
pub const MESSAGE_MAX_AGE_SECS: i64 = 5;

#[derive(Debug, Serialize, Deserialize)]
struct LoginCookieClaims {
    sub: String,
    login: String,
    iat: i64,
    exp: i64,
}

/// A browser logged in through a cookie.
#[derive(Debug)]
pub struct CookieLogin<'a> {
    pub user: &'a User,
    pub session: LoginSession,
}

fn build_cookie(name: &str, value: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_string(), value);
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie
}

/// Empty cookie with `Max-Age=-1`, telling the browser to drop it.
fn removal(name: &str) -> Cookie<'static> {
    let mut cookie = build_cookie(name, String::new());
    cookie.set_max_age(cookie::time::Duration::seconds(-1));
    cookie
}

fn login_cookie(state: &AppState, name: &str, login: &LoginSession) -> Result<Cookie<'static>> {
    let timeout = state.config.server.session_timeout_seconds as i64;
    let now = Utc::now().timestamp();
    let claims = LoginCookieClaims {
        sub: login.username.clone(),
        login: login.id.clone(),
        iat: now,
        exp: now + timeout,
    };
    let value = state.keys.server_key().sign(&claims)?;

    let mut cookie = build_cookie(name, value);
    cookie.set_max_age(cookie::time::Duration::seconds(timeout));
    Ok(cookie)
}

fn validate_login_cookie<'a>(state: &'a AppState, jar: &CookieJar, name: &str) -> Option<CookieLogin<'a>> {
    let value = jar.get(name)?.value();
    let claims: LoginCookieClaims = match state.keys.server_key().verify(value) {
        Ok(claims) => claims,
        Err(_) => {
            tracing::debug!(cookie = name, "rejected login cookie");
            return None;
        }
    };
    let session = state.sessions.login.get(&claims.login)?;
    let user = state.config.user(&claims.sub)?;
    Some(CookieLogin { user, session })
}

pub fn auth_cookie(state: &AppState, login: &LoginSession) -> Result<Cookie<'static>> {
    login_cookie(state, &state.config.server.cookies.auth_name, login)
}

pub fn validate_auth_cookie<'a>(state: &'a AppState, jar: &CookieJar) -> Option<CookieLogin<'a>> {
    validate_login_cookie(state, jar, &state.config.server.cookies.auth_name)
}

pub fn remove_auth_cookie(state: &AppState, jar: CookieJar) -> CookieJar {
    jar.add(removal(&state.config.server.cookies.auth_name))
}

/// Cookie proving a successful forward-auth round trip.
pub fn forward_auth_cookie(state: &AppState, login: &LoginSession) -> Result<Cookie<'static>> {
    login_cookie(state, &state.config.server.cookies.forward_auth_name, login)
}

pub fn validate_forward_auth_cookie<'a>(state: &'a AppState, jar: &CookieJar) -> Option<CookieLogin<'a>> {
    validate_login_cookie(state, jar, &state.config.server.cookies.forward_auth_name)
}

/// Unsigned flash message shown on the next rendered form.
pub fn message_cookie(state: &AppState, message: &str) -> Cookie<'static> {
    tracing::debug!(message, "creating message cookie");
    let mut cookie = build_cookie(&state.config.server.cookies.message_name, message.to_string());
    cookie.set_max_age(cookie::time::Duration::seconds(MESSAGE_MAX_AGE_SECS));
    cookie
}

/// Read the flash message, clearing it when present.
pub fn take_message(state: &AppState, jar: CookieJar) -> (CookieJar, Option<String>) {
    let name = &state.config.server.cookies.message_name;
    let message = jar
        .get(name)
        .map(|c| c.value().to_string())
        .filter(|m| !m.is_empty());
    match message {
        Some(message) => (jar.add(removal(name)), Some(message)),
        None => (jar, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, header};
    use stopnik_core::config::Config;
    use stopnik_core::keys::KeyRegistry;

    const BAR: &str = "d82c4eb5261cb9c8aa9855edd67d1bd10482f41529858d925094d173fa662aa91ff39bc5b188615273484021dfb16fd8284cf684ccf0fc795be3aa2fc1e6c181";
    const FOO: &str = "f7fbba6e0636f890e56fbbf3283e524c6fa3204ae298382d624741d0dc6638326e282c41be5e4254d8820772c5518a2c5a8c0c7f7eda19594a7eb539453e1ed7";

    fn state() -> AppState {
        let toml = format!(
            r#"
[server]
addr = ":0"
secret = "s3cr3t"

[[clients]]
id = "foo"
client_secret = "{BAR}"
redirects = ["https://example.com/callback"]

[[users]]
username = "foo"
password = "{FOO}"
"#
        );
        let config = Config::from_toml(&toml).unwrap();
        let keys = KeyRegistry::load(&config).unwrap();
        AppState::new(config, keys)
    }

    fn jar_with(cookie: &Cookie<'_>) -> CookieJar {
        let mut headers = HeaderMap::new();
        let value = format!("{}={}", cookie.name(), cookie.value());
        headers.insert(header::COOKIE, HeaderValue::from_str(&value).unwrap());
        CookieJar::from_headers(&headers)
    }

    #[test]
    fn auth_cookie_follows_login_session() {
        let state = state();
        let login = state.sessions.login.start("foo");
        let cookie = auth_cookie(&state, &login).unwrap();
        assert_eq!(cookie.name(), "stopnik_auth");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::seconds(3600)));

        let jar = jar_with(&cookie);
        let found = validate_auth_cookie(&state, &jar).unwrap();
        assert_eq!(found.user.username, "foo");
        assert_eq!(found.session.id, login.id);

        state.sessions.login.close(&login.id, false);
        assert!(validate_auth_cookie(&state, &jar).is_none());
    }

    #[test]
    fn removal_cookie_expires_immediately() {
        let state = state();
        let login = state.sessions.login.start("foo");
        let jar = jar_with(&auth_cookie(&state, &login).unwrap());

        let jar = remove_auth_cookie(&state, jar);
        let removed = jar.get("stopnik_auth").unwrap();
        assert_eq!(removed.value(), "");
        assert_eq!(removed.path(), Some("/"));
        assert_eq!(removed.max_age(), Some(cookie::time::Duration::seconds(-1)));
        assert!(removed.to_string().contains("Max-Age=-1"));
        assert!(validate_auth_cookie(&state, &jar).is_none());
    }

    #[test]
    fn forged_or_foreign_cookies_are_rejected() {
        let state = state();
        let login = state.sessions.login.start("foo");
        let cookie = auth_cookie(&state, &login).unwrap();

        let forged = Cookie::new("stopnik_auth", format!("{}x", cookie.value()));
        assert!(validate_auth_cookie(&state, &jar_with(&forged)).is_none());

        // an auth cookie is no forward-auth cookie
        assert!(validate_forward_auth_cookie(&state, &jar_with(&cookie)).is_none());
    }

    #[test]
    fn message_is_taken_once() {
        let state = state();
        let cookie = message_cookie(&state, "Invalid credentials");
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::seconds(5)));

        let (jar, message) = take_message(&state, jar_with(&cookie));
        assert_eq!(message.as_deref(), Some("Invalid credentials"));
        let cleared = jar.get("stopnik_message").unwrap();
        assert_eq!(cleared.value(), "");

        let (_, message) = take_message(&state, CookieJar::new());
        assert!(message.is_none());
    }
}

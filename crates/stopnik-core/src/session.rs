//! The three session stores: pending authorization requests, logged-in
//! browsers and forward-auth round trips.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::oauth2::{ResponseMode, ResponseType};
use crate::pkce::PkceMethod;
use crate::store::{Clock, ExpiringStore, SWEEP_INTERVAL, system_clock};

/// Lifetime of an authorization request, and of the code minted from it.
pub const AUTH_SESSION_TTL: Duration = Duration::minutes(5);
/// Lifetime of a forward-auth round trip.
pub const FORWARD_SESSION_TTL: Duration = Duration::minutes(5);

/// Random 128-bit identifier.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A validated `/authorize` request waiting for a login or a code exchange.
/// Its id doubles as the authorization code.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub client_id: String,
    pub redirect: String,
    /// Original `/authorize` request URI, used to come back after login.
    pub auth_uri: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<PkceMethod>,
    pub response_types: Vec<ResponseType>,
    pub response_mode: ResponseMode,
    pub scopes: Vec<String>,
    pub state: String,
    pub nonce: String,
    /// Set once the user has logged in.
    pub username: String,
    pub auth_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoginSession {
    pub id: String,
    pub username: String,
    pub auth_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ForwardSession {
    pub id: String,
    pub code_verifier: String,
    /// Original URI the proxy asked about.
    pub redirect: String,
    pub state: String,
}

pub struct AuthSessions {
    store: Arc<ExpiringStore<AuthSession>>,
}

impl AuthSessions {
    pub fn new(clock: Clock) -> Self {
        Self {
            store: Arc::new(ExpiringStore::with_clock("auth_sessions", AUTH_SESSION_TTL, clock)),
        }
    }

    /// Store or replace a session under its id.
    pub fn start(&self, session: AuthSession) {
        self.store.set(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<AuthSession> {
        self.store.get(id)
    }

    /// Remove and return the session; a code redeems at most once.
    pub fn redeem(&self, id: &str) -> Option<AuthSession> {
        let session = self.store.get(id)?;
        self.store.delete(id);
        Some(session)
    }
}

pub struct LoginSessions {
    store: Arc<ExpiringStore<LoginSession>>,
    clock: Clock,
}

impl LoginSessions {
    pub fn new(timeout: Duration, clock: Clock) -> Self {
        Self {
            store: Arc::new(ExpiringStore::with_clock("login_sessions", timeout, Arc::clone(&clock))),
            clock,
        }
    }

    pub fn start(&self, username: &str) -> LoginSession {
        let session = LoginSession {
            id: new_session_id(),
            username: username.to_string(),
            auth_time: (self.clock)(),
        };
        self.store.set(session.id.clone(), session.clone());
        tracing::debug!(username, "login session started");
        session
    }

    pub fn get(&self, id: &str) -> Option<LoginSession> {
        self.store.get(id)
    }

    pub fn search(&self, username: &str) -> Vec<LoginSession> {
        self.store.search(|s| s.username == username)
    }

    /// Close a session. With `cascade`, every other session of the same user
    /// is closed as well. Returns the number of sessions removed.
    pub fn close(&self, id: &str, cascade: bool) -> usize {
        let Some(session) = self.store.delete(id) else {
            return 0;
        };
        let mut closed = 1;
        if cascade {
            for other in self.search(&session.username) {
                if self.store.delete(&other.id).is_some() {
                    closed += 1;
                }
            }
        }
        tracing::debug!(username = %session.username, closed, "login sessions closed");
        closed
    }
}

pub struct ForwardSessions {
    store: Arc<ExpiringStore<ForwardSession>>,
}

impl ForwardSessions {
    pub fn new(clock: Clock) -> Self {
        Self {
            store: Arc::new(ExpiringStore::with_clock(
                "forward_sessions",
                FORWARD_SESSION_TTL,
                clock,
            )),
        }
    }

    pub fn start(&self, session: ForwardSession) {
        self.store.set(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<ForwardSession> {
        self.store.get(id)
    }

    pub fn delete(&self, id: &str) -> Option<ForwardSession> {
        self.store.delete(id)
    }
}

/// All session stores of the server.
pub struct Sessions {
    pub auth: AuthSessions,
    pub login: LoginSessions,
    pub forward: ForwardSessions,
}

impl Sessions {
    pub fn new(session_timeout: Duration) -> Self {
        Self::with_clock(session_timeout, system_clock())
    }

    pub fn with_clock(session_timeout: Duration, clock: Clock) -> Self {
        Self {
            auth: AuthSessions::new(Arc::clone(&clock)),
            login: LoginSessions::new(session_timeout, Arc::clone(&clock)),
            forward: ForwardSessions::new(clock),
        }
    }

    pub fn spawn_sweepers(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.auth.store.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone()),
            self.login.store.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone()),
            self.forward.store.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone()),
        ]
    }
}

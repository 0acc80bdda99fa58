use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::crypto;
use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub classification: Vec<Classification>,
    #[serde(skip)]
    server_secret: String,
    #[serde(skip)]
    forward_auth_client: Option<Client>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub addr: String,
    pub tls: Option<TlsConfig>,
    pub secret: Option<ConfigValue>,
    /// PEM private key used for tokens of clients without their own key.
    pub private_key: Option<PathBuf>,
    pub issuer: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cookies: CookieConfig,
    #[serde(default = "default_introspect_scope")]
    pub introspect_scope: String,
    #[serde(default = "default_revoke_scope")]
    pub revoke_scope: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_seconds: u64,
    pub logout_redirect: Option<String>,
    #[serde(default)]
    pub forward_auth: ForwardAuthConfig,
    /// Enables discovery and userinfo even when no client is marked `oidc`.
    #[serde(default)]
    pub oidc: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub addr: Option<String>,
    pub cert: Option<ConfigValue>,
    pub key: Option<ConfigValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    #[serde(default = "default_auth_cookie")]
    pub auth_name: String,
    #[serde(default = "default_message_cookie")]
    pub message_name: String,
    #[serde(default = "default_forward_auth_cookie")]
    pub forward_auth_name: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            auth_name: default_auth_cookie(),
            message_name: default_message_cookie(),
            forward_auth_name: default_forward_auth_cookie(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_forward_endpoint")]
    pub endpoint: String,
    pub external_url: Option<String>,
    #[serde(default = "default_forward_parameter")]
    pub parameter_name: String,
    /// Client id presented to `/authorize` by the forward-auth flow.
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirects: Vec<String>,
}

impl Default for ForwardAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_forward_endpoint(),
            external_url: None,
            parameter_name: default_forward_parameter(),
            client_id: None,
            redirects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_footer_text")]
    pub footer_text: String,
    #[serde(default)]
    pub hide_footer: bool,
    #[serde(default = "default_invalid_credentials")]
    pub invalid_credentials_message: String,
    #[serde(default = "default_expired_login")]
    pub expired_login_message: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            title: String::new(),
            footer_text: default_footer_text(),
            hide_footer: false,
            invalid_credentials_message: default_invalid_credentials(),
            expired_login_message: default_expired_login(),
        }
    }
}

// --- Clients ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Client {
    pub id: String,
    /// Salted SHA-512 hex of the secret; empty for public clients.
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub redirects: Vec<String>,
    /// Minutes.
    #[serde(default = "default_access_ttl")]
    pub access_ttl: u64,
    /// Minutes, 0 disables refresh tokens.
    #[serde(default)]
    pub refresh_ttl: u64,
    /// Minutes.
    #[serde(default)]
    pub id_ttl: u64,
    #[serde(default = "default_roles_claim")]
    pub roles_claim: String,
    #[serde(default = "default_audience")]
    pub audience: Vec<String>,
    #[serde(default)]
    pub claims: Vec<ClaimConfig>,
    #[serde(default)]
    pub opaque_token: bool,
    #[serde(default)]
    pub introspect: bool,
    #[serde(default)]
    pub revoke: bool,
    #[serde(default)]
    pub oidc: bool,
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub password_fallback_allowed: bool,
}

impl Client {
    pub fn is_public(&self) -> bool {
        self.client_secret.is_empty()
    }

    /// Match a redirect URI against the registered patterns.
    ///
    /// An empty candidate is accepted here; callers reject it when parsing.
    /// A pattern whose path ends in `/*` matches any candidate that continues
    /// the pattern's path with at least one more segment.
    pub fn matches_redirect(&self, candidate: &str) -> bool {
        if candidate.is_empty() {
            return true;
        }
        let Ok(candidate) = url::Url::parse(candidate) else {
            return false;
        };
        self.redirects
            .iter()
            .filter_map(|pattern| url::Url::parse(pattern).ok())
            .any(|pattern| redirect_matches(&pattern, &candidate))
    }
}

fn redirect_matches(pattern: &url::Url, candidate: &url::Url) -> bool {
    if pattern.scheme() != candidate.scheme()
        || pattern.host_str() != candidate.host_str()
        || pattern.port_or_known_default() != candidate.port_or_known_default()
    {
        return false;
    }
    match pattern.path().strip_suffix('*') {
        Some(head) if head.ends_with('/') => candidate
            .path()
            .strip_prefix(head)
            .is_some_and(|rest| !rest.is_empty()),
        _ => pattern.path() == candidate.path(),
    }
}

/// A static claim: a name with exactly one of `value` or `values`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimConfig {
    pub name: String,
    pub value: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    pub scope: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ClaimConfig {
    pub fn json_value(&self) -> Value {
        match &self.value {
            Some(v) => Value::String(v.clone()),
            None => Value::Array(self.values.iter().cloned().map(Value::String).collect()),
        }
    }

    fn matches_scopes(&self, scopes: &[String]) -> bool {
        let wanted = merge(self.scope.as_ref(), &self.scopes);
        wanted.is_empty() || scopes.iter().any(|s| wanted.contains(s.as_str()))
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("claim is missing a name".to_string()));
        }
        match (&self.value, self.values.is_empty()) {
            (Some(_), false) => Err(Error::Config(format!(
                "claim {} can only have a single value or a list of values, not both",
                self.name
            ))),
            (None, true) => Err(Error::Config(format!(
                "claim {} must contain a value or a list of values",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Claims attached to tokens for a selection of users and clients.
#[derive(Debug, Clone, Deserialize)]
pub struct Classification {
    pub user: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    pub client: Option<String>,
    #[serde(default)]
    pub clients: Vec<String>,
    pub scope: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub claims: Vec<ClaimConfig>,
}

fn merge<'a>(single: Option<&'a String>, many: &'a [String]) -> HashSet<&'a str> {
    single
        .into_iter()
        .chain(many.iter())
        .filter(|s| !s.is_empty())
        .map(String::as_str)
        .collect()
}

// --- Users ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    pub username: String,
    /// Salted SHA-512 hex of the password.
    pub password: String,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub profile: UserProfile,
    #[serde(default)]
    pub information: UserInformation,
    /// Client id to role names.
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub middle_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub preferred_username: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub birthdate: String,
    #[serde(default)]
    pub zoneinfo: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub picture: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInformation {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub phone_verified: bool,
    pub address: Option<UserAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserAddress {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
}

impl User {
    /// Given and family name joined by a space, either one alone, or empty.
    pub fn name(&self) -> String {
        let p = &self.profile;
        [p.given_name.as_str(), p.family_name.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn preferred_username(&self) -> &str {
        if self.profile.preferred_username.is_empty() {
            &self.username
        } else {
            &self.profile.preferred_username
        }
    }

    /// Non-empty address lines, each followed by a newline.
    pub fn formatted_address(&self) -> String {
        let Some(address) = &self.information.address else {
            return String::new();
        };
        [
            &address.street,
            &address.postal_code,
            &address.city,
            &address.region,
            &address.country,
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(|s| format!("{s}\n"))
        .collect()
    }

    pub fn roles_for(&self, client_id: &str) -> &[String] {
        self.roles.get(client_id).map(Vec::as_slice).unwrap_or_default()
    }
}

// --- ConfigValue: supports "env:VAR_NAME" syntax ---

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
}

impl ConfigValue {
    pub fn resolve(&self) -> Result<String> {
        let ConfigValue::Literal(s) = self;
        if let Some(var_name) = s.strip_prefix("env:") {
            std::env::var(var_name).map_err(|_| {
                Error::Config(format!("environment variable {var_name} not set"))
            })
        } else {
            Ok(s.clone())
        }
    }
}

// --- Loading and validation ---

const CONFIG_FILENAME: &str = "stopnik.toml";
const CONFIG_ENV_VAR: &str = "STOPNIK_CONFIG";
const SERVER_SECRET_LENGTH: usize = 16;

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.initialize()
    }

    /// Parse TOML content directly; used by tests and embedding callers.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::ConfigParse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.initialize()
    }

    /// Validate, resolve the server secret and build the forward-auth client.
    pub fn initialize(mut self) -> Result<Self> {
        self.validate()?;

        self.server_secret = match &self.server.secret {
            Some(secret) => secret.resolve()?,
            None => String::new(),
        };
        if self.server_secret.is_empty() {
            self.server_secret = crypto::random_string(SERVER_SECRET_LENGTH);
        }

        let forward = &self.server.forward_auth;
        if self.forward_auth_enabled() {
            self.forward_auth_client = Some(Client {
                id: forward.client_id.clone().unwrap_or_default(),
                redirects: forward.redirects.clone(),
                access_ttl: default_access_ttl(),
                roles_claim: default_roles_claim(),
                audience: default_audience(),
                ..Client::default()
            });
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.addr.is_empty() {
            return Err(Error::Config("no server address provided".to_string()));
        }

        if let Some(tls) = &self.server.tls {
            if tls.cert.is_none() != tls.key.is_none() {
                return Err(Error::Config(
                    "server.tls requires both cert and key".to_string(),
                ));
            }
        }

        let forward = &self.server.forward_auth;
        if forward.enabled {
            if forward.external_url.as_deref().unwrap_or_default().is_empty() {
                return Err(Error::Config(
                    "server.forward_auth.external_url is missing".to_string(),
                ));
            }
            let client_id = forward.client_id.as_deref().unwrap_or_default();
            if client_id.is_empty() {
                return Err(Error::Config(
                    "server.forward_auth.client_id is missing".to_string(),
                ));
            }
            if self.clients.iter().any(|c| c.id == client_id) {
                return Err(Error::Config(format!(
                    "server.forward_auth.client_id {client_id} collides with a configured client"
                )));
            }
            if forward.redirects.is_empty() {
                return Err(Error::Config(
                    "server.forward_auth.redirects is empty".to_string(),
                ));
            }
        }

        let cookies = &self.server.cookies;
        let names = [
            ("auth", &cookies.auth_name),
            ("message", &cookies.message_name),
            ("forward auth", &cookies.forward_auth_name),
        ];
        for (i, (a, a_name)) in names.iter().enumerate() {
            for (b, b_name) in &names[i + 1..] {
                if a_name == b_name {
                    return Err(Error::Config(format!(
                        "{a} cookie name should not equal {b} cookie name"
                    )));
                }
            }
        }

        if self.users.is_empty() {
            return Err(Error::Config(
                "no users configured, add at least one user".to_string(),
            ));
        }
        if self.clients.is_empty() {
            return Err(Error::Config(
                "no clients configured, add at least one client".to_string(),
            ));
        }

        let mut usernames = HashSet::new();
        for (index, user) in self.users.iter().enumerate() {
            if user.username.is_empty() {
                return Err(Error::Config(format!("user {index} is missing a username")));
            }
            if !is_sha512_hex(&user.password) {
                return Err(Error::Config(format!(
                    "user {} needs a SHA-512 hex password",
                    user.username
                )));
            }
            if !usernames.insert(user.username.as_str()) {
                return Err(Error::Config(format!(
                    "user {} is defined more than once",
                    user.username
                )));
            }
        }

        let mut client_ids = HashSet::new();
        for (index, client) in self.clients.iter().enumerate() {
            if client.id.is_empty() {
                return Err(Error::Config(format!("client {index} is missing an id")));
            }
            if client.redirects.is_empty() {
                return Err(Error::Config(format!(
                    "client {} has no redirects",
                    client.id
                )));
            }
            if !client.client_secret.is_empty() && !is_sha512_hex(&client.client_secret) {
                return Err(Error::Config(format!(
                    "client {} needs a SHA-512 hex client_secret",
                    client.id
                )));
            }
            if !client_ids.insert(client.id.as_str()) {
                return Err(Error::Config(format!(
                    "client {} is defined more than once",
                    client.id
                )));
            }
            for (name, ttl) in [
                ("access_ttl", client.access_ttl),
                ("refresh_ttl", client.refresh_ttl),
                ("id_ttl", client.id_ttl),
            ] {
                if ttl > MAX_TTL_MINUTES {
                    return Err(Error::Config(format!(
                        "client {} {name} exceeds {MAX_TTL_MINUTES} minutes",
                        client.id
                    )));
                }
            }
            for claim in &client.claims {
                claim.validate()?;
            }
        }

        for classification in &self.classification {
            for claim in &classification.claims {
                claim.validate()?;
            }
        }

        Ok(())
    }

    pub fn user(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Configured clients, plus the forward-auth client when enabled.
    pub fn client(&self, client_id: &str) -> Option<&Client> {
        self.clients
            .iter()
            .find(|c| c.id == client_id)
            .or_else(|| self.forward_auth_client().filter(|c| c.id == client_id))
    }

    pub fn forward_auth_client(&self) -> Option<&Client> {
        self.forward_auth_client.as_ref()
    }

    pub fn forward_auth_enabled(&self) -> bool {
        let forward = &self.server.forward_auth;
        forward.enabled && forward.external_url.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Configured secret, or a random one generated at start-up.
    pub fn server_secret(&self) -> &str {
        &self.server_secret
    }

    pub fn oidc_enabled(&self) -> bool {
        self.server.oidc || self.clients.iter().any(|c| c.oidc)
    }

    /// Configured issuer, else the request's base URL, else `STOPnik`.
    pub fn issuer(&self, request_base: Option<&str>) -> String {
        self.server
            .issuer
            .clone()
            .filter(|i| !i.is_empty())
            .or_else(|| request_base.filter(|b| !b.is_empty()).map(str::to_string))
            .unwrap_or_else(|| "STOPnik".to_string())
    }

    /// Classification claims applying to the user, client and scopes.
    pub fn claims(&self, username: &str, client_id: &str, scopes: &[String]) -> Vec<&ClaimConfig> {
        self.classification
            .iter()
            .filter(|c| merge(c.user.as_ref(), &c.users).contains(username))
            .filter(|c| merge(c.client.as_ref(), &c.clients).contains(client_id))
            .filter(|c| {
                let wanted = merge(c.scope.as_ref(), &c.scopes);
                wanted.is_empty() || scopes.iter().any(|s| wanted.contains(s.as_str()))
            })
            .flat_map(|c| c.claims.iter())
            .filter(|claim| claim.matches_scopes(scopes))
            .collect()
    }
}

fn is_sha512_hex(value: &str) -> bool {
    value.len() == 128 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Resolve config file location using the standard search order:
/// 1. Explicit path (CLI flag)
/// 2. STOPNIK_CONFIG env var
/// 3. Current directory
/// 4. Walk up parent directories
/// 5. ~/.config/stopnik/config.toml
/// 6. /etc/stopnik/config.toml
pub fn resolve_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut searched = Vec::new();

    if let Some(path) = explicit_path {
        if path.exists() {
            return Config::from_path(path);
        }
        return Err(Error::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Config::from_path(&path);
        }
        searched.push(path);
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = Some(cwd.as_path());
        while let Some(d) = dir {
            let config_path = d.join(CONFIG_FILENAME);
            if config_path.exists() {
                return Config::from_path(&config_path);
            }
            searched.push(config_path);
            dir = d.parent();
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("stopnik").join("config.toml");
        if user_config.exists() {
            return Config::from_path(&user_config);
        }
        searched.push(user_config);
    }

    let system_config = PathBuf::from("/etc/stopnik/config.toml");
    if system_config.exists() {
        return Config::from_path(&system_config);
    }
    searched.push(system_config);

    Err(Error::ConfigNotFound { searched })
}

// --- Defaults ---

fn default_log_level() -> String { "info".to_string() }
fn default_introspect_scope() -> String { "stopnik:introspect".to_string() }
fn default_revoke_scope() -> String { "stopnik:revoke".to_string() }
fn default_session_timeout() -> u64 { 3600 }
fn default_auth_cookie() -> String { "stopnik_auth".to_string() }
fn default_message_cookie() -> String { "stopnik_message".to_string() }
fn default_forward_auth_cookie() -> String { "stopnik_forward_auth".to_string() }
fn default_forward_endpoint() -> String { "/forward".to_string() }
fn default_forward_parameter() -> String { "forward_id".to_string() }
fn default_footer_text() -> String { "STOPnik".to_string() }
fn default_invalid_credentials() -> String { "Invalid credentials".to_string() }
fn default_expired_login() -> String { "Login expired, try again".to_string() }
fn default_access_ttl() -> u64 { 5 }

/// Upper bound for any token lifetime, ten years in minutes.
pub const MAX_TTL_MINUTES: u64 = 60 * 24 * 365 * 10;
fn default_roles_claim() -> String { "roles".to_string() }
fn default_audience() -> Vec<String> { vec!["all".to_string()] }

//! Access, refresh and ID token issuance, storage and bearer validation.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{Client, Config, User};
use crate::crypto;
use crate::error::{Error, Result};
use crate::keys::{KeyRegistry, ManagedKey};
use crate::oauth2::TOKEN_TYPE_BEARER;
use crate::oidc;
use crate::store::{Clock, ExpiringStore, SWEEP_INTERVAL, system_clock};

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub key: String,
    pub token_type: &'static str,
    /// Empty for `client_credentials` tokens.
    pub username: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Code the token was exchanged for, if any.
    pub authorization_code: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub key: String,
    pub username: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub authorization_code: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// RFC 6749 section 5.1 success body.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

/// Who a token is issued to and in which context.
#[derive(Debug, Clone, Copy)]
pub struct Grant<'a> {
    pub client: &'a Client,
    pub username: &'a str,
    pub scopes: &'a [String],
    pub nonce: Option<&'a str>,
    pub auth_time: Option<DateTime<Utc>>,
    pub authorization_code: Option<&'a str>,
    /// Refresh token presented by the refresh grant; it is returned again
    /// instead of minting a new one.
    pub refresh_token: Option<&'a str>,
    /// Implicit responses never carry a refresh token.
    pub allow_refresh: bool,
}

impl<'a> Grant<'a> {
    pub fn new(client: &'a Client, username: &'a str, scopes: &'a [String]) -> Self {
        Self {
            client,
            username,
            scopes,
            nonce: None,
            auth_time: None,
            authorization_code: None,
            refresh_token: None,
            allow_refresh: true,
        }
    }

    pub fn nonce(mut self, nonce: &'a str) -> Self {
        self.nonce = Some(nonce).filter(|n| !n.is_empty());
        self
    }

    pub fn auth_time(mut self, auth_time: Option<DateTime<Utc>>) -> Self {
        self.auth_time = auth_time;
        self
    }

    pub fn authorization_code(mut self, code: &'a str) -> Self {
        self.authorization_code = Some(code);
        self
    }

    pub fn refresh_token(mut self, token: &'a str) -> Self {
        self.refresh_token = Some(token);
        self
    }

    pub fn without_refresh(mut self) -> Self {
        self.allow_refresh = false;
        self
    }

    fn wants_refresh(&self) -> bool {
        if !self.allow_refresh || self.client.refresh_ttl == 0 {
            return false;
        }
        // OIDC clients must ask for offline access explicitly.
        !(self.client.oidc && oidc::has_openid(self.scopes))
            || oidc::has_offline_access(self.scopes)
    }

    pub fn wants_id_token(&self) -> bool {
        self.client.oidc && oidc::has_openid(self.scopes)
    }
}

/// Lifetime of `minutes`, rejecting values chrono cannot represent.
fn lifetime(minutes: u64) -> Result<Duration> {
    i64::try_from(minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .ok_or_else(|| Error::Config(format!("token lifetime of {minutes} minutes is out of range")))
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| Error::Config("token expiry is out of range".to_string()))
}

/// A bearer credential resolved against the access token store.
#[derive(Debug, Clone)]
pub struct Bearer<'a> {
    pub token: AccessToken,
    /// `None` for tokens without a user, such as `client_credentials`.
    pub user: Option<&'a User>,
    pub client: &'a Client,
}

/// Extract the credential from an `Authorization: Bearer ...` header value.
pub fn bearer_value(header: &str) -> Option<&str> {
    let (scheme, value) = header.trim().split_once(' ')?;
    let value = value.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !value.is_empty()).then_some(value)
}

pub struct TokenService {
    config: Arc<Config>,
    keys: Arc<KeyRegistry>,
    access: Arc<ExpiringStore<AccessToken>>,
    refresh: Arc<ExpiringStore<RefreshToken>>,
    clock: Clock,
}

impl TokenService {
    pub fn new(config: Arc<Config>, keys: Arc<KeyRegistry>) -> Self {
        Self::with_clock(config, keys, system_clock())
    }

    pub fn with_clock(config: Arc<Config>, keys: Arc<KeyRegistry>, clock: Clock) -> Self {
        Self {
            config,
            keys,
            access: Arc::new(ExpiringStore::with_clock(
                "access_tokens",
                Duration::minutes(5),
                Arc::clone(&clock),
            )),
            refresh: Arc::new(ExpiringStore::with_clock(
                "refresh_tokens",
                Duration::minutes(5),
                Arc::clone(&clock),
            )),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    /// Mint and store an access token, plus refresh and ID tokens where the
    /// client and scopes call for them.
    pub fn create_access_token_response(&self, issuer: &str, grant: Grant<'_>) -> Result<TokenResponse> {
        let client = grant.client;
        let key = self.keys.signing_key(client);
        let now = self.now();

        let access_ttl = lifetime(client.access_ttl)?;
        let access_expiry = expiry(now, access_ttl)?;
        let access_key = self.mint(key, issuer, &grant, now, access_expiry)?;
        self.access.set_with_duration(
            access_key.clone(),
            AccessToken {
                key: access_key.clone(),
                token_type: TOKEN_TYPE_BEARER,
                username: grant.username.to_string(),
                client_id: client.id.clone(),
                scopes: grant.scopes.to_vec(),
                authorization_code: grant.authorization_code.map(str::to_string),
                expires_at: access_expiry,
            },
            access_ttl,
        );

        let refresh_token = match grant.refresh_token {
            Some(existing) => Some(existing.to_string()),
            None if grant.wants_refresh() => {
                let refresh_ttl = lifetime(client.refresh_ttl)?;
                let refresh_expiry = expiry(now, refresh_ttl)?;
                let refresh_key = self.mint(key, issuer, &grant, now, refresh_expiry)?;
                self.refresh.set_with_duration(
                    refresh_key.clone(),
                    RefreshToken {
                        key: refresh_key.clone(),
                        username: grant.username.to_string(),
                        client_id: client.id.clone(),
                        scopes: grant.scopes.to_vec(),
                        authorization_code: grant.authorization_code.map(str::to_string),
                        expires_at: refresh_expiry,
                    },
                    refresh_ttl,
                );
                Some(refresh_key)
            }
            None => None,
        };

        let id_token = if grant.wants_id_token() && self.config.user(grant.username).is_some() {
            Some(self.create_id_token(issuer, grant, Some(&access_key))?)
        } else {
            None
        };

        tracing::debug!(
            client_id = %client.id,
            algorithm = key.algorithm.as_str(),
            refresh = refresh_token.is_some(),
            id_token = id_token.is_some(),
            "issued access token"
        );

        Ok(TokenResponse {
            access_token: access_key,
            token_type: TOKEN_TYPE_BEARER,
            expires_in: access_ttl.num_seconds(),
            refresh_token,
            id_token,
        })
    }

    /// Opaque value or signed JWT, depending on the client.
    fn mint(
        &self,
        key: &ManagedKey,
        issuer: &str,
        grant: &Grant<'_>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let jti = Uuid::new_v4().to_string();
        if grant.client.opaque_token {
            return Ok(URL_SAFE_NO_PAD.encode(jti));
        }

        let client = grant.client;
        let mut claims = Map::new();
        for claim in &client.claims {
            claims.insert(claim.name.clone(), claim.json_value());
        }
        self.insert_user_claims(&mut claims, grant);
        claims.insert("iss".to_string(), json!(issuer));
        claims.insert("sub".to_string(), json!(grant.username));
        claims.insert("aud".to_string(), json!(client.audience));
        claims.insert("jti".to_string(), json!(jti));
        claims.insert("iat".to_string(), json!(now.timestamp()));
        claims.insert("exp".to_string(), json!(expires_at.timestamp()));
        claims.insert("client_id".to_string(), json!(client.id));
        if !grant.scopes.is_empty() {
            claims.insert("scope".to_string(), json!(grant.scopes.join(" ")));
        }
        key.sign(&Value::Object(claims))
    }

    /// Roles of the user for this client and classification claims.
    fn insert_user_claims(&self, claims: &mut Map<String, Value>, grant: &Grant<'_>) {
        let client = grant.client;
        if let Some(user) = self.config.user(grant.username) {
            let roles = user.roles_for(&client.id);
            if !roles.is_empty() {
                claims.insert(client.roles_claim.clone(), json!(roles));
            }
        }
        for claim in self.config.claims(grant.username, &client.id, grant.scopes) {
            claims.insert(claim.name.clone(), claim.json_value());
        }
    }

    /// Signed OIDC ID token for the grant's user. `at_hash` is included when
    /// the companion access token is given.
    pub fn create_id_token(
        &self,
        issuer: &str,
        grant: Grant<'_>,
        access_token: Option<&str>,
    ) -> Result<String> {
        let client = grant.client;
        let key = self.keys.signing_key(client);
        let now = self.now();
        // An unset id_ttl follows the access token lifetime.
        let minutes = if client.id_ttl > 0 { client.id_ttl } else { client.access_ttl };
        let expires_at = expiry(now, lifetime(minutes)?)?;

        let mut audience = client.audience.clone();
        if !audience.contains(&client.id) {
            audience.push(client.id.clone());
        }

        let mut claims = match self.config.user(grant.username) {
            Some(user) => oidc::user_claims(user, grant.scopes),
            None => Map::new(),
        };
        self.insert_user_claims(&mut claims, &grant);
        claims.insert("iss".to_string(), json!(issuer));
        claims.insert("sub".to_string(), json!(grant.username));
        claims.insert("aud".to_string(), json!(audience));
        claims.insert("jti".to_string(), json!(Uuid::new_v4().to_string()));
        claims.insert("iat".to_string(), json!(now.timestamp()));
        claims.insert("exp".to_string(), json!(expires_at.timestamp()));
        claims.insert(oidc::CLAIM_AUTHORIZED_PARTY.to_string(), json!(client.id));
        if let Some(access_token) = access_token {
            claims.insert(
                oidc::CLAIM_AT_HASH.to_string(),
                json!(crypto::token_hash(key.hash_algorithm(), access_token)),
            );
        }
        if let Some(nonce) = grant.nonce {
            claims.insert(oidc::CLAIM_NONCE.to_string(), json!(nonce));
        }
        if let Some(auth_time) = grant.auth_time {
            claims.insert(oidc::CLAIM_AUTH_TIME.to_string(), json!(auth_time.timestamp()));
        }

        key.sign(&Value::Object(claims))
    }

    pub fn access_token(&self, key: &str) -> Option<AccessToken> {
        self.access.get(key)
    }

    pub fn refresh_token(&self, key: &str) -> Option<RefreshToken> {
        self.refresh.get(key)
    }

    /// Resolve a bearer value to its token, user and client.
    pub fn validate_bearer(&self, value: &str) -> Option<Bearer<'_>> {
        let token = self.access.get(value)?;
        let client = self.config.client(&token.client_id)?;
        let user = if token.username.is_empty() {
            None
        } else {
            Some(self.config.user(&token.username)?)
        };
        Some(Bearer { token, user, client })
    }

    pub fn revoke_access_token(&self, key: &str) -> bool {
        self.access.delete(key).is_some()
    }

    pub fn revoke_refresh_token(&self, key: &str) -> bool {
        self.refresh.delete(key).is_some()
    }

    /// Revoke every token issued to `client_id` for an authorization code,
    /// used when a code is presented again after redemption.
    pub fn revoke_by_authorization_code(&self, client_id: &str, code: &str) -> usize {
        let issued_for =
            |c: &Option<String>, owner: &str| owner == client_id && c.as_deref() == Some(code);
        let access: Vec<_> = self
            .access
            .search(|t| issued_for(&t.authorization_code, &t.client_id));
        let refresh: Vec<_> = self
            .refresh
            .search(|t| issued_for(&t.authorization_code, &t.client_id));
        let revoked = access.iter().filter(|t| self.revoke_access_token(&t.key)).count()
            + refresh.iter().filter(|t| self.revoke_refresh_token(&t.key)).count();
        if revoked > 0 {
            tracing::warn!(revoked, "authorization code replayed, tokens revoked");
        }
        revoked
    }

    pub fn spawn_sweepers(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.access.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone()),
            self.refresh.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ManagedKey;

    const FOO: &str = "f7fbba6e0636f890e56fbbf3283e524c6fa3204ae298382d624741d0dc6638326e282c41be5e4254d8820772c5518a2c5a8c0c7f7eda19594a7eb539453e1ed7";

    fn service() -> (TokenService, Arc<Config>) {
        let toml = format!(
            r#"
[server]
addr = ":8080"
secret = "s3cr3t"

[[clients]]
id = "jwt"
redirects = ["https://example.com/cb"]
refresh_ttl = 60
audience = ["api"]
claims = [{{ name = "tier", value = "gold" }}]

[[clients]]
id = "opaque"
redirects = ["https://example.com/cb"]
opaque_token = true
access_ttl = 10

[[clients]]
id = "oidc"
redirects = ["https://example.com/cb"]
oidc = true
refresh_ttl = 60
id_ttl = 15

[[users]]
username = "foo"
password = "{FOO}"
roles = {{ jwt = ["admin"], oidc = ["viewer"] }}

[users.profile]
given_name = "John"

[[classification]]
user = "foo"
clients = ["jwt", "oidc"]
claims = [{{ name = "groups", values = ["a"] }}]
"#
        );
        let config = Arc::new(Config::from_toml(&toml).unwrap());
        let keys = Arc::new(KeyRegistry::load(&config).unwrap());
        (TokenService::new(Arc::clone(&config), keys), config)
    }

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn decode(token: &str) -> Value {
        ManagedKey::hmac("s3cr3t").verify(token).unwrap()
    }

    #[test]
    fn jwt_access_token_claims() {
        let (service, config) = service();
        let client = config.client("jwt").unwrap();
        let s = scopes(&["read", "write"]);
        let response = service
            .create_access_token_response("https://issuer", Grant::new(client, "foo", &s))
            .unwrap();

        assert_eq!(response.token_type, "bearer");
        assert_eq!(response.expires_in, 300);
        assert!(response.refresh_token.is_some());
        assert!(response.id_token.is_none());

        let claims = decode(&response.access_token);
        assert_eq!(claims["iss"], "https://issuer");
        assert_eq!(claims["sub"], "foo");
        assert_eq!(claims["aud"], json!(["api"]));
        assert_eq!(claims["client_id"], "jwt");
        assert_eq!(claims["scope"], "read write");
        assert_eq!(claims["tier"], "gold");
        assert_eq!(claims["roles"], json!(["admin"]));
        assert_eq!(claims["groups"], json!(["a"]));
        let lifetime = claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap();
        assert_eq!(lifetime, 300);

        let stored = service.access_token(&response.access_token).unwrap();
        assert_eq!(stored.username, "foo");
        assert_eq!(stored.scopes, s);
        let refresh = service
            .refresh_token(response.refresh_token.as_deref().unwrap())
            .unwrap();
        assert_eq!(refresh.client_id, "jwt");
        assert_ne!(refresh.key, stored.key);
    }

    #[test]
    fn unrepresentable_lifetime_is_an_error() {
        assert_eq!(lifetime(5).unwrap().num_seconds(), 300);
        assert!(lifetime(200_000_000_000_000_000).is_err());
        assert!(lifetime(u64::MAX).is_err());

        let (service, config) = service();
        let mut client = config.client("jwt").unwrap().clone();
        client.access_ttl = 200_000_000_000_000_000;
        let result = service.create_access_token_response("STOPnik", Grant::new(&client, "foo", &[]));
        assert!(matches!(result, Err(Error::Config(_))));

        client.access_ttl = 5;
        client.id_ttl = u64::MAX;
        client.oidc = true;
        let s = scopes(&["openid"]);
        assert!(service.create_id_token("STOPnik", Grant::new(&client, "foo", &s), None).is_err());
    }

    #[test]
    fn opaque_token_without_refresh() {
        let (service, config) = service();
        let client = config.client("opaque").unwrap();
        let response = service
            .create_access_token_response("STOPnik", Grant::new(client, "", &[]))
            .unwrap();
        assert_eq!(response.expires_in, 600);
        assert!(response.refresh_token.is_none());
        assert!(!response.access_token.contains('.'));
        let decoded = URL_SAFE_NO_PAD.decode(&response.access_token).unwrap();
        assert!(Uuid::parse_str(std::str::from_utf8(&decoded).unwrap()).is_ok());

        let bearer = service.validate_bearer(&response.access_token).unwrap();
        assert!(bearer.user.is_none());
        assert_eq!(bearer.client.id, "opaque");
    }

    #[test]
    fn id_token_for_openid_scope() {
        let (service, config) = service();
        let client = config.client("oidc").unwrap();
        let s = scopes(&["openid", "profile"]);
        let auth_time = Utc::now();
        let grant = Grant::new(client, "foo", &s).nonce("n-0S6").auth_time(Some(auth_time));
        let response = service.create_access_token_response("https://issuer", grant).unwrap();

        // no offline_access, no refresh token for an OIDC request
        assert!(response.refresh_token.is_none());
        let id = decode(response.id_token.as_deref().unwrap());
        assert_eq!(id["aud"], json!(["all", "oidc"]));
        assert_eq!(id["azp"], "oidc");
        assert_eq!(id["nonce"], "n-0S6");
        assert_eq!(id["auth_time"], auth_time.timestamp());
        assert_eq!(id["given_name"], "John");
        assert_eq!(id["roles"], json!(["viewer"]));
        assert_eq!(
            id["at_hash"],
            crypto::token_hash(crypto::HashAlgorithm::Sha256, &response.access_token)
        );
        let lifetime = id["exp"].as_i64().unwrap() - id["iat"].as_i64().unwrap();
        assert_eq!(lifetime, 15 * 60);

        let s = scopes(&["openid", "offline_access"]);
        let response = service
            .create_access_token_response("https://issuer", Grant::new(client, "foo", &s))
            .unwrap();
        assert!(response.refresh_token.is_some());
    }

    #[test]
    fn refresh_grant_reuses_token_and_implicit_has_none() {
        let (service, config) = service();
        let client = config.client("jwt").unwrap();
        let response = service
            .create_access_token_response("i", Grant::new(client, "foo", &[]).refresh_token("r"))
            .unwrap();
        assert_eq!(response.refresh_token.as_deref(), Some("r"));

        let response = service
            .create_access_token_response("i", Grant::new(client, "foo", &[]).without_refresh())
            .unwrap();
        assert!(response.refresh_token.is_none());
    }

    #[test]
    fn bearer_validation_and_revocation() {
        let (service, config) = service();
        let client = config.client("jwt").unwrap();
        let response = service
            .create_access_token_response("i", Grant::new(client, "foo", &[]))
            .unwrap();

        let bearer = service.validate_bearer(&response.access_token).unwrap();
        assert_eq!(bearer.user.unwrap().username, "foo");
        assert!(service.validate_bearer("unknown").is_none());

        assert!(service.revoke_access_token(&response.access_token));
        assert!(!service.revoke_access_token(&response.access_token));
        assert!(service.validate_bearer(&response.access_token).is_none());
    }

    #[test]
    fn revoke_tokens_of_replayed_code() {
        let (service, config) = service();
        let client = config.client("jwt").unwrap();
        let response = service
            .create_access_token_response("i", Grant::new(client, "foo", &[]).authorization_code("c1"))
            .unwrap();
        let other = service
            .create_access_token_response("i", Grant::new(client, "foo", &[]))
            .unwrap();

        // another client replaying the code revokes nothing
        assert_eq!(service.revoke_by_authorization_code("opaque", "c1"), 0);
        assert!(service.access_token(&response.access_token).is_some());

        assert_eq!(service.revoke_by_authorization_code("jwt", "c1"), 2);
        assert!(service.access_token(&response.access_token).is_none());
        assert!(service.access_token(&other.access_token).is_some());
        assert_eq!(service.revoke_by_authorization_code("jwt", "c1"), 0);
    }

    #[test]
    fn bearer_header_values() {
        assert_eq!(bearer_value("Bearer abc"), Some("abc"));
        assert_eq!(bearer_value("bearer abc "), Some("abc"));
        assert_eq!(bearer_value("Basic abc"), None);
        assert_eq!(bearer_value("Bearer "), None);
        assert_eq!(bearer_value("abc"), None);
    }
}

//! Shared test infrastructure for stopnik integration tests.
//!
//! A single shared tokio runtime and Axum server are used across all tests
//! of a test binary. Every test gets a fresh reqwest client so cookies do not
//! bleed between tests. The OIDC client signs with an ES256 key generated by
//! the `openssl` CLI.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::process::Command;
use std::sync::OnceLock;

pub use reqwest::{Client, StatusCode};
pub use serde_json::{self, Value};
pub use url::Url;

use stopnik_api::AppState;
use stopnik_core::config::Config;
use stopnik_core::crypto::sha512_salted_hex;
use stopnik_core::keys::KeyRegistry;
use tokio::net::TcpListener;

pub const CLIENT_ID: &str = "foo";
pub const CLIENT_SECRET: &str = "bar";
pub const CLIENT_REDIRECT: &str = "https://example.com/callback";

pub const OIDC_CLIENT_ID: &str = "bar";
pub const OIDC_CLIENT_SECRET: &str = "baz";
pub const OIDC_CLIENT_REDIRECT: &str = "https://rp.example.com/cb";

pub const PUBLIC_CLIENT_ID: &str = "spa";
pub const PUBLIC_CLIENT_REDIRECT: &str = "https://spa.example.com/app/callback";

pub const USERNAME: &str = "foo";
pub const PASSWORD: &str = "FOO";

/// Second user, for tests that close every session of a user.
pub const OTHER_USERNAME: &str = "bob";
pub const OTHER_PASSWORD: &str = "BOB";

pub const FORWARD_CLIENT_ID: &str = "traefik";
pub const FORWARD_EXTERNAL_URL: &str = "https://auth.example.com";

static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
static SERVER: OnceLock<TestServer> = OnceLock::new();

pub fn runtime() -> &'static tokio::runtime::Runtime {
    RT.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to create tokio runtime")
    })
}

pub fn server() -> &'static TestServer {
    // Initialise on a separate thread: callers are already inside
    // `runtime().block_on`, and nesting `block_on` panics.
    SERVER.get_or_init(|| {
        std::thread::spawn(|| runtime().block_on(TestServer::init()))
            .join()
            .expect("test server init panicked")
    })
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub _key_dir: tempfile::TempDir,
}

fn test_config(key_path: &str) -> String {
    format!(
        r#"
[server]
addr = "127.0.0.1:0"
secret = "integration-secret"
introspect_scope = "stopnik:introspect"
revoke_scope = "stopnik:revoke"

[server.forward_auth]
enabled = true
external_url = "{FORWARD_EXTERNAL_URL}"
client_id = "{FORWARD_CLIENT_ID}"
redirects = ["https://app.example.com/*"]

[ui]
title = "STOPnik test"

[[clients]]
id = "{CLIENT_ID}"
client_secret = "{client_secret}"
redirects = ["{CLIENT_REDIRECT}"]
refresh_ttl = 60
introspect = true
revoke = true
password_fallback_allowed = true

[[clients.claims]]
name = "tenant"
value = "acme"

[[clients]]
id = "{OIDC_CLIENT_ID}"
client_secret = "{oidc_secret}"
redirects = ["{OIDC_CLIENT_REDIRECT}"]
oidc = true
refresh_ttl = 60
id_ttl = 10
private_key = "{key_path}"

[[clients]]
id = "{PUBLIC_CLIENT_ID}"
redirects = ["https://spa.example.com/app/*"]

[[users]]
username = "{USERNAME}"
password = "{password}"

[users.profile]
given_name = "Foo"
family_name = "Bar"

[users.information]
email = "foo@example.com"
email_verified = true

[users.roles]
{OIDC_CLIENT_ID} = ["admin"]

[[users]]
username = "{OTHER_USERNAME}"
password = "{other_password}"
salt = "pepper"

[[classification]]
user = "{USERNAME}"
client = "{OIDC_CLIENT_ID}"

[[classification.claims]]
name = "department"
value = "engineering"
"#,
        client_secret = sha512_salted_hex(CLIENT_SECRET, ""),
        oidc_secret = sha512_salted_hex(OIDC_CLIENT_SECRET, ""),
        password = sha512_salted_hex(PASSWORD, ""),
        other_password = sha512_salted_hex(OTHER_PASSWORD, "pepper"),
    )
}

fn generate_ec_key(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("oidc.pem");
    let output = Command::new("openssl")
        .args(["genpkey", "-algorithm", "EC", "-pkeyopt", "ec_paramgen_curve:P-256", "-out"])
        .arg(&path)
        .output()
        .expect("failed to run openssl");
    assert!(output.status.success(), "openssl genpkey failed");
    path
}

impl TestServer {
    async fn init() -> Self {
        let key_dir = tempfile::tempdir().expect("failed to create temp dir");
        let key_path = generate_ec_key(key_dir.path());

        let config = Config::from_toml(&test_config(&key_path.display().to_string()))
            .expect("invalid test config");
        let keys = KeyRegistry::load(&config).expect("failed to load keys");
        let state = AppState::new(config, keys);
        let app = stopnik_api::app(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            addr,
            state,
            _key_dir: key_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Fresh reqwest client per test, avoids cookie bleed between tests.
    pub fn client(&self) -> Client {
        Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    /// Log `client` in through `/account`, leaving the auth cookie in its store.
    pub async fn login(&self, client: &Client) {
        self.login_as(client, USERNAME, PASSWORD).await;
    }

    pub async fn login_as(&self, client: &Client, username: &str, password: &str) {
        let page = client
            .get(self.url("/account"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let token = login_token(&page);
        let resp = client
            .post(self.url("/account"))
            .form(&[
                ("stopnik_username", username),
                ("stopnik_password", password),
                ("stopnik_auth_session", token.as_str()),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    }

    /// Run `/authorize` for an already logged-in client and return the
    /// redirect location.
    pub async fn authorize(&self, client: &Client, query: &[(&str, &str)]) -> Url {
        let resp = client
            .get(self.url("/authorize"))
            .query(query)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND, "authorize did not redirect");
        location(&resp)
    }
}

/// Login token embedded in a rendered login form.
pub fn login_token(page: &str) -> String {
    let marker = "name=\"stopnik_auth_session\" value=\"";
    let start = page.find(marker).expect("no login token in page") + marker.len();
    let end = page[start..].find('"').unwrap() + start;
    page[start..end].to_string()
}

pub fn location(resp: &reqwest::Response) -> Url {
    let value = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .expect("no Location header")
        .to_str()
        .unwrap();
    Url::parse(value).expect("Location is not absolute")
}

pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn fragment_param(url: &Url, name: &str) -> Option<String> {
    let fragment = url.fragment()?;
    url::form_urlencoded::parse(fragment.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Decode the payload of a JWT without verifying it.
pub fn jwt_claims(token: &str) -> Value {
    use base64::Engine;
    let payload = token.split('.').nth(1).expect("not a JWT");
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

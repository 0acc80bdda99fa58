mod common;

use common::*;

#[test]
fn health_answers_pong() {
    runtime().block_on(async {
        let s = server();
        let resp = s.client().get(s.url("/health")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, serde_json::json!({ "ping": "pong" }));
    });
}

#[test]
fn health_reports_bearer_user() {
    runtime().block_on(async {
        let s = server();
        let client = s.client();
        let body: Value = client
            .post(s.url("/token"))
            .basic_auth(CLIENT_ID, Some(CLIENT_SECRET))
            .form(&[
                ("grant_type", "password"),
                ("username", USERNAME),
                ("password", PASSWORD),
                ("scope", "a"),
            ])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let resp = client
            .get(s.url("/health"))
            .bearer_auth(body["access_token"].as_str().unwrap())
            .send()
            .await
            .unwrap();
        let health: Value = resp.json().await.unwrap();
        assert_eq!(health["username"], USERNAME);
        assert_eq!(health["scopes"], serde_json::json!(["a"]));
    });
}

#[test]
fn wrong_method_is_405() {
    runtime().block_on(async {
        let s = server();
        let client = s.client();
        for (method, path) in [
            (reqwest::Method::GET, "/token"),
            (reqwest::Method::GET, "/introspect"),
            (reqwest::Method::PUT, "/authorize"),
            (reqwest::Method::POST, "/keys"),
            (reqwest::Method::GET, "/logout"),
        ] {
            let resp = client.request(method.clone(), s.url(path)).send().await.unwrap();
            assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED, "{method} {path}");
            assert_eq!(resp.text().await.unwrap(), "405 Method not allowed");
        }
    });
}

#[test]
fn keys_publish_client_key() {
    runtime().block_on(async {
        let s = server();
        let resp = s.client().get(s.url("/keys")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let jwks: Value = resp.json().await.unwrap();
        let keys = jwks["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0]["kty"], "EC");
        assert_eq!(keys[0]["alg"], "ES256");
        assert!(keys[0]["kid"].is_string());
    });
}

#[test]
fn authorization_server_metadata() {
    runtime().block_on(async {
        let s = server();
        let resp = s
            .client()
            .get(s.url("/.well-known/oauth-authorization-server"))
            .header("X-Forwarded-Host", "auth.example.com")
            .header("X-Forwarded-Proto", "https")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let doc: Value = resp.json().await.unwrap();
        assert_eq!(doc["issuer"], "https://auth.example.com");
        assert_eq!(doc["token_endpoint"], "https://auth.example.com/token");
        assert_eq!(doc["introspection_endpoint"], "https://auth.example.com/introspect");
        assert_eq!(doc["revocation_endpoint"], "https://auth.example.com/revoke");
        assert!(
            doc["code_challenge_methods_supported"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!("S256"))
        );
    });
}

#[test]
fn account_login_and_logout() {
    runtime().block_on(async {
        let s = server();
        let client = s.client();

        let page = client
            .get(s.url("/account"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("stopnik_password"));

        s.login(&client).await;
        let page = client
            .get(s.url("/account"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("Logged in as <strong>foo</strong>"));

        let resp = client
            .post(s.url("/logout"))
            .form(&[("stopnik_logout_redirect", CLIENT_REDIRECT)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()["location"], CLIENT_REDIRECT);

        let resp = client
            .post(s.url("/logout"))
            .form(&[("stopnik_logout_redirect", "")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    });
}

#[test]
fn logout_redirect_must_be_registered_or_local() {
    runtime().block_on(async {
        let s = server();
        let client = s.client();
        let cases = [
            ("https://evil.example.org/", "/logout"),
            ("//evil.example.org/", "/logout"),
            ("/account", "/account"),
            ("https://spa.example.com/app/bye", "https://spa.example.com/app/bye"),
        ];
        for (requested, expected) in cases {
            s.login(&client).await;
            let resp = client
                .post(s.url("/logout"))
                .form(&[("stopnik_logout_redirect", requested)])
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::SEE_OTHER);
            assert_eq!(resp.headers()["location"], expected, "{requested}");
        }
    });
}

#[test]
fn account_login_with_bad_password_shows_message() {
    runtime().block_on(async {
        let s = server();
        let client = s.client();
        let page = client
            .get(s.url("/account"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let token = login_token(&page);
        let resp = client
            .post(s.url("/account"))
            .form(&[
                ("stopnik_username", USERNAME),
                ("stopnik_password", "nope"),
                ("stopnik_auth_session", token.as_str()),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()["location"], "/account");

        let page = client
            .get(s.url("/account"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("Invalid credentials"));
    });
}

#[test]
fn logout_all_closes_other_sessions() {
    runtime().block_on(async {
        let s = server();
        let first = s.client();
        let second = s.client();
        s.login_as(&first, OTHER_USERNAME, OTHER_PASSWORD).await;
        s.login_as(&second, OTHER_USERNAME, OTHER_PASSWORD).await;

        let resp = first
            .post(s.url("/logout"))
            .form(&[("stopnik_logout_all", "on")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()["location"], "/logout");

        let page = second
            .get(s.url("/account"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("stopnik_password"), "second browser still logged in");
    });
}

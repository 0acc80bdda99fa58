//! OpenID Connect discovery and userinfo.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use stopnik_core::error::Error;
use stopnik_core::oidc;

use super::metadata::{base_document, endpoint_base, signing_algorithms};
use super::{bearer, methods};
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/openid-configuration", methods(get(discovery)))
        .route("/userinfo", methods(get(userinfo).post(userinfo)))
}

async fn discovery(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let mut document = base_document(&state, &headers);
    let base = endpoint_base(&headers);
    document["userinfo_endpoint"] = json!(format!("{base}/userinfo"));
    document["subject_types_supported"] = json!(["public"]);
    document["id_token_signing_alg_values_supported"] = json!(signing_algorithms());
    document["scopes_supported"] = json!([
        oidc::SCOPE_OPENID,
        oidc::SCOPE_OFFLINE_ACCESS,
        oidc::SCOPE_PROFILE,
        oidc::SCOPE_EMAIL,
        oidc::SCOPE_ADDRESS,
        oidc::SCOPE_PHONE,
    ]);
    Json(document)
}

/// Claims about the bearer's user, released by the token's scopes.
async fn userinfo(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, Error> {
    let bearer = bearer(&state, &headers).ok_or(Error::Unauthenticated)?;
    let user = bearer.user.ok_or(Error::Unauthenticated)?;
    let scopes = &bearer.token.scopes;
    if !oidc::has_openid(scopes) {
        return Err(Error::Unauthenticated);
    }

    let mut claims = oidc::user_claims(user, scopes);
    claims.insert("sub".to_string(), json!(user.username));
    for claim in state.config.claims(&user.username, &bearer.client.id, scopes) {
        claims.insert(claim.name.clone(), claim.json_value());
    }
    Ok(Json(Value::Object(claims)))
}

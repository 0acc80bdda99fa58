//! OpenID Connect scopes, claim names, `prompt` and the scope-driven user claims.

use serde_json::{Map, Value, json};

use crate::config::User;

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const SCOPE_PROFILE: &str = "profile";
pub const SCOPE_EMAIL: &str = "email";
pub const SCOPE_ADDRESS: &str = "address";
pub const SCOPE_PHONE: &str = "phone";

pub const CLAIM_NONCE: &str = "nonce";
pub const CLAIM_AUTHORIZED_PARTY: &str = "azp";
pub const CLAIM_AT_HASH: &str = "at_hash";
pub const CLAIM_AUTH_TIME: &str = "auth_time";

pub const PARAM_NONCE: &str = "nonce";
pub const PARAM_PROMPT: &str = "prompt";
pub const PARAM_MAX_AGE: &str = "max_age";

pub fn has_openid(scopes: &[String]) -> bool {
    scopes.iter().any(|s| s == SCOPE_OPENID)
}

pub fn has_offline_access(scopes: &[String]) -> bool {
    scopes.iter().any(|s| s == SCOPE_OFFLINE_ACCESS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl Prompt {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "login" => Some(Self::Login),
            "consent" => Some(Self::Consent),
            "select_account" => Some(Self::SelectAccount),
            _ => None,
        }
    }
}

fn insert_non_empty(claims: &mut Map<String, Value>, name: &str, value: &str) {
    if !value.is_empty() {
        claims.insert(name.to_string(), Value::String(value.to_string()));
    }
}

/// Claims about `user` released by the given scopes (OIDC Core 5.4).
pub fn user_claims(user: &User, scopes: &[String]) -> Map<String, Value> {
    let has = |scope: &str| scopes.iter().any(|s| s == scope);
    let mut claims = Map::new();

    if has(SCOPE_PROFILE) {
        let p = &user.profile;
        insert_non_empty(&mut claims, "name", &user.name());
        insert_non_empty(&mut claims, "given_name", &p.given_name);
        insert_non_empty(&mut claims, "middle_name", &p.middle_name);
        insert_non_empty(&mut claims, "family_name", &p.family_name);
        insert_non_empty(&mut claims, "nickname", &p.nickname);
        insert_non_empty(&mut claims, "preferred_username", user.preferred_username());
        insert_non_empty(&mut claims, "gender", &p.gender);
        insert_non_empty(&mut claims, "birthdate", &p.birthdate);
        insert_non_empty(&mut claims, "zoneinfo", &p.zoneinfo);
        insert_non_empty(&mut claims, "locale", &p.locale);
        insert_non_empty(&mut claims, "website", &p.website);
        insert_non_empty(&mut claims, "profile", &p.profile);
        insert_non_empty(&mut claims, "picture", &p.picture);
    }

    if has(SCOPE_EMAIL) {
        let info = &user.information;
        insert_non_empty(&mut claims, "email", &info.email);
        claims.insert("email_verified".to_string(), json!(info.email_verified));
    }

    if has(SCOPE_PHONE) {
        let info = &user.information;
        insert_non_empty(&mut claims, "phone_number", &info.phone_number);
        claims.insert("phone_number_verified".to_string(), json!(info.phone_verified));
    }

    if has(SCOPE_ADDRESS) {
        if let Some(address) = &user.information.address {
            let mut value = Map::new();
            insert_non_empty(&mut value, "formatted", &user.formatted_address());
            insert_non_empty(&mut value, "street_address", &address.street);
            insert_non_empty(&mut value, "locality", &address.city);
            insert_non_empty(&mut value, "postal_code", &address.postal_code);
            insert_non_empty(&mut value, "region", &address.region);
            insert_non_empty(&mut value, "country", &address.country);
            claims.insert("address".to_string(), Value::Object(value));
        }
    }

    claims
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UserAddress, UserInformation, UserProfile};

    fn user() -> User {
        User {
            username: "foo".to_string(),
            profile: UserProfile {
                given_name: "John".to_string(),
                family_name: "Doe".to_string(),
                preferred_username: "jd".to_string(),
                ..UserProfile::default()
            },
            information: UserInformation {
                email: "john@example.com".to_string(),
                email_verified: true,
                address: Some(UserAddress {
                    city: "Town".to_string(),
                    ..UserAddress::default()
                }),
                ..UserInformation::default()
            },
            ..User::default()
        }
    }

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn claims_follow_scopes() {
        let user = user();
        assert!(user_claims(&user, &scopes(&["openid"])).is_empty());

        let profile = user_claims(&user, &scopes(&["openid", "profile"]));
        assert_eq!(profile["name"], "John Doe");
        assert_eq!(profile["preferred_username"], "jd");
        assert!(!profile.contains_key("email"));
        assert!(!profile.contains_key("nickname"));

        let email = user_claims(&user, &scopes(&["email"]));
        assert_eq!(email["email"], "john@example.com");
        assert_eq!(email["email_verified"], true);

        let address = user_claims(&user, &scopes(&["address"]));
        assert_eq!(address["address"]["locality"], "Town");
        assert_eq!(address["address"]["formatted"], "Town\n");

        let phone = user_claims(&user, &scopes(&["phone"]));
        assert_eq!(phone["phone_number_verified"], false);
        assert!(!phone.contains_key("phone_number"));
    }

    #[test]
    fn prompt_values() {
        assert_eq!(Prompt::parse("none"), Some(Prompt::None));
        assert_eq!(Prompt::parse("login"), Some(Prompt::Login));
        assert_eq!(Prompt::parse("consent"), Some(Prompt::Consent));
        assert_eq!(Prompt::parse("select_account"), Some(Prompt::SelectAccount));
        assert_eq!(Prompt::parse("other"), None);
    }

    #[test]
    fn scope_checks() {
        assert!(has_openid(&scopes(&["profile", "openid"])));
        assert!(!has_openid(&scopes(&["profile"])));
        assert!(has_offline_access(&scopes(&["offline_access"])));
    }
}

//! Proof Key for Code Exchange (RFC 7636).

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const PARAM_CODE_CHALLENGE: &str = "code_challenge";
pub const PARAM_CODE_CHALLENGE_METHOD: &str = "code_challenge_method";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkceMethod {
    Plain,
    S256,
}

impl PkceMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plain" => Some(Self::Plain),
            "S256" => Some(Self::S256),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::S256 => "S256",
        }
    }
}

/// Compute the challenge for a verifier.
pub fn derive(method: PkceMethod, verifier: &str) -> String {
    match method {
        PkceMethod::Plain => verifier.to_string(),
        PkceMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
    }
}

/// True iff `derive(method, verifier)` equals `challenge` byte for byte.
pub fn validate(method: PkceMethod, challenge: &str, verifier: &str) -> bool {
    derive(method, verifier)
        .as_bytes()
        .ct_eq(challenge.as_bytes())
        .into()
}

/// A fresh 43-character verifier.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERIFIER: &str = "R79LG4zTGgB6WS7QGkf3x1BmPqe0RLHl1771POQjuTE";
    const CHALLENGE: &str = "zzq3NtZoI3xStS6o35KHynY9X8XK5Cuqi9NaZfk1Q-8";

    #[test]
    fn s256_known_vector() {
        assert_eq!(derive(PkceMethod::S256, VERIFIER), CHALLENGE);
        assert!(validate(PkceMethod::S256, CHALLENGE, VERIFIER));
    }

    #[test]
    fn tampered_challenge_fails() {
        let mut tampered = CHALLENGE.to_string();
        tampered.pop();
        tampered.push('9');
        assert!(!validate(PkceMethod::S256, &tampered, VERIFIER));
    }

    #[test]
    fn plain_method() {
        assert!(validate(PkceMethod::Plain, "abc", "abc"));
        assert!(!validate(PkceMethod::Plain, "abc", "abd"));
        assert!(!validate(PkceMethod::Plain, CHALLENGE, VERIFIER));
    }

    #[test]
    fn parse_methods() {
        assert_eq!(PkceMethod::parse("S256"), Some(PkceMethod::S256));
        assert_eq!(PkceMethod::parse("plain"), Some(PkceMethod::Plain));
        assert_eq!(PkceMethod::parse("s256"), None);
        assert_eq!(PkceMethod::parse(""), None);
    }

    #[test]
    fn generated_verifier_round_trips() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 43);
        let challenge = derive(PkceMethod::S256, &verifier);
        assert!(validate(PkceMethod::S256, &challenge, &verifier));
    }
}

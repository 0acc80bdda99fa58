//! Hashing helpers shared by credential checks, key ids and `at_hash`.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use rand::distr::Alphanumeric;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

/// Hash family used for `at_hash`, chosen by the signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

pub fn sha512_hex(value: &str) -> String {
    hex::encode(Sha512::digest(value.as_bytes()))
}

/// SHA-512 of `value`, salted as `value/!salt` when a salt is configured.
pub fn sha512_salted_hex(value: &str, salt: &str) -> String {
    if salt.is_empty() {
        sha512_hex(value)
    } else {
        sha512_hex(&format!("{value}/!{salt}"))
    }
}

pub fn sha1_hex(value: &str) -> String {
    hex::encode(Sha1::digest(value.as_bytes()))
}

/// Constant-time check of a plain credential against its stored salted hash.
pub fn verify_salted(value: &str, salt: &str, expected_hex: &str) -> bool {
    let computed = sha512_salted_hex(value, salt);
    computed
        .as_bytes()
        .ct_eq(expected_hex.to_ascii_lowercase().as_bytes())
        .into()
}

/// `base64url(left-half(hash(token)))` as used by the OIDC `at_hash` claim.
pub fn token_hash(algorithm: HashAlgorithm, token: &str) -> String {
    let digest = algorithm.digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// Random alphanumeric string, used for the generated server secret.
pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

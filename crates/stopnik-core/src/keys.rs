//! Signing keys: PEM loading, per-client selection, JWS signing and the JWKS document.
//!
//! Keys are loaded once at start-up from `server.private_key` and every
//! client's `private_key`. A file referenced several times becomes one key
//! (identified by its `kid`) owned by all referencing parties. Clients without
//! a key of their own sign with the server key, and when there is none with
//! HS256 over the server secret.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use base64::{Engine, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p521::ecdsa::signature::{Signer as _, Verifier as _};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::config::{Client, Config};
use crate::crypto::{self, HashAlgorithm};
use crate::der::{self, EcPrivateKey};
use crate::error::{Error, Result};

/// Every JWS algorithm the server can sign with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    RS256,
    ES256,
    ES384,
    ES512,
    HS256,
}

impl SigningAlgorithm {
    pub const ALL: [SigningAlgorithm; 5] = [
        Self::RS256,
        Self::ES256,
        Self::ES384,
        Self::ES512,
        Self::HS256,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::HS256 => "HS256",
        }
    }

    /// Hash family used for `at_hash` with this algorithm.
    pub fn hash_algorithm(self) -> HashAlgorithm {
        match self {
            Self::RS256 | Self::ES256 | Self::HS256 => HashAlgorithm::Sha256,
            Self::ES384 => HashAlgorithm::Sha384,
            Self::ES512 => HashAlgorithm::Sha512,
        }
    }
}

enum Signer {
    /// Algorithms supported by `jsonwebtoken`.
    Jwt {
        algorithm: Algorithm,
        encoding: EncodingKey,
        decoding: DecodingKey,
    },
    /// ES512 is signed by hand with `p521`.
    P521 {
        signing: p521::ecdsa::SigningKey,
        verifying: p521::ecdsa::VerifyingKey,
    },
}

enum PublicJwk {
    Rsa { n: String, e: String },
    Ec { crv: &'static str, x: String, y: String },
    /// Symmetric keys are never published.
    None,
}

/// A loaded private key and the parties that sign with it.
pub struct ManagedKey {
    pub kid: String,
    pub algorithm: SigningAlgorithm,
    /// Referenced by `server.private_key`.
    pub server: bool,
    /// Ids of clients referencing this key.
    pub clients: Vec<String>,
    signer: Signer,
    jwk: PublicJwk,
}

impl std::fmt::Debug for ManagedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("server", &self.server)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

impl ManagedKey {
    /// HS256 key over the server secret. It carries no `kid` and is not published.
    pub fn hmac(secret: &str) -> Self {
        Self {
            kid: String::new(),
            algorithm: SigningAlgorithm::HS256,
            server: true,
            clients: Vec::new(),
            signer: Signer::Jwt {
                algorithm: Algorithm::HS256,
                encoding: EncodingKey::from_secret(secret.as_bytes()),
                decoding: DecodingKey::from_secret(secret.as_bytes()),
            },
            jwk: PublicJwk::None,
        }
    }

    /// Load a PEM private key, trying PKCS#8, PKCS#1 and SEC1 in that order.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| Error::KeyLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_pem(path, &pem)
    }

    fn from_pem(path: &Path, pem: &[u8]) -> Result<Self> {
        let load_error = |reason: &str| Error::KeyLoad {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let (label, der) = der::pem_decode(pem).ok_or_else(|| load_error("not a PEM file"))?;

        if let Some(info) = der::parse_pkcs8(&der) {
            if info.algorithm == der::OID_RSA_ENCRYPTION {
                let key = RsaPrivateKey::from_pkcs8_der(&der)
                    .map_err(|e| load_error(&e.to_string()))?;
                return Self::from_rsa(path, key);
            }
            if info.algorithm == der::OID_EC_PUBLIC_KEY {
                let key = der::parse_sec1(info.private_key, info.parameters)
                    .ok_or_else(|| load_error("EC key without public key"))?;
                return Self::from_ec(path, key);
            }
            return Err(load_error("unsupported PKCS#8 key algorithm"));
        }

        if let Ok(key) = RsaPrivateKey::from_pkcs1_der(&der) {
            return Self::from_rsa(path, key);
        }

        if let Some(key) = der::parse_sec1(&der, None) {
            return Self::from_ec(path, key);
        }

        Err(load_error(&format!("unsupported private key ({label})")))
    }

    fn from_rsa(path: &Path, key: RsaPrivateKey) -> Result<Self> {
        let load_error = |e: &dyn std::fmt::Display| Error::KeyLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let pkcs8 = key.to_pkcs8_der().map_err(|e| load_error(&e))?;
        let pkcs1 = key.to_pkcs1_der().map_err(|e| load_error(&e))?;

        let n = URL_SAFE_NO_PAD.encode(key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(key.e().to_bytes_be());
        let decoding = DecodingKey::from_rsa_components(&n, &e).map_err(|e| load_error(&e))?;

        Ok(Self {
            kid: key_id(pkcs8.as_bytes()),
            algorithm: SigningAlgorithm::RS256,
            server: false,
            clients: Vec::new(),
            signer: Signer::Jwt {
                algorithm: Algorithm::RS256,
                encoding: EncodingKey::from_rsa_der(pkcs1.as_bytes()),
                decoding,
            },
            jwk: PublicJwk::Rsa { n, e },
        })
    }

    fn from_ec(path: &Path, key: EcPrivateKey) -> Result<Self> {
        let load_error = |e: &dyn std::fmt::Display| Error::KeyLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let (algorithm, crv, size) = match key.curve.as_slice() {
            c if c == der::OID_P256 => (SigningAlgorithm::ES256, "P-256", 32),
            c if c == der::OID_P384 => (SigningAlgorithm::ES384, "P-384", 48),
            c if c == der::OID_P521 => (SigningAlgorithm::ES512, "P-521", 66),
            _ => return Err(Error::UnsupportedCurve { path: path.to_path_buf() }),
        };
        if key.public_point.len() != 1 + 2 * size {
            return Err(load_error(&"malformed EC public key"));
        }
        let x = URL_SAFE_NO_PAD.encode(&key.public_point[1..1 + size]);
        let y = URL_SAFE_NO_PAD.encode(&key.public_point[1 + size..]);

        let signer = match algorithm {
            SigningAlgorithm::ES512 => Signer::P521 {
                signing: p521::ecdsa::SigningKey::from_slice(&key.secret)
                    .map_err(|e| load_error(&e))?,
                verifying: p521::ecdsa::VerifyingKey::from_sec1_bytes(&key.public_point)
                    .map_err(|e| load_error(&e))?,
            },
            _ => Signer::Jwt {
                algorithm: if algorithm == SigningAlgorithm::ES256 {
                    Algorithm::ES256
                } else {
                    Algorithm::ES384
                },
                encoding: EncodingKey::from_ec_der(&der::encode_pkcs8_ec(&key)),
                decoding: DecodingKey::from_ec_components(&x, &y).map_err(|e| load_error(&e))?,
            },
        };

        Ok(Self {
            kid: key_id(&der::encode_sec1(&key)),
            algorithm,
            server: false,
            clients: Vec::new(),
            signer,
            jwk: PublicJwk::Ec { crv, x, y },
        })
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.algorithm.hash_algorithm()
    }

    /// Sign `claims` as a compact JWS, with this key's `kid` in the header.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        match &self.signer {
            Signer::Jwt { algorithm, encoding, .. } => {
                let mut header = Header::new(*algorithm);
                if !self.kid.is_empty() {
                    header.kid = Some(self.kid.clone());
                }
                jsonwebtoken::encode(&header, claims, encoding)
                    .map_err(|e| Error::Signing(e.to_string()))
            }
            Signer::P521 { signing, .. } => {
                let header = json!({ "typ": "JWT", "alg": "ES512", "kid": self.kid });
                let payload =
                    serde_json::to_vec(claims).map_err(|e| Error::Signing(e.to_string()))?;
                let signing_input = format!(
                    "{}.{}",
                    URL_SAFE_NO_PAD.encode(header.to_string()),
                    URL_SAFE_NO_PAD.encode(payload)
                );
                let signature: p521::ecdsa::Signature = signing.sign(signing_input.as_bytes());
                Ok(format!(
                    "{signing_input}.{}",
                    URL_SAFE_NO_PAD.encode(signature.to_bytes())
                ))
            }
        }
    }

    /// Verify the signature and expiry of a token signed by this key.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        match &self.signer {
            Signer::Jwt { algorithm, decoding, .. } => {
                let mut validation = Validation::new(*algorithm);
                validation.validate_aud = false;
                validation.leeway = 0;
                jsonwebtoken::decode::<T>(token, decoding, &validation)
                    .map(|data| data.claims)
                    .map_err(|_| Error::InvalidToken)
            }
            Signer::P521 { verifying, .. } => {
                let mut parts = token.rsplitn(2, '.');
                let (Some(signature), Some(signing_input)) = (parts.next(), parts.next()) else {
                    return Err(Error::InvalidToken);
                };
                let Some((header, payload)) = signing_input.split_once('.') else {
                    return Err(Error::InvalidToken);
                };

                let header: Value = decode_segment(header)?;
                if header["alg"] != "ES512" {
                    return Err(Error::InvalidToken);
                }
                let signature = URL_SAFE_NO_PAD
                    .decode(signature)
                    .ok()
                    .and_then(|bytes| p521::ecdsa::Signature::from_slice(&bytes).ok())
                    .ok_or(Error::InvalidToken)?;
                verifying
                    .verify(signing_input.as_bytes(), &signature)
                    .map_err(|_| Error::InvalidToken)?;

                let claims: Value = decode_segment(payload)?;
                let exp = claims["exp"].as_i64().ok_or(Error::InvalidToken)?;
                if exp <= chrono::Utc::now().timestamp() {
                    return Err(Error::InvalidToken);
                }
                serde_json::from_value(claims).map_err(|_| Error::InvalidToken)
            }
        }
    }

    fn to_jwk(&self) -> Option<Value> {
        let mut jwk = match &self.jwk {
            PublicJwk::Rsa { n, e } => json!({ "kty": "RSA", "n": n, "e": e }),
            PublicJwk::Ec { crv, x, y } => json!({ "kty": "EC", "crv": crv, "x": x, "y": y }),
            PublicJwk::None => return None,
        };
        jwk["kid"] = json!(self.kid);
        jwk["alg"] = json!(self.algorithm.as_str());
        jwk["use"] = json!("sig");
        Some(jwk)
    }
}

fn decode_segment(segment: &str) -> Result<Value> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or(Error::InvalidToken)
}

/// Hex SHA-1 over the base64 of the key's DER encoding.
fn key_id(der: &[u8]) -> String {
    crypto::sha1_hex(&STANDARD.encode(der))
}

/// All keys of the running server.
pub struct KeyRegistry {
    keys: Vec<Arc<ManagedKey>>,
    by_client: HashMap<String, Arc<ManagedKey>>,
    server_private: Option<Arc<ManagedKey>>,
    hmac: Arc<ManagedKey>,
    jwks: OnceLock<Value>,
}

impl KeyRegistry {
    pub fn load(config: &Config) -> Result<Self> {
        let mut loaded: Vec<ManagedKey> = Vec::new();

        if let Some(path) = &config.server.private_key {
            let mut key = ManagedKey::from_pem_file(path)?;
            key.server = true;
            merge(&mut loaded, key);
        }
        for client in &config.clients {
            if let Some(path) = &client.private_key {
                let mut key = ManagedKey::from_pem_file(path)?;
                key.clients.push(client.id.clone());
                merge(&mut loaded, key);
            }
        }

        let keys: Vec<Arc<ManagedKey>> = loaded.into_iter().map(Arc::new).collect();
        let by_client = keys
            .iter()
            .flat_map(|key| key.clients.iter().map(move |id| (id.clone(), Arc::clone(key))))
            .collect();
        let server_private = keys.iter().find(|key| key.server).cloned();

        for key in &keys {
            tracing::info!(kid = %key.kid, algorithm = key.algorithm.as_str(), "loaded signing key");
        }

        Ok(Self {
            keys,
            by_client,
            server_private,
            hmac: Arc::new(ManagedKey::hmac(config.server_secret())),
            jwks: OnceLock::new(),
        })
    }

    pub fn keys(&self) -> &[Arc<ManagedKey>] {
        &self.keys
    }

    /// The client's own key, else the server private key.
    pub fn client_key(&self, client_id: &str) -> Option<&ManagedKey> {
        self.by_client
            .get(client_id)
            .or(self.server_private.as_ref())
            .map(Arc::as_ref)
    }

    /// Key that signs tokens issued to `client`; HS256 when no PEM key applies.
    pub fn signing_key(&self, client: &Client) -> &ManagedKey {
        self.client_key(&client.id).unwrap_or(&self.hmac)
    }

    /// HS256 key for server-internal tokens such as cookies and login tokens.
    pub fn server_key(&self) -> &ManagedKey {
        &self.hmac
    }

    /// `{"keys": [...]}` of every published key.
    pub fn jwks(&self) -> &Value {
        self.jwks.get_or_init(|| {
            let keys: Vec<Value> = self.keys.iter().filter_map(|key| key.to_jwk()).collect();
            json!({ "keys": keys })
        })
    }
}

fn merge(loaded: &mut Vec<ManagedKey>, key: ManagedKey) {
    match loaded.iter_mut().find(|existing| existing.kid == key.kid) {
        Some(existing) => {
            existing.server |= key.server;
            existing.clients.extend(key.clients);
        }
        None => loaded.push(key),
    }
}

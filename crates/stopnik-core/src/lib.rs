pub mod config;
pub mod crypto;
mod der;
pub mod error;
pub mod keys;
pub mod oauth2;
pub mod oidc;
pub mod pkce;
pub mod session;
pub mod store;
pub mod token;

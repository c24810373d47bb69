//! OpenID Connect relying-party core: token exchange, JWKS-backed verification
//! and the session credential state machine.

pub mod config;
pub mod error;
pub mod exchange;
pub mod guard;
pub mod http_client;
pub mod jwks;
pub mod reconciler;
pub mod session;
pub mod types;
pub mod verifier;

pub mod oidc_core;

pub use oidc_core::config::{ClientSecret, OidcConfig, OidcSettings};
pub use oidc_core::error::{OidcError, Result, VerificationError};
pub use oidc_core::exchange::TokenExchangeClient;
pub use oidc_core::guard::{SessionGuard, SessionLocks};
pub use oidc_core::http_client::{HttpClientError, HttpMethod, HttpRequest, HttpResponse, InMemoryHttpClient, OidcHttpClient};
#[cfg(feature = "reqwest-client")]
pub use oidc_core::http_client::ReqwestHttpClient;
pub use oidc_core::jwks::{JwksFetcher, KeyFreshness, KeySource};
pub use oidc_core::reconciler::CredentialReconciler;
pub use oidc_core::session::{MemorySessionStore, SessionStore};
pub use oidc_core::types::{
    AccessOutcome, AuthorizationRequest, LoginOutcome, RejectReason, SessionState, SigningKey,
    SigningKeySet, TokenBundle, UserInfo,
};
pub use oidc_core::verifier::{TokenVerifier, Verification, VerifiedClaims};

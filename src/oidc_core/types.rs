//! Relying-party data model: token bundles, user info, signing keys and the
//! outcomes handed back to the HTTP layer.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use super::error::{OidcError, Result, VerificationError};

/// Tokens obtained from one successful exchange or refresh.
///
/// Replaced wholesale on every exchange, never patched field by field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds, relative to `issued_at`.
    pub expires_in: u64,
    /// Refresh token lifetime in seconds, relative to `issued_at`. Zero means
    /// the provider advertised no expiry.
    pub refresh_expires_in: u64,
    /// Recorded locally when the response arrived; the provider does not echo it.
    pub issued_at: DateTime<Utc>,
}

impl TokenBundle {
    /// `None` when the lifetime does not fit the calendar.
    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        offset(self.issued_at, self.expires_in)
    }

    /// `None` when the provider advertised no expiry, or one past the calendar.
    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        if self.refresh_expires_in == 0 {
            None
        } else {
            offset(self.issued_at, self.refresh_expires_in)
        }
    }

    /// True once the advertised refresh lifetime has elapsed.
    pub fn refresh_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expires_at().is_some_and(|at| now >= at)
    }
}

fn offset(issued_at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = ChronoDuration::try_seconds(i64::try_from(secs).ok()?)?;
    issued_at.checked_add_signed(delta)
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("id_token", &"***")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Converts to a bundle; all four token fields must be present and non-empty.
    pub fn into_bundle(self, issued_at: DateTime<Utc>) -> Result<TokenBundle> {
        fn field(value: Option<String>, name: &str) -> Result<String> {
            match value {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(OidcError::Protocol(format!("token response is missing {}", name))),
            }
        }
        fn lifetime(issued_at: DateTime<Utc>, value: Option<u64>, name: &str) -> Result<u64> {
            let secs = value.unwrap_or(0);
            match offset(issued_at, secs) {
                Some(_) => Ok(secs),
                None => Err(OidcError::Protocol(format!("token response has an out of range {}", name))),
            }
        }
        Ok(TokenBundle {
            access_token: field(self.access_token, "access_token")?,
            refresh_token: field(self.refresh_token, "refresh_token")?,
            id_token: field(self.id_token, "id_token")?,
            token_type: field(self.token_type, "token_type")?,
            expires_in: lifetime(issued_at, self.expires_in, "expires_in")?,
            refresh_expires_in: lifetime(issued_at, self.refresh_expires_in, "refresh_expires_in")?,
            issued_at,
        })
    }
}

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// One entry of the provider's JWKS document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey {
    #[serde(rename = "kid", default)]
    pub key_id: Option<String>,
    #[serde(rename = "alg", default)]
    pub algorithm: Option<String>,
    pub kty: String,
    #[serde(rename = "use", default)]
    pub key_use: Option<String>,
    /// RSA modulus, base64url.
    #[serde(default)]
    pub n: Option<String>,
    /// RSA exponent, base64url.
    #[serde(default)]
    pub e: Option<String>,
}

impl SigningKey {
    fn matches_algorithm(&self, alg: Algorithm) -> bool {
        self.algorithm.as_deref() == Some(algorithm_name(alg))
            && self.key_use.as_deref().is_none_or(|u| u == "sig")
    }

    /// RSA components, or an error when the key cannot verify RSA signatures.
    pub fn rsa_components(&self) -> std::result::Result<(&str, &str), VerificationError> {
        match (self.kty.as_str(), self.n.as_deref(), self.e.as_deref()) {
            ("RSA", Some(n), Some(e)) => Ok((n, e)),
            _ => Err(VerificationError::InvalidKey(format!(
                "key {:?} is not a complete RSA key",
                self.key_id
            ))),
        }
    }
}

/// The provider's public signing keys. Soft state, never ground truth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeySet {
    pub keys: Vec<SigningKey>,
}

impl SigningKeySet {
    /// Picks the key used to verify a token signed with `alg`.
    ///
    /// Only keys advertising `alg` are candidates. Among those the one named by
    /// the token's `kid` wins; without a `kid` (or a match) the first candidate
    /// is used. No candidate at all is a configuration error.
    pub fn select(&self, alg: Algorithm, kid: Option<&str>) -> Result<&SigningKey> {
        let mut candidates = self.keys.iter().filter(|k| k.matches_algorithm(alg)).peekable();
        let first = *candidates.peek().ok_or_else(|| {
            OidcError::Configuration(format!("provider publishes no {} signing key", algorithm_name(alg)))
        })?;
        if let Some(kid) = kid {
            if let Some(found) = candidates.find(|k| k.key_id.as_deref() == Some(kid)) {
                return Ok(found);
            }
        }
        Ok(first)
    }
}

pub(crate) fn algorithm_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::HS256 => "HS256",
        Algorithm::HS384 => "HS384",
        Algorithm::HS512 => "HS512",
        Algorithm::ES256 => "ES256",
        Algorithm::ES384 => "ES384",
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::PS256 => "PS256",
        Algorithm::PS384 => "PS384",
        Algorithm::PS512 => "PS512",
        Algorithm::EdDSA => "EdDSA",
    }
}

/// Why a session stopped being authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The provider answered `invalid_grant` / 401 to a code or refresh token.
    GrantRejected,
    /// The stored access token failed verification for a reason other than expiry.
    TokenInvalid(VerificationError),
    /// The token obtained by the single refresh attempt did not verify either.
    RefreshedTokenInvalid,
    /// The refresh token's advertised lifetime has elapsed.
    RefreshTokenExpired,
    /// The userinfo endpoint refused a locally verified token.
    UserInfoRejected,
    /// The `state` returned to the callback is not the one issued.
    StateMismatch,
    /// The stored bundle could not be decoded.
    CorruptSession,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GrantRejected => write!(f, "provider rejected the grant"),
            Self::TokenInvalid(err) => write!(f, "access token invalid: {}", err),
            Self::RefreshedTokenInvalid => write!(f, "refreshed access token failed verification"),
            Self::RefreshTokenExpired => write!(f, "refresh token expired"),
            Self::UserInfoRejected => write!(f, "userinfo endpoint rejected the access token"),
            Self::StateMismatch => write!(f, "authorization state mismatch"),
            Self::CorruptSession => write!(f, "stored token bundle is unreadable"),
        }
    }
}

/// Credential state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Authenticated(TokenBundle),
    /// The access token expired; the contained bundle is being refreshed.
    Refreshing(TokenBundle),
    /// Terminal for the session: the bundle is cleared and the caller must re-authenticate.
    Rejected(RejectReason),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::Authenticated(_) => "authenticated",
            Self::Refreshing(_) => "refreshing",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Result of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated(TokenBundle),
    Rejected(RejectReason),
}

/// Result of asking whether a session's caller is authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    Authenticated { access_token: String, user_info: UserInfo },
    /// Never logged in (or logged out).
    NoSession,
    /// Was logged in; the session has been cleared and must re-authenticate.
    Rejected(RejectReason),
}

impl AccessOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// HTTP status for the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Authenticated { .. } => 200,
            Self::NoSession | Self::Rejected(_) => 401,
        }
    }
}

/// Redirect target for starting the authorization-code flow.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

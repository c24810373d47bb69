use std::fmt;

/// Failure taxonomy for everything that talks to the provider or the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OidcError {
    /// The provider rejected a code or refresh token, or a token failed
    /// verification. Terminal for the current attempt.
    InvalidGrant(String),
    /// Transient network, parse or unexpected-status failure. The session is
    /// left untouched and the caller may retry.
    Protocol(String),
    /// Missing or invalid static configuration, or no usable signing key.
    Configuration(String),
    /// The injected session store failed.
    Session(String),
}

impl OidcError {
    /// HTTP status the request boundary should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidGrant(_) => 401,
            Self::Protocol(_) => 502,
            Self::Configuration(_) | Self::Session(_) => 500,
        }
    }

    /// Short machine-readable code, in the spirit of RFC 6749 error codes.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidGrant(_) => "invalid_grant",
            Self::Protocol(_) => "provider_error",
            Self::Configuration(_) => "configuration_error",
            Self::Session(_) => "session_error",
        }
    }

    /// Only protocol and session failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Session(_))
    }
}

impl fmt::Display for OidcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGrant(msg) => write!(f, "Invalid grant: {}", msg),
            Self::Protocol(msg) => write!(f, "Provider protocol error: {}", msg),
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Session(msg) => write!(f, "Session store error: {}", msg),
        }
    }
}

impl std::error::Error for OidcError {}

impl From<serde_json::Error> for OidcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed JSON: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for OidcError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Self::Protocol("request to provider timed out".to_string())
    }
}

/// Hard token verification failures. Expiry is deliberately absent: an expired
/// token is a normal [`Verification`](super::verifier::Verification) outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// Not a structurally valid JWT, or the header algorithm is not the required one.
    Malformed(String),
    /// Signature does not match the selected key.
    BadSignature,
    /// `iss` differs from the configured issuer.
    IssuerMismatch { expected: String, actual: String },
    /// A claim needed for the decision is absent.
    MissingClaim(&'static str),
    /// The selected JWK cannot be turned into a verification key.
    InvalidKey(String),
    /// The key set has no key for the required algorithm. A configuration
    /// problem, never a reason to skip verification.
    NoSigningKey(String),
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed token: {}", msg),
            Self::BadSignature => write!(f, "token signature is invalid"),
            Self::IssuerMismatch { expected, actual } => {
                write!(f, "issuer mismatch: expected '{}', got '{}'", expected, actual)
            }
            Self::MissingClaim(claim) => write!(f, "missing claim: {}", claim),
            Self::InvalidKey(msg) => write!(f, "signing key unusable: {}", msg),
            Self::NoSigningKey(msg) => write!(f, "no usable signing key: {}", msg),
        }
    }
}

impl std::error::Error for VerificationError {}

impl From<VerificationError> for OidcError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::NoSigningKey(msg) => Self::Configuration(msg),
            other => Self::InvalidGrant(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OidcError>;

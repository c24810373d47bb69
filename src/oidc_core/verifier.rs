//! Bearer token verification against the provider's key set.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;

use super::error::VerificationError;
use super::types::{SigningKeySet, algorithm_name};

/// Claims of a token whose signature checked out.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedClaims {
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Outcome of a verification that did not hit a hard failure.
#[derive(Debug, Clone)]
pub enum Verification {
    Valid(VerifiedClaims),
    /// Signature and issuer are fine but `exp` is not in the future. The only
    /// outcome that justifies a refresh.
    Expired { expired_at: i64 },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid(_))
    }
}

/// Checks signature, then issuer, then expiry.
///
/// Audience is not validated: the provider issues tokens for a single
/// audience in this deployment. Re-enable it before sharing a provider
/// between several relying parties.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    algorithm: Algorithm,
}

impl TokenVerifier {
    pub fn new(algorithm: Algorithm) -> Self {
        TokenVerifier { algorithm }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn verify(
        &self,
        token: &str,
        keyset: &SigningKeySet,
        expected_issuer: &str,
    ) -> Result<Verification, VerificationError> {
        self.verify_at(token, keyset, expected_issuer, Utc::now().timestamp())
    }

    /// [`TokenVerifier::verify`] against an explicit clock (unix seconds).
    pub fn verify_at(
        &self,
        token: &str,
        keyset: &SigningKeySet,
        expected_issuer: &str,
        now: i64,
    ) -> Result<Verification, VerificationError> {
        let header = decode_header(token).map_err(|e| VerificationError::Malformed(e.to_string()))?;
        if header.alg != self.algorithm {
            return Err(VerificationError::Malformed(format!(
                "token signed with {}, expected {}",
                algorithm_name(header.alg),
                algorithm_name(self.algorithm)
            )));
        }

        let key = keyset
            .select(self.algorithm, header.kid.as_deref())
            .map_err(|e| VerificationError::NoSigningKey(e.to_string()))?;
        let (n, e) = key.rsa_components()?;
        let decoding_key =
            DecodingKey::from_rsa_components(n, e).map_err(|err| VerificationError::InvalidKey(err.to_string()))?;

        // Only the signature is checked by the library; claims are checked below
        // so that expiry stays distinguishable from every other failure.
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let data = decode::<VerifiedClaims>(token, &decoding_key, &validation).map_err(|err| match err.kind() {
            ErrorKind::InvalidSignature => VerificationError::BadSignature,
            ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => VerificationError::InvalidKey(err.to_string()),
            _ => VerificationError::Malformed(err.to_string()),
        })?;
        let claims = data.claims;

        let issuer = claims.iss.as_deref().ok_or(VerificationError::MissingClaim("iss"))?;
        if issuer != expected_issuer {
            return Err(VerificationError::IssuerMismatch {
                expected: expected_issuer.to_string(),
                actual: issuer.to_string(),
            });
        }

        let exp = claims.exp.ok_or(VerificationError::MissingClaim("exp"))?;
        if exp > now {
            Ok(Verification::Valid(claims))
        } else {
            Ok(Verification::Expired { expired_at: exp })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const ISSUER: &str = "https://idp.local/realms/demo";
    const PROVIDER_PEM: &[u8] = include_bytes!("../../tests/fixtures/provider_rsa.pem");
    const FORGER_PEM: &[u8] = include_bytes!("../../tests/fixtures/forger_rsa.pem");
    const JWKS: &str = include_str!("../../tests/fixtures/jwks.json");

    fn keyset() -> SigningKeySet {
        serde_json::from_str(JWKS).unwrap()
    }

    fn mint(pem: &[u8], claims: serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("provider-rs256".to_string());
        encode(&header, &claims, &EncodingKey::from_rsa_pem(pem).unwrap()).unwrap()
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(Algorithm::RS256)
    }

    #[test]
    fn test_valid_until_exp() {
        let now = 1_700_000_000;
        let token = mint(PROVIDER_PEM, json!({"iss": ISSUER, "sub": "u-1", "exp": now + 300}));
        let outcome = verifier().verify_at(&token, &keyset(), ISSUER, now).unwrap();
        match outcome {
            Verification::Valid(claims) => assert_eq!(claims.sub.as_deref(), Some("u-1")),
            other => panic!("expected valid, got {:?}", other),
        }
        assert!(verifier().verify_at(&token, &keyset(), ISSUER, now + 299).unwrap().is_valid());
        // Expiry must be strictly in the future; no clock skew allowance.
        assert!(matches!(
            verifier().verify_at(&token, &keyset(), ISSUER, now + 300).unwrap(),
            Verification::Expired { expired_at } if expired_at == now + 300
        ));
    }

    #[test]
    fn test_audience_is_not_enforced() {
        let now = Utc::now().timestamp();
        let token = mint(PROVIDER_PEM, json!({"iss": ISSUER, "aud": "some-other-client", "exp": now + 60}));
        assert!(verifier().verify(&token, &keyset(), ISSUER).unwrap().is_valid());
    }

    #[test]
    fn test_forged_signature_is_hard_failure() {
        let now = Utc::now().timestamp();
        let forged = mint(FORGER_PEM, json!({"iss": ISSUER, "exp": now - 10}));
        // Even an expired forgery must not look like a plain expiry.
        assert_eq!(verifier().verify(&forged, &keyset(), ISSUER).unwrap_err(), VerificationError::BadSignature);
    }

    #[test]
    fn test_tampered_payload_is_hard_failure() {
        let now = Utc::now().timestamp();
        let token = mint(PROVIDER_PEM, json!({"iss": ISSUER, "sub": "alice", "exp": now + 60}));
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let forged_payload = json!({"iss": ISSUER, "sub": "mallory", "exp": now + 60});
        parts[1] = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            serde_json::to_vec(&forged_payload).unwrap(),
        );
        let tampered = parts.join(".");
        assert_eq!(verifier().verify(&tampered, &keyset(), ISSUER).unwrap_err(), VerificationError::BadSignature);
    }

    #[test]
    fn test_issuer_checked_after_signature() {
        let now = Utc::now().timestamp();
        let token = mint(PROVIDER_PEM, json!({"iss": "https://evil.local", "exp": now + 60}));
        assert!(matches!(
            verifier().verify(&token, &keyset(), ISSUER).unwrap_err(),
            VerificationError::IssuerMismatch { .. }
        ));
        let no_iss = mint(PROVIDER_PEM, json!({"exp": now + 60}));
        assert_eq!(verifier().verify(&no_iss, &keyset(), ISSUER).unwrap_err(), VerificationError::MissingClaim("iss"));
        let no_exp = mint(PROVIDER_PEM, json!({"iss": ISSUER}));
        assert_eq!(verifier().verify(&no_exp, &keyset(), ISSUER).unwrap_err(), VerificationError::MissingClaim("exp"));
    }

    #[test]
    fn test_malformed_and_wrong_algorithm() {
        assert!(matches!(
            verifier().verify("not-a-jwt", &keyset(), ISSUER).unwrap_err(),
            VerificationError::Malformed(_)
        ));
        let hs = encode(
            &Header::new(Algorithm::HS256),
            &json!({"iss": ISSUER, "exp": Utc::now().timestamp() + 60}),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(verifier().verify(&hs, &keyset(), ISSUER).unwrap_err(), VerificationError::Malformed(_)));
    }

    #[test]
    fn test_missing_signing_key_is_configuration_error() {
        let token = mint(PROVIDER_PEM, json!({"iss": ISSUER, "exp": Utc::now().timestamp() + 60}));
        let only_hmac = SigningKeySet { keys: keyset().keys.into_iter().filter(|k| k.kty != "RSA").collect() };
        let err = verifier().verify(&token, &only_hmac, ISSUER).unwrap_err();
        assert!(matches!(err, VerificationError::NoSigningKey(_)));
        assert!(matches!(crate::OidcError::from(err), crate::OidcError::Configuration(_)));
    }
}

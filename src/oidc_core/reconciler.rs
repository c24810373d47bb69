//! Session credential state machine.
//!
//! Every operation that can change a session's token bundle runs under that
//! session's lock, so concurrent requests either observe one refresh or wait
//! for it. Only the userinfo call happens outside the lock.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, instrument, warn};

use super::config::OidcConfig;
use super::error::{OidcError, Result, VerificationError};
use super::exchange::TokenExchangeClient;
use super::guard::SessionLocks;
use super::http_client::OidcHttpClient;
use super::jwks::{JwksFetcher, KeyFreshness, KeySource};
use super::session::SessionStore;
use super::types::{AccessOutcome, AuthorizationRequest, LoginOutcome, RejectReason, SessionState, TokenBundle};
use super::verifier::{TokenVerifier, Verification};

type Checked = std::result::Result<Verification, VerificationError>;

/// Resting states of [`CredentialReconciler::reconcile`].
enum Settled {
    Authenticated(TokenBundle),
    NoSession,
    Rejected(RejectReason),
}

/// Drives login, access checks and logout for sessions held in `S`.
pub struct CredentialReconciler<C: OidcHttpClient, S: SessionStore> {
    config: Arc<OidcConfig>,
    client: TokenExchangeClient<C>,
    keys: KeySource<C>,
    verifier: TokenVerifier,
    store: Arc<S>,
    locks: SessionLocks,
}

impl<C: OidcHttpClient, S: SessionStore> Clone for CredentialReconciler<C, S> {
    fn clone(&self) -> Self {
        CredentialReconciler {
            config: self.config.clone(),
            client: self.client.clone(),
            keys: self.keys.clone(),
            verifier: self.verifier.clone(),
            store: self.store.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<C: OidcHttpClient, S: SessionStore> CredentialReconciler<C, S> {
    pub fn new(config: OidcConfig, http: C, store: S) -> Self {
        let config = Arc::new(config);
        let client = TokenExchangeClient::new(config.clone(), http.clone());
        let fetcher = JwksFetcher::new(http, config.jwks_uri().as_str(), config.request_timeout());
        let keys = KeySource::new(fetcher, config.jwks_ttl());
        let verifier = TokenVerifier::new(config.signing_algorithm());
        CredentialReconciler { config, client, keys, verifier, store: Arc::new(store), locks: SessionLocks::new() }
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    pub fn client(&self) -> &TokenExchangeClient<C> {
        &self.client
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Issues a fresh `state`, remembers it in the session and returns the
    /// provider redirect.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_login(&self, session_id: &str) -> Result<AuthorizationRequest> {
        let mut buf = [0u8; 32];
        SystemRandom::new()
            .fill(&mut buf)
            .map_err(|_| OidcError::Configuration("system random source unavailable".into()))?;
        let state = URL_SAFE_NO_PAD.encode(buf);

        let _guard = self.locks.lock(session_id).await;
        self.store.set_field(session_id, &self.config.state_key(), state.clone()).await?;
        Ok(AuthorizationRequest { url: self.client.authorization_url(&state), state })
    }

    /// Callback half of [`start_login`](Self::start_login). The stored state is
    /// consumed whether or not it matches.
    #[instrument(skip(self, code, state), level = "debug")]
    pub async fn complete_login(&self, session_id: &str, code: &str, state: &str) -> Result<LoginOutcome> {
        let _guard = self.locks.lock(session_id).await;
        let state_key = self.config.state_key();
        let expected = self.store.get_field(session_id, &state_key).await?;
        self.store.remove_field(session_id, &state_key).await?;
        if expected.as_deref() != Some(state) {
            warn!(session_id, "authorization state mismatch");
            self.discard(session_id).await?;
            return Ok(LoginOutcome::Rejected(RejectReason::StateMismatch));
        }
        self.login_locked(session_id, code).await
    }

    /// Exchanges an authorization code and stores the resulting bundle.
    ///
    /// A refused code clears the session and comes back as `Rejected`.
    /// Provider and transport failures are returned as `Err` and leave the
    /// session as it was, so the caller may retry the whole login.
    #[instrument(skip(self, code), level = "debug")]
    pub async fn begin_login(&self, session_id: &str, code: &str) -> Result<LoginOutcome> {
        let _guard = self.locks.lock(session_id).await;
        self.login_locked(session_id, code).await
    }

    async fn login_locked(&self, session_id: &str, code: &str) -> Result<LoginOutcome> {
        let bundle = match self.client.exchange_authorization_code(code, self.config.redirect_uri().as_str()).await {
            Ok(bundle) => bundle,
            Err(OidcError::InvalidGrant(msg)) => {
                warn!(session_id, error = %msg, "authorization code rejected");
                self.discard(session_id).await?;
                return Ok(LoginOutcome::Rejected(RejectReason::GrantRejected));
            }
            Err(err) => return Err(err),
        };

        // An already expired token is stored anyway; the next access check refreshes it.
        match self.check(&bundle.access_token).await? {
            Ok(_) => {
                self.persist(session_id, &bundle).await?;
                info!(session_id, "session authenticated");
                Ok(LoginOutcome::Authenticated(bundle))
            }
            Err(err) => {
                warn!(session_id, error = %err, "freshly issued access token failed verification");
                self.discard(session_id).await?;
                Ok(LoginOutcome::Rejected(RejectReason::TokenInvalid(err)))
            }
        }
    }

    /// Decides whether the session's caller is authenticated, refreshing an
    /// expired access token at most once, then loads user info with the
    /// resulting token.
    #[instrument(skip(self), level = "debug")]
    pub async fn ensure_authenticated(&self, session_id: &str) -> Result<AccessOutcome> {
        let bundle = {
            let _guard = self.locks.lock(session_id).await;
            match self.reconcile(session_id).await? {
                Settled::Authenticated(bundle) => bundle,
                Settled::NoSession => return Ok(AccessOutcome::NoSession),
                Settled::Rejected(reason) => {
                    warn!(session_id, reason = %reason, "session rejected");
                    self.discard(session_id).await?;
                    return Ok(AccessOutcome::Rejected(reason));
                }
            }
        };

        match self.client.fetch_user_info(&bundle.access_token).await {
            Ok(user_info) => Ok(AccessOutcome::Authenticated { access_token: bundle.access_token, user_info }),
            Err(OidcError::InvalidGrant(msg)) => {
                warn!(session_id, error = %msg, "provider no longer honours the access token");
                let _guard = self.locks.lock(session_id).await;
                // Leave a bundle written by a concurrent refresh alone.
                if self.load_bundle(session_id).await?.as_ref() == Some(&bundle) {
                    self.discard(session_id).await?;
                }
                Ok(AccessOutcome::Rejected(RejectReason::UserInfoRejected))
            }
            Err(err) => Err(err),
        }
    }

    /// Forgets every field of the session. Safe to call repeatedly.
    #[instrument(skip(self), level = "debug")]
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        let _guard = self.locks.lock(session_id).await;
        self.store.clear(session_id).await?;
        info!(session_id, "session ended");
        Ok(())
    }

    /// Checks the bundle's ID token the same way access tokens are checked.
    pub async fn verify_id_token(&self, bundle: &TokenBundle) -> Result<Verification> {
        let (keys, _) = self.keys.current(Some(&bundle.access_token)).await?;
        Ok(self.verifier.verify(&bundle.id_token, &keys, self.config.issuer())?)
    }

    /// Walks the state machine from the stored bundle to a resting state.
    /// Caller holds the session lock.
    async fn reconcile(&self, session_id: &str) -> Result<Settled> {
        let mut state = match self.store.get_field(session_id, &self.config.bundle_key()).await? {
            None => SessionState::NoSession,
            Some(raw) => match serde_json::from_str::<TokenBundle>(&raw) {
                Ok(bundle) => SessionState::Authenticated(bundle),
                Err(err) => {
                    warn!(session_id, error = %err, "stored token bundle is unreadable");
                    SessionState::Rejected(RejectReason::CorruptSession)
                }
            },
        };
        let mut refreshed = false;

        loop {
            debug!(session_id, state = state.name(), "reconciling");
            state = match state {
                SessionState::Authenticated(bundle) => match self.check(&bundle.access_token).await? {
                    Ok(Verification::Valid(_)) => return Ok(Settled::Authenticated(bundle)),
                    Ok(Verification::Expired { expired_at }) if !refreshed => {
                        debug!(session_id, expired_at, "access token expired");
                        SessionState::Refreshing(bundle)
                    }
                    Ok(Verification::Expired { .. }) => SessionState::Rejected(RejectReason::RefreshedTokenInvalid),
                    Err(err) if refreshed => {
                        warn!(session_id, error = %err, "refreshed access token failed verification");
                        SessionState::Rejected(RejectReason::RefreshedTokenInvalid)
                    }
                    Err(err) => SessionState::Rejected(RejectReason::TokenInvalid(err)),
                },
                SessionState::Refreshing(bundle) => {
                    refreshed = true;
                    if bundle.refresh_expired_at(Utc::now()) {
                        SessionState::Rejected(RejectReason::RefreshTokenExpired)
                    } else {
                        match self.client.refresh_token(&bundle.refresh_token).await {
                            Ok(next) => {
                                // The old refresh token is spent; keep the new bundle
                                // even if a later step fails.
                                self.persist(session_id, &next).await?;
                                info!(session_id, "access token refreshed");
                                SessionState::Authenticated(next)
                            }
                            Err(OidcError::InvalidGrant(msg)) => {
                                warn!(session_id, error = %msg, "refresh token rejected");
                                SessionState::Rejected(RejectReason::GrantRejected)
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                SessionState::NoSession => return Ok(Settled::NoSession),
                SessionState::Rejected(reason) => return Ok(Settled::Rejected(reason)),
            };
        }
    }

    /// Verifies `token` against the provider keys.
    ///
    /// A signature or key failure against a cached key set is retried once with
    /// a freshly fetched set, which covers provider key rotation. A missing
    /// signing key is a configuration error, not a verdict on the token.
    async fn check(&self, token: &str) -> Result<Checked> {
        let (keys, freshness) = self.keys.current(Some(token)).await?;
        let mut outcome = self.verifier.verify(token, &keys, self.config.issuer());
        if freshness == KeyFreshness::Cached
            && matches!(
                outcome,
                Err(VerificationError::BadSignature | VerificationError::InvalidKey(_) | VerificationError::NoSigningKey(_))
            )
        {
            debug!("verification failed against cached keys, refetching");
            self.keys.invalidate().await;
            let keys = self.keys.refresh(Some(token)).await?;
            outcome = self.verifier.verify(token, &keys, self.config.issuer());
        }
        match outcome {
            Err(VerificationError::NoSigningKey(msg)) => Err(OidcError::Configuration(msg)),
            other => Ok(other),
        }
    }

    async fn load_bundle(&self, session_id: &str) -> Result<Option<TokenBundle>> {
        let raw = self.store.get_field(session_id, &self.config.bundle_key()).await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// Writes the whole bundle as one field.
    async fn persist(&self, session_id: &str, bundle: &TokenBundle) -> Result<()> {
        let raw = serde_json::to_string(bundle)?;
        self.store.set_field(session_id, &self.config.bundle_key(), raw).await
    }

    /// A rejected session is cleared entirely, like a logout.
    async fn discard(&self, session_id: &str) -> Result<()> {
        self.store.clear(session_id).await
    }
}

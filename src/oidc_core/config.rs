//! Relying-party configuration: the provider endpoints and client credential.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use url::Url;

use super::error::{OidcError, Result};

/// Default timeout applied to every outbound call to the provider.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client secret. Never printed; only [`ClientSecret::expose`] reveals it.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientSecret(String);

impl ClientSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        ClientSecret(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret(***)")
    }
}

/// Unvalidated options, as read from the environment or a JSON settings section.
///
/// Every field is optional here so that a missing option is reported by
/// [`OidcSettings::build`] as a configuration error instead of a parse error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub issuer: Option<String>,
    pub redirect_uri: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub jwks_ttl_secs: Option<u64>,
    pub signing_algorithm: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub session_key_prefix: Option<String>,
    /// Set by [`OidcSettings::request_timeout`]; wins over `request_timeout_secs`.
    #[serde(skip)]
    pub request_timeout: Option<Duration>,
    /// Set by [`OidcSettings::jwks_ttl`]; wins over `jwks_ttl_secs`.
    #[serde(skip)]
    pub jwks_ttl: Option<Duration>,
}

impl OidcSettings {
    pub fn client_id(mut self, value: impl Into<String>) -> Self {
        self.client_id = Some(value.into());
        self
    }

    pub fn client_secret(mut self, value: impl Into<String>) -> Self {
        self.client_secret = Some(value.into());
        self
    }

    pub fn issuer(mut self, value: impl Into<String>) -> Self {
        self.issuer = Some(value.into());
        self
    }

    pub fn redirect_uri(mut self, value: impl Into<String>) -> Self {
        self.redirect_uri = Some(value.into());
        self
    }

    pub fn authorization_endpoint(mut self, value: impl Into<String>) -> Self {
        self.authorization_endpoint = Some(value.into());
        self
    }

    pub fn token_endpoint(mut self, value: impl Into<String>) -> Self {
        self.token_endpoint = Some(value.into());
        self
    }

    pub fn userinfo_endpoint(mut self, value: impl Into<String>) -> Self {
        self.userinfo_endpoint = Some(value.into());
        self
    }

    pub fn jwks_uri(mut self, value: impl Into<String>) -> Self {
        self.jwks_uri = Some(value.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Keep fetched key sets for `ttl`. Zero fetches on every verification.
    pub fn jwks_ttl(mut self, ttl: Duration) -> Self {
        self.jwks_ttl = Some(ttl);
        self
    }

    pub fn signing_algorithm(mut self, alg: impl Into<String>) -> Self {
        self.signing_algorithm = Some(alg.into());
        self
    }

    pub fn scopes(mut self, scopes: impl IntoIterator<Item = String>) -> Self {
        self.scopes = Some(scopes.into_iter().collect());
        self
    }

    pub fn session_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_key_prefix = Some(prefix.into());
        self
    }

    /// Validates the options and resolves endpoints against the issuer.
    pub fn build(self) -> Result<OidcConfig> {
        let client_id = required(self.client_id, "client_id")?;
        let client_secret = ClientSecret::new(required(self.client_secret, "client_secret")?);
        let issuer_raw = required(self.issuer, "issuer")?;
        let issuer = parse_absolute(&issuer_raw, "issuer")?;
        let redirect_uri = parse_absolute(&required(self.redirect_uri, "redirect_uri")?, "redirect_uri")?;
        let authorization_endpoint = resolve(
            &issuer,
            &required(self.authorization_endpoint, "authorization_endpoint")?,
            "authorization_endpoint",
        )?;
        let token_endpoint = resolve(&issuer, &required(self.token_endpoint, "token_endpoint")?, "token_endpoint")?;
        let userinfo_endpoint = resolve(
            &issuer,
            &required(self.userinfo_endpoint, "userinfo_endpoint")?,
            "userinfo_endpoint",
        )?;
        let jwks_uri = resolve(&issuer, &required(self.jwks_uri, "jwks_uri")?, "jwks_uri")?;

        let signing_algorithm = match self.signing_algorithm.as_deref() {
            None => Algorithm::RS256,
            Some(name) => parse_algorithm(name)?,
        };
        let request_timeout = match self.request_timeout.or(self.request_timeout_secs.map(Duration::from_secs)) {
            Some(timeout) if timeout.is_zero() => {
                return Err(OidcError::Configuration("request timeout must be positive".into()));
            }
            Some(timeout) => timeout,
            None => DEFAULT_REQUEST_TIMEOUT,
        };
        let jwks_ttl = self.jwks_ttl.or(self.jwks_ttl_secs.map(Duration::from_secs)).unwrap_or(Duration::ZERO);
        let scopes = match self.scopes {
            Some(scopes) if !scopes.is_empty() => scopes,
            _ => vec!["openid".to_string()],
        };

        Ok(OidcConfig {
            client_id,
            client_secret,
            // `iss` claims carry the issuer exactly as configured, so keep the raw string.
            issuer: issuer_raw,
            redirect_uri,
            authorization_endpoint,
            token_endpoint,
            userinfo_endpoint,
            jwks_uri,
            request_timeout,
            jwks_ttl,
            signing_algorithm,
            scopes,
            session_key_prefix: self.session_key_prefix.unwrap_or_else(|| "oidc".to_string()),
        })
    }
}

/// Validated relying-party configuration.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    client_id: String,
    client_secret: ClientSecret,
    issuer: String,
    redirect_uri: Url,
    authorization_endpoint: Url,
    token_endpoint: Url,
    userinfo_endpoint: Url,
    jwks_uri: Url,
    request_timeout: Duration,
    jwks_ttl: Duration,
    signing_algorithm: Algorithm,
    scopes: Vec<String>,
    session_key_prefix: String,
}

impl OidcConfig {
    /// Starts from empty settings; see [`OidcSettings::build`].
    pub fn settings() -> OidcSettings {
        OidcSettings::default()
    }

    /// Reads `OIDC_*` environment variables.
    ///
    /// Required: `OIDC_CLIENT_ID`, `OIDC_CLIENT_SECRET`, `OIDC_ISSUER`, `OIDC_REDIRECT_URI`,
    /// `OIDC_AUTHORIZATION_ENDPOINT`, `OIDC_TOKEN_ENDPOINT`, `OIDC_USERINFO_ENDPOINT`,
    /// `OIDC_JWKS_URI`. Optional: `OIDC_REQUEST_TIMEOUT_SECS`, `OIDC_JWKS_TTL_SECS`,
    /// `OIDC_SIGNING_ALGORITHM`, `OIDC_SCOPES` (space separated), `OIDC_SESSION_KEY_PREFIX`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`OidcConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &str| -> Result<Option<u64>> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| OidcError::Configuration(format!("{} must be a number of seconds", name))),
            }
        };
        let settings = OidcSettings {
            client_id: lookup("OIDC_CLIENT_ID"),
            client_secret: lookup("OIDC_CLIENT_SECRET"),
            issuer: lookup("OIDC_ISSUER"),
            redirect_uri: lookup("OIDC_REDIRECT_URI"),
            authorization_endpoint: lookup("OIDC_AUTHORIZATION_ENDPOINT"),
            token_endpoint: lookup("OIDC_TOKEN_ENDPOINT"),
            userinfo_endpoint: lookup("OIDC_USERINFO_ENDPOINT"),
            jwks_uri: lookup("OIDC_JWKS_URI"),
            request_timeout_secs: number("OIDC_REQUEST_TIMEOUT_SECS")?,
            jwks_ttl_secs: number("OIDC_JWKS_TTL_SECS")?,
            signing_algorithm: lookup("OIDC_SIGNING_ALGORITHM"),
            scopes: lookup("OIDC_SCOPES").map(|s| s.split_whitespace().map(str::to_string).collect()),
            session_key_prefix: lookup("OIDC_SESSION_KEY_PREFIX"),
            ..OidcSettings::default()
        };
        settings.build()
    }

    /// Parses a JSON settings object with snake_case keys.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: OidcSettings = serde_json::from_str(json)
            .map_err(|e| OidcError::Configuration(format!("invalid settings document: {}", e)))?;
        settings.build()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &ClientSecret {
        &self.client_secret
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn authorization_endpoint(&self) -> &Url {
        &self.authorization_endpoint
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    pub fn userinfo_endpoint(&self) -> &Url {
        &self.userinfo_endpoint
    }

    pub fn jwks_uri(&self) -> &Url {
        &self.jwks_uri
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn jwks_ttl(&self) -> Duration {
        self.jwks_ttl
    }

    pub fn signing_algorithm(&self) -> Algorithm {
        self.signing_algorithm
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Session key under which the serialized token bundle lives.
    pub fn bundle_key(&self) -> String {
        format!("{}.token_bundle", self.session_key_prefix)
    }

    /// Session key holding the pending authorization `state`.
    pub fn state_key(&self) -> String {
        format!("{}.state", self.session_key_prefix)
    }
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(OidcError::Configuration(format!("{} is required", name))),
    }
}

fn parse_absolute(raw: &str, name: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| OidcError::Configuration(format!("{} is not a valid URL: {}", name, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(OidcError::Configuration(format!("{} uses unsupported scheme '{}'", name, other))),
    }
}

/// Absolute endpoints are taken as-is, anything else is a path below the issuer.
fn resolve(issuer: &Url, raw: &str, name: &str) -> Result<Url> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return parse_absolute(raw, name);
    }
    let mut base = issuer.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(raw.trim_start_matches('/'))
        .map_err(|e| OidcError::Configuration(format!("{} cannot be resolved against issuer: {}", name, e)))
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name.trim().to_ascii_uppercase().as_str() {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "PS256" => Ok(Algorithm::PS256),
        "PS384" => Ok(Algorithm::PS384),
        "PS512" => Ok(Algorithm::PS512),
        other => Err(OidcError::Configuration(format!(
            "signing algorithm '{}' is not supported for provider keys",
            other
        ))),
    }
}

//! Token endpoint and userinfo calls made on behalf of the relying party.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::form_urlencoded;

use super::config::OidcConfig;
use super::error::{OidcError, Result};
use super::http_client::{HttpRequest, HttpResponse, OidcHttpClient};
use super::types::{TokenBundle, TokenResponse, UserInfo};

/// Precomputed `Authorization: Basic ...` value for the client credential.
#[derive(Clone)]
struct BasicAuth(String);

impl BasicAuth {
    /// RFC 6749 section 2.3.1: both parts are form-encoded before base64.
    fn new(client_id: &str, client_secret: &str) -> Self {
        let id: String = form_urlencoded::byte_serialize(client_id.as_bytes()).collect();
        let secret: String = form_urlencoded::byte_serialize(client_secret.as_bytes()).collect();
        BasicAuth(format!("Basic {}", STANDARD.encode(format!("{}:{}", id, secret))))
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Basic ***")
    }
}

/// OAuth2 error body (`{"error": "...", "error_description": "..."}`).
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for the provider's token and userinfo endpoints.
///
/// Every call goes through the same [`OidcHttpClient`] and is bounded by the
/// configured request timeout; a timeout is a [`OidcError::Protocol`].
#[derive(Clone)]
pub struct TokenExchangeClient<C: OidcHttpClient> {
    config: Arc<OidcConfig>,
    http: C,
    basic_auth: BasicAuth,
}

impl<C: OidcHttpClient> fmt::Debug for TokenExchangeClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenExchangeClient")
            .field("config", &self.config)
            .field("basic_auth", &self.basic_auth)
            .finish_non_exhaustive()
    }
}

impl<C: OidcHttpClient> TokenExchangeClient<C> {
    pub fn new(config: Arc<OidcConfig>, http: C) -> Self {
        let basic_auth = BasicAuth::new(config.client_id(), config.client_secret().expose());
        TokenExchangeClient { config, http, basic_auth }
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// Provider authorization URL for starting the code flow.
    pub fn authorization_url(&self, state: &str) -> String {
        let mut url = self.config.authorization_endpoint().clone();
        url.query_pairs_mut()
            .append_pair("client_id", self.config.client_id())
            .append_pair("redirect_uri", self.config.redirect_uri().as_str())
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes().join(" "))
            .append_pair("state", state);
        url.into()
    }

    /// Exchanges an authorization code (`grant_type=authorization_code`).
    ///
    /// `InvalidGrant` when the provider refuses the code (reused, expired or a
    /// different `redirect_uri`); `Protocol` for anything else that goes wrong.
    #[instrument(skip(self, code), level = "debug")]
    pub async fn exchange_authorization_code(&self, code: &str, redirect_uri: &str) -> Result<TokenBundle> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "authorization_code")
            .append_pair("code", code)
            .append_pair("redirect_uri", redirect_uri)
            .finish();
        self.token_request(body, "authorization_code").await
    }

    /// Redeems a refresh token (`grant_type=refresh_token`). The provider
    /// rotates it: the token passed in must not be used again.
    #[instrument(skip_all, level = "debug")]
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenBundle> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .finish();
        self.token_request(body, "refresh_token").await
    }

    /// Bearer-authenticated GET of the userinfo endpoint.
    ///
    /// A 401 here means a token passed local verification but the provider no
    /// longer honours it; that is an `InvalidGrant`, not something to ignore.
    #[instrument(skip_all, level = "debug")]
    pub async fn fetch_user_info(&self, access_token: &str) -> Result<UserInfo> {
        let request = HttpRequest::get(self.config.userinfo_endpoint().as_str())
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Accept", "application/json");
        let response = self.send(request).await?;
        match response.status {
            s if (200..300).contains(&s) => Ok(serde_json::from_slice::<UserInfo>(&response.body)?),
            401 => {
                warn!(status = 401, "userinfo endpoint rejected access token");
                Err(OidcError::InvalidGrant("userinfo endpoint rejected the access token".into()))
            }
            status => Err(OidcError::Protocol(format!("userinfo endpoint answered {}", status))),
        }
    }

    async fn token_request(&self, body: String, grant: &'static str) -> Result<TokenBundle> {
        let request = HttpRequest::post_form(self.config.token_endpoint().as_str(), body.into_bytes())
            .header("Authorization", self.basic_auth.0.clone())
            .header("Accept", "application/json");
        let response = self.send(request).await?;
        if !response.is_success() {
            let err = classify_token_error(&response);
            warn!(grant, status = response.status, error = %err, "token endpoint refused request");
            return Err(err);
        }
        let parsed: TokenResponse = serde_json::from_slice(&response.body)?;
        let bundle = parsed.into_bundle(Utc::now())?;
        debug!(grant, expires_in = bundle.expires_in, "token endpoint issued bundle");
        Ok(bundle)
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let timeout = self.config.request_timeout();
        let request = request.timeout(timeout);
        tokio::time::timeout(timeout, self.http.execute(request))
            .await?
            .map_err(|e| OidcError::Protocol(format!("transport failure: {}", e)))
    }
}

/// 401 and `invalid_grant` are the provider refusing the grant; everything
/// else is a protocol failure.
fn classify_token_error(response: &HttpResponse) -> OidcError {
    let body: ErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
    let description = body
        .error_description
        .clone()
        .or_else(|| body.error.clone())
        .unwrap_or_else(|| format!("status {}", response.status));
    match (response.status, body.error.as_deref()) {
        (401, _) | (_, Some("invalid_grant")) => OidcError::InvalidGrant(description),
        _ => OidcError::Protocol(format!("token endpoint answered {}: {}", response.status, description)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc_core::config::OidcSettings;
    use crate::oidc_core::http_client::InMemoryHttpClient;
    use serde_json::json;
    use std::time::Duration;

    const TOKEN_URL: &str = "https://idp.local/token";
    const USERINFO_URL: &str = "https://idp.local/userinfo";

    fn config() -> Arc<OidcConfig> {
        Arc::new(
            OidcSettings::default()
                .client_id("web app")
                .client_secret("p@ss:word")
                .issuer("https://idp.local")
                .redirect_uri("https://app.local/callback")
                .authorization_endpoint("https://idp.local/auth")
                .token_endpoint(TOKEN_URL)
                .userinfo_endpoint(USERINFO_URL)
                .jwks_uri("https://idp.local/certs")
                .request_timeout(Duration::from_secs(2))
                .build()
                .unwrap(),
        )
    }

    fn token_json() -> serde_json::Value {
        json!({
            "access_token": "AT1",
            "refresh_token": "RT1",
            "id_token": "ID1",
            "token_type": "Bearer",
            "expires_in": 300,
            "refresh_expires_in": 1800,
            "not-before-policy": 0,
            "session_state": "abc"
        })
    }

    #[tokio::test]
    async fn test_code_exchange_sends_basic_auth_and_form() {
        let http = InMemoryHttpClient::new();
        http.insert_response(TOKEN_URL, HttpResponse::json(200, &token_json()));
        let client = TokenExchangeClient::new(config(), http.clone());

        let bundle = client.exchange_authorization_code("CODE", "https://app.local/callback").await.unwrap();
        assert_eq!(bundle.access_token, "AT1");
        assert_eq!(bundle.refresh_token, "RT1");
        assert_eq!(bundle.refresh_expires_in, 1800);

        let sent = http.requests_to(TOKEN_URL);
        assert_eq!(sent.len(), 1);
        let expected = format!("Basic {}", STANDARD.encode("web+app:p%40ss%3Aword"));
        assert_eq!(sent[0].header_value("Authorization"), Some(expected.as_str()));
        let form = sent[0].form_pairs();
        assert!(form.contains(&("grant_type".to_string(), "authorization_code".to_string())));
        assert!(form.contains(&("code".to_string(), "CODE".to_string())));
        assert!(form.contains(&("redirect_uri".to_string(), "https://app.local/callback".to_string())));
        assert!(!form.iter().any(|(k, _)| k == "client_secret"));
    }

    #[tokio::test]
    async fn test_failure_taxonomy() {
        let cases = vec![
            (HttpResponse::new(401, ""), true),
            (HttpResponse::json(400, &json!({"error": "invalid_grant", "error_description": "Code not valid"})), true),
            (HttpResponse::json(400, &json!({"error": "unsupported_grant_type"})), false),
            (HttpResponse::new(503, "down"), false),
            (HttpResponse::new(200, "not json"), false),
        ];
        for (response, is_grant) in cases {
            let http = InMemoryHttpClient::new();
            let status = response.status;
            http.insert_response(TOKEN_URL, response);
            let client = TokenExchangeClient::new(config(), http);
            let err = client.refresh_token("RT").await.unwrap_err();
            if is_grant {
                assert!(matches!(err, OidcError::InvalidGrant(_)), "status {} -> {:?}", status, err);
            } else {
                assert!(matches!(err, OidcError::Protocol(_)), "status {} -> {:?}", status, err);
            }
        }
    }

    #[tokio::test]
    async fn test_incomplete_token_response_is_protocol_error() {
        let mut body = token_json();
        body.as_object_mut().unwrap().remove("id_token");
        let http = InMemoryHttpClient::with_default(HttpResponse::json(200, &body));
        let client = TokenExchangeClient::new(config(), http);
        let err = client.exchange_authorization_code("CODE", "https://app.local/callback").await.unwrap_err();
        assert!(matches!(err, OidcError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_protocol_error() {
        let client = TokenExchangeClient::new(config(), InMemoryHttpClient::new());
        let err = client.refresh_token("RT").await.unwrap_err();
        assert!(matches!(err, OidcError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_userinfo_bearer_and_401() {
        let http = InMemoryHttpClient::new();
        http.insert_response(USERINFO_URL, HttpResponse::json(200, &json!({"sub": "u-1", "email": "u@x.io"})));
        let client = TokenExchangeClient::new(config(), http.clone());
        let info = client.fetch_user_info("AT1").await.unwrap();
        assert_eq!(info.subject, "u-1");
        assert_eq!(http.requests_to(USERINFO_URL)[0].header_value("Authorization"), Some("Bearer AT1"));

        http.insert_response(USERINFO_URL, HttpResponse::new(401, ""));
        assert!(matches!(client.fetch_user_info("AT1").await, Err(OidcError::InvalidGrant(_))));
        http.insert_response(USERINFO_URL, HttpResponse::new(500, ""));
        assert!(matches!(client.fetch_user_info("AT1").await, Err(OidcError::Protocol(_))));
    }

    #[test]
    fn test_authorization_url() {
        let client = TokenExchangeClient::new(config(), InMemoryHttpClient::new());
        let url = url::Url::parse(&client.authorization_url("xyz")).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(url.as_str().starts_with("https://idp.local/auth?"));
        assert!(pairs.contains(&("client_id".to_string(), "web app".to_string())));
        assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
        assert!(pairs.contains(&("scope".to_string(), "openid".to_string())));
        assert!(pairs.contains(&("state".to_string(), "xyz".to_string())));
    }

    #[test]
    fn test_debug_never_prints_credentials() {
        let client = TokenExchangeClient::new(config(), InMemoryHttpClient::new());
        let printed = format!("{:?}", client);
        assert!(!printed.contains("p@ss"));
        assert!(!printed.contains(&STANDARD.encode("web+app:p%40ss%3Aword")));
    }
}

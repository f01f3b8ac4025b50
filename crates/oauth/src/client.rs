//! The OIDC client for one (client id, issuer) pair: discovery, ID token
//! verification, silent refresh and the fallback to interactive login.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::Utc,
    tokio::sync::OnceCell,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    authenticator::Authenticator,
    cache::TokenRefresher,
    discovery::ProviderMetadata,
    error::{Error, Result},
    id_token::{IdTokenVerifier, VerifiedIdToken},
    token::{Claims, TOKEN_VERSION, Token},
    token_endpoint::{AuthStyle, TokenEndpoint, TokenResponse},
};

pub const DEFAULT_SCOPES: &[&str] = &["openid", "offline_access", "email", "groups"];

/// Resolved provider endpoints and the verifier bound to them.
pub(crate) struct Provider {
    pub(crate) metadata: ProviderMetadata,
    pub(crate) verifier: Arc<IdTokenVerifier>,
}

pub struct OidcClientOptions {
    pub scopes: Vec<String>,
    pub auth_style: AuthStyle,
    pub authenticator: Authenticator,
    pub http: Option<reqwest::Client>,
}

impl OidcClientOptions {
    pub fn new(authenticator: Authenticator) -> Self {
        Self {
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            auth_style: AuthStyle::default(),
            authenticator,
            http: None,
        }
    }
}

pub struct OidcClient {
    client_id: String,
    issuer_url: String,
    scopes: Vec<String>,
    http: reqwest::Client,
    endpoint: TokenEndpoint,
    authenticator: Authenticator,
    provider: OnceCell<Provider>,
}

impl OidcClient {
    pub fn new(client_id: &str, issuer_url: &str, options: OidcClientOptions) -> Self {
        let http = options.http.unwrap_or_default();
        Self {
            client_id: client_id.to_string(),
            issuer_url: issuer_url.trim_end_matches('/').to_string(),
            scopes: options.scopes,
            endpoint: TokenEndpoint::new(http.clone(), client_id, options.auth_style),
            http,
            authenticator: options.authenticator,
            provider: OnceCell::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    pub(crate) fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub(crate) fn endpoint(&self) -> &TokenEndpoint {
        &self.endpoint
    }

    /// Discover the provider once per client.
    pub(crate) async fn provider(&self, cancel: &CancellationToken) -> Result<&Provider> {
        let init = self.provider.get_or_try_init(|| async {
            let metadata = ProviderMetadata::discover(&self.http, &self.issuer_url).await?;
            let verifier = IdTokenVerifier::new(
                self.http.clone(),
                metadata.jwks_uri.clone(),
                metadata.issuer.clone(),
                self.client_id.clone(),
            );
            Ok::<_, Error>(Provider {
                metadata,
                verifier: Arc::new(verifier),
            })
        });
        cancel.run_until_cancelled(init).await.ok_or(Error::Cancelled)?
    }

    /// Get a new token for `old`: silently through the refresh grant when
    /// possible, otherwise through the configured interactive login.
    #[tracing::instrument(skip_all, fields(client_id = %self.client_id, issuer = %self.issuer_url))]
    pub async fn refresh_token(&self, old: Option<&Token>, cancel: &CancellationToken) -> Result<Token> {
        if let Some(old) = old.filter(|t| t.refresh_token_usable()) {
            match self.silent_refresh(old, cancel).await {
                Ok(token) => {
                    info!("refreshed token without user interaction");
                    return Ok(token);
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(error = %e, "silent refresh failed, falling back to interactive login"),
            }
        }

        let mut token = self.authenticator.authenticate(self, cancel).await?;
        self.discover_refresh_expiry(&mut token, cancel).await;
        Ok(token)
    }

    async fn silent_refresh(&self, old: &Token, cancel: &CancellationToken) -> Result<Token> {
        let refresh = old.refresh_token.as_deref().unwrap_or_default();
        let provider = self.provider(cancel).await?;
        let response = cancel
            .run_until_cancelled(self.endpoint.refresh(
                &provider.metadata.token_endpoint,
                refresh,
                &self.scopes,
            ))
            .await
            .ok_or(Error::Cancelled)??;
        let mut token = token_from_response(&provider.verifier, response, None, Some(old)).await?;
        self.discover_refresh_expiry(&mut token, cancel).await;
        Ok(token)
    }

    /// Verify the `id_token` carried by a token response. A response without
    /// one yields `None`.
    pub async fn parse_as_id_token(
        &self,
        response: &TokenResponse,
        expected_nonce: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Claims>> {
        let provider = self.provider(cancel).await?;
        Ok(parse_id_token(&provider.verifier, response, expected_nonce)
            .await?
            .map(|v| v.claims))
    }

    /// Best-effort RFC 7662 lookup of the refresh token's expiry.
    async fn discover_refresh_expiry(&self, token: &mut Token, cancel: &CancellationToken) {
        if token.refresh_token_expiry.is_some() {
            return;
        }
        let Some(refresh) = token.refresh_token.clone() else {
            return;
        };
        let Ok(provider) = self.provider(cancel).await else {
            return;
        };
        let Some(url) = provider.metadata.introspection_endpoint.as_deref() else {
            return;
        };
        let lookup = self.endpoint.introspect_refresh_token(url, &refresh);
        match cancel.run_until_cancelled(lookup).await {
            Some(Ok(intro)) if intro.active => {
                token.refresh_token_expiry = intro.expiry();
                debug!(expiry = ?token.refresh_token_expiry, "refresh token expiry discovered");
            },
            // Some providers answer inactive to public clients.
            Some(Ok(_)) => debug!("provider reports refresh token inactive, expiry unknown"),
            Some(Err(e)) => debug!(error = %e, "refresh token introspection failed"),
            None => {},
        }
    }
}

#[async_trait]
impl TokenRefresher for OidcClient {
    async fn refresh_token(&self, old: Option<&Token>, cancel: &CancellationToken) -> Result<Token> {
        OidcClient::refresh_token(self, old, cancel).await
    }
}

pub(crate) async fn parse_id_token(
    verifier: &IdTokenVerifier,
    response: &TokenResponse,
    expected_nonce: Option<&str>,
) -> Result<Option<VerifiedIdToken>> {
    match response.id_token() {
        Some(raw) => Ok(Some(verifier.verify(raw, expected_nonce).await?)),
        None => Ok(None),
    }
}

/// Build a [`Token`] from a token endpoint response.
///
/// With `previous` set (refresh), a response without an ID token keeps the
/// previous ID token and claims, and an unrotated refresh token is carried
/// over. Without it (interactive login) a missing ID token is an error.
pub(crate) async fn token_from_response(
    verifier: &IdTokenVerifier,
    response: TokenResponse,
    expected_nonce: Option<&str>,
    previous: Option<&Token>,
) -> Result<Token> {
    let now = Utc::now();
    let verified = parse_id_token(verifier, &response, expected_nonce).await?;
    let access_expiry = response.expiry_from(now);

    let (id_token, claims, expiry) = match (verified, previous) {
        (Some(v), _) => (
            response.id_token().unwrap_or_default().to_string(),
            v.claims,
            Some(v.expiry),
        ),
        (None, Some(prev)) if !prev.id_token.is_empty() => {
            debug!("provider omitted id_token on refresh, keeping the previous one");
            (prev.id_token.clone(), prev.claims.clone(), access_expiry)
        },
        (None, _) => return Err(Error::MissingIdToken),
    };

    let (refresh_token, refresh_token_expiry) = match response.refresh_token() {
        Some(rotated) => (Some(rotated.to_string()), None),
        None => (
            previous.and_then(|p| p.refresh_token.clone()),
            previous.and_then(|p| p.refresh_token_expiry),
        ),
    };

    Ok(Token {
        version: TOKEN_VERSION,
        id_token,
        access_token: response.access_token,
        refresh_token,
        expiry: expiry.unwrap_or_default(),
        refresh_token_expiry,
        claims,
    })
}

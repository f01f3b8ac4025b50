use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
    url::Url,
};

use {
    super::Prompt,
    crate::{
        browser::{SystemBrowser, UrlOpener},
        callback_server::{CallbackListener, DEFAULT_PORT_RANGE, RedirectHandler},
        client::{OidcClient, token_from_response},
        error::{Error, Result},
        id_token::IdTokenVerifier,
        pkce::OAuthMaterial,
        token::Token,
        token_endpoint::TokenEndpoint,
    },
};

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SUCCESS_MESSAGE: &str = "Login complete";

pub struct AuthCodeOptions {
    /// Inclusive callback port range.
    pub ports: (u16, u16),
    /// How long to wait for the browser redirect.
    pub timeout: Duration,
    pub success_message: String,
    pub opener: Arc<dyn UrlOpener>,
    pub prompt: Prompt,
}

impl Default for AuthCodeOptions {
    fn default() -> Self {
        let prompt = Prompt::default();
        Self {
            ports: DEFAULT_PORT_RANGE,
            timeout: DEFAULT_AUTH_TIMEOUT,
            success_message: DEFAULT_SUCCESS_MESSAGE.to_string(),
            opener: Arc::new(SystemBrowser::new(prompt.clone())),
            prompt,
        }
    }
}

/// Browser login: authorization code with PKCE, redirected to a localhost
/// listener.
pub struct AuthCodeAuthenticator {
    options: AuthCodeOptions,
}

/// Runs inside the callback server once `state` checks out.
struct CodeExchange {
    endpoint: TokenEndpoint,
    token_url: String,
    redirect_uri: String,
    code_verifier: String,
    nonce: String,
    verifier: Arc<IdTokenVerifier>,
    cancel: CancellationToken,
}

#[async_trait]
impl RedirectHandler for CodeExchange {
    type Output = Token;

    async fn exchange(&self, code: String) -> Result<Token> {
        let exchange = async {
            let response = self
                .endpoint
                .exchange_code(&self.token_url, &code, &self.redirect_uri, &self.code_verifier)
                .await?;
            token_from_response(&self.verifier, response, Some(&self.nonce), None).await
        };
        self.cancel
            .run_until_cancelled(exchange)
            .await
            .ok_or(Error::Cancelled)?
    }
}

impl AuthCodeAuthenticator {
    pub fn new(options: AuthCodeOptions) -> Self {
        Self { options }
    }

    #[tracing::instrument(skip_all, fields(client_id = %client.client_id()))]
    pub async fn authenticate(&self, client: &OidcClient, cancel: &CancellationToken) -> Result<Token> {
        let material = OAuthMaterial::generate()?;
        let provider = client.provider(cancel).await?;
        if !provider.metadata.supports_pkce_s256() {
            warn!("provider does not advertise S256 PKCE, trying anyway");
        }

        // Stops an in-flight code exchange once this attempt is over.
        let attempt = cancel.child_token();
        let _stop_exchange = attempt.clone().drop_guard();

        let listener = CallbackListener::bind(self.options.ports).await?;
        let redirect_uri = listener.redirect_uri();
        let handler = CodeExchange {
            endpoint: client.endpoint().clone(),
            token_url: provider.metadata.token_endpoint.clone(),
            redirect_uri: redirect_uri.clone(),
            code_verifier: material.code_verifier.clone(),
            nonce: material.nonce.clone(),
            verifier: Arc::clone(&provider.verifier),
            cancel: attempt.clone(),
        };
        let (server, mut results) = listener.serve(
            material.state.clone(),
            self.options.success_message.clone(),
            handler,
        );

        let url = authorization_url(
            &provider.metadata.authorization_endpoint,
            client.client_id(),
            &redirect_uri,
            client.scopes(),
            &material,
        )?;

        info!(port = server.port(), "opening browser for login");
        if let Err(e) = self.options.opener.open(url.as_str()).await {
            warn!(error = %e, "browser launch failed");
            self.options.prompt.print(&format!(
                "Could not open a browser. Open this URL to continue:\n\n  {url}\n\n"
            ));
        }

        let timeout = self.options.timeout;
        let outcome = tokio::select! {
            biased;
            _ = attempt.cancelled() => Err(Error::Cancelled),
            result = results.recv() => result.unwrap_or_else(|| {
                Err(std::io::Error::other("callback server stopped").into())
            }),
            _ = tokio::time::sleep(timeout) => Err(Error::AuthenticationTimeout(timeout)),
        };
        attempt.cancel();
        server.shutdown().await;
        outcome
    }
}

fn authorization_url(
    endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    material: &OAuthMaterial,
) -> Result<Url> {
    let scope = scopes.join(" ");
    Ok(Url::parse_with_params(endpoint, [
        ("client_id", client_id),
        ("response_type", "code"),
        ("redirect_uri", redirect_uri),
        ("scope", scope.as_str()),
        ("state", material.state.as_str()),
        ("nonce", material.nonce.as_str()),
        ("code_challenge", material.code_challenge.as_str()),
        ("code_challenge_method", "S256"),
    ])?)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::test_support::{
            FailingOpener, FakeIdp, FetchingOpener, SharedBuf, SilentOpener, quiet_prompt,
            test_client,
        },
    };

    fn authenticator(opener: Arc<dyn UrlOpener>, prompt: Prompt, timeout: Duration) -> AuthCodeAuthenticator {
        AuthCodeAuthenticator::new(AuthCodeOptions {
            timeout,
            opener,
            prompt,
            ..AuthCodeOptions::default()
        })
    }

    #[test]
    fn authorization_url_carries_pkce_and_nonce() {
        let material = OAuthMaterial::generate().unwrap();
        let scopes = vec!["openid".to_string(), "email".to_string()];
        let url = authorization_url(
            "https://idp.example.com/v1/authorize",
            "client",
            "http://localhost:49152",
            &scopes,
            &material,
        )
        .unwrap();

        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "http://localhost:49152");
        assert_eq!(params["scope"], "openid email");
        assert_eq!(params["state"], material.state);
        assert_eq!(params["nonce"], material.nonce);
        assert_eq!(params["code_challenge"], material.code_challenge);
        assert_eq!(params["code_challenge_method"], "S256");
        assert!(!params.contains_key("code_verifier"));
    }

    #[tokio::test]
    async fn browser_login_completes() {
        let idp = FakeIdp::start().await;
        let client = test_client(&idp);
        let auth = authenticator(
            Arc::new(FetchingOpener::default()),
            quiet_prompt(),
            Duration::from_secs(10),
        );

        let token = auth.authenticate(&client, &CancellationToken::new()).await.unwrap();
        assert!(token.is_fresh());
        assert!(token.refresh_token.is_some());
        assert_eq!(token.claims.subject, FakeIdp::SUBJECT);
        assert_eq!(idp.calls().authorize, 1);
        assert_eq!(idp.calls().code_exchange, 1);
    }

    #[tokio::test]
    async fn forged_state_never_exchanges_code() {
        let idp = FakeIdp::start().await;
        let client = test_client(&idp);
        let auth = authenticator(
            Arc::new(FetchingOpener::forging_state()),
            quiet_prompt(),
            Duration::from_secs(10),
        );

        let err = auth
            .authenticate(&client, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateMismatch));
        assert_eq!(idp.calls().code_exchange, 0);
    }

    #[tokio::test]
    async fn failed_browser_launch_prints_url_then_times_out() {
        let idp = FakeIdp::start().await;
        let client = test_client(&idp);
        let buf = SharedBuf::default();
        let auth = authenticator(
            Arc::new(FailingOpener),
            Prompt::new(buf.clone(), false),
            Duration::from_millis(300),
        );

        let err = auth
            .authenticate(&client, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationTimeout(_)));
        let printed = buf.contents();
        assert!(printed.contains("Could not open a browser"));
        assert!(printed.contains(&format!("{}/authorize?", idp.issuer())));
    }

    #[tokio::test]
    async fn cancellation_releases_callback_port() {
        let idp = FakeIdp::start().await;
        let client = test_client(&idp);
        let auth = authenticator(Arc::new(SilentOpener), quiet_prompt(), Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let err = auth.authenticate(&client, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(idp.calls().code_exchange, 0);
    }
}

//! `get_token`: storage selection, client construction and the cache, wired
//! together for one (client id, issuer) pair.

use std::{path::PathBuf, sync::Arc, time::Duration};

use {async_trait::async_trait, tokio_util::sync::CancellationToken, tracing::info};

use crate::{
    authenticator::{
        AuthCodeAuthenticator, AuthCodeOptions, Authenticator, DeviceGrantAuthenticator,
        DeviceGrantOptions, Prompt,
        auth_code::{DEFAULT_AUTH_TIMEOUT, DEFAULT_SUCCESS_MESSAGE},
        device::{DEFAULT_POLL_INTERVAL, DEFAULT_SLOW_DOWN_INCREMENT},
    },
    browser::{SystemBrowser, UrlOpener},
    cache::{Cache, TokenRefresher},
    callback_server::DEFAULT_PORT_RANGE,
    client::{DEFAULT_SCOPES, OidcClient, OidcClientOptions},
    error::{Error, Result},
    lock::FileLock,
    storage::{EnvProbe, Storage, StorageKind, StorageParams, open_storage},
    token::Token,
    token_endpoint::AuthStyle,
};

/// Name of the lock file shared by every invocation on this machine.
pub const LOCK_FILE_NAME: &str = "cloudlogin-token.lock";

/// Interactive login strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Flow {
    /// Authorization code with PKCE through the default browser.
    #[default]
    Browser,
    /// Device authorization grant for headless sessions.
    Device,
}

pub struct GetTokenOptions {
    pub flow: Flow,
    pub success_message: String,
    pub scopes: Vec<String>,
    pub auth_style: AuthStyle,
    pub storage: StorageKind,
    pub cache_dir: PathBuf,
    pub lock_path: PathBuf,
    /// Inclusive callback port range for the browser flow.
    pub callback_ports: (u16, u16),
    pub auth_timeout: Duration,
    pub persist_refresh_token_on_disk: bool,
    pub device_poll_interval: Duration,
    pub device_slow_down_increment: Duration,
    pub url_opener: Arc<dyn UrlOpener>,
    pub prompt: Prompt,
    pub env_probe: EnvProbe,
    pub http: Option<reqwest::Client>,
}

impl Default for GetTokenOptions {
    fn default() -> Self {
        let prompt = Prompt::default();
        Self {
            flow: Flow::default(),
            success_message: DEFAULT_SUCCESS_MESSAGE.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            auth_style: AuthStyle::default(),
            storage: StorageKind::default(),
            cache_dir: default_cache_dir(),
            lock_path: std::env::temp_dir().join(LOCK_FILE_NAME),
            callback_ports: DEFAULT_PORT_RANGE,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            persist_refresh_token_on_disk: false,
            device_poll_interval: DEFAULT_POLL_INTERVAL,
            device_slow_down_increment: DEFAULT_SLOW_DOWN_INCREMENT,
            url_opener: Arc::new(SystemBrowser::new(prompt.clone())),
            prompt,
            env_probe: EnvProbe::current(),
            http: None,
        }
    }
}

/// Platform cache directory, e.g. `~/.cache/cloudlogin` on Linux.
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "cloudlogin")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("cloudlogin"))
}

impl GetTokenOptions {
    fn backend(&self, client_id: &str, issuer_url: &str) -> Result<Box<dyn Storage>> {
        open_storage(self.storage, &self.env_probe, &StorageParams {
            client_id: client_id.to_string(),
            issuer_url: issuer_url.to_string(),
            cache_dir: self.cache_dir.clone(),
            persist_refresh_token_on_disk: self.persist_refresh_token_on_disk,
        })
    }

    fn authenticator(&self) -> Authenticator {
        match self.flow {
            Flow::Browser => Authenticator::AuthorizationCode(AuthCodeAuthenticator::new(AuthCodeOptions {
                ports: self.callback_ports,
                timeout: self.auth_timeout,
                success_message: self.success_message.clone(),
                opener: Arc::clone(&self.url_opener),
                prompt: self.prompt.clone(),
            })),
            Flow::Device => Authenticator::DeviceGrant(DeviceGrantAuthenticator::new(DeviceGrantOptions {
                default_interval: self.device_poll_interval,
                slow_down_increment: self.device_slow_down_increment,
                prompt: self.prompt.clone(),
            })),
        }
    }
}

/// A fresh token for `client_id` at `issuer_url`: cached, silently refreshed,
/// or obtained through an interactive login, in that order of preference.
#[tracing::instrument(skip(options, cancel), fields(flow = ?options.flow))]
pub async fn get_token(
    client_id: &str,
    issuer_url: &str,
    options: GetTokenOptions,
    cancel: &CancellationToken,
) -> Result<Token> {
    let storage = options.backend(client_id, issuer_url)?;
    let lock = FileLock::new(&options.lock_path)?;
    let client = OidcClient::new(client_id, issuer_url, OidcClientOptions {
        scopes: options.scopes.clone(),
        auth_style: options.auth_style,
        authenticator: options.authenticator(),
        http: options.http.clone(),
    });
    info!(storage = storage.name(), "resolving token");
    Cache::new(storage, client, lock).read(cancel).await
}

/// The stored token, if any, without refreshing it.
pub async fn cached_token(
    client_id: &str,
    issuer_url: &str,
    options: &GetTokenOptions,
) -> Result<Option<Token>> {
    let storage = options.backend(client_id, issuer_url)?;
    let lock = FileLock::new(&options.lock_path)?;
    Ok(Cache::new(storage, NoRefresh, lock).cached().await)
}

/// Remove the stored token for this pair.
pub async fn logout(client_id: &str, issuer_url: &str, options: &GetTokenOptions) -> Result<()> {
    let storage = options.backend(client_id, issuer_url)?;
    storage.delete().await?;
    info!(storage = storage.name(), "removed cached token");
    Ok(())
}

/// Refresher for read-only cache access; [`Cache::cached`] never calls it.
struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh_token(&self, _old: Option<&Token>, _cancel: &CancellationToken) -> Result<Token> {
        Err(Error::Cancelled)
    }
}

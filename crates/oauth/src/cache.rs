//! Read-through token cache with cross-process refresh serialization.

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    lock::FileLock,
    storage::Storage,
    token::{MarshalOpt, Token, compress, decompress},
};

/// Produces a new token given whatever is currently cached.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_token(&self, old: Option<&Token>, cancel: &CancellationToken) -> Result<Token>;
}

pub struct Cache<R> {
    storage: Box<dyn Storage>,
    refresher: R,
    lock: FileLock,
}

impl<R: TokenRefresher> Cache<R> {
    pub fn new(storage: Box<dyn Storage>, refresher: R, lock: FileLock) -> Self {
        Self {
            storage,
            refresher,
            lock,
        }
    }

    /// A fresh token, from storage when possible.
    #[tracing::instrument(skip_all, fields(storage = self.storage.name()))]
    pub async fn read(&self, cancel: &CancellationToken) -> Result<Token> {
        if let Some(token) = self.cached().await
            && token.is_fresh()
        {
            debug!("using cached token");
            return Ok(token);
        }
        self.refresh(cancel).await
    }

    /// Whatever is stored, fresh or not, without touching the network.
    ///
    /// Unreadable or corrupt entries read as `None`; corrupt ones are purged.
    pub async fn cached(&self) -> Option<Token> {
        let stored = match self.storage.read().await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "token storage unreadable, treating as empty");
                return None;
            },
        };

        match decompress(&stored).and_then(|m| Token::from_string(Some(&m), &[])) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "discarding corrupt cached token");
                if let Err(e) = self.storage.delete().await {
                    debug!(error = %e, "could not purge corrupt cache entry");
                }
                None
            },
        }
    }

    pub async fn purge(&self) -> Result<()> {
        self.storage.delete().await
    }

    async fn refresh(&self, cancel: &CancellationToken) -> Result<Token> {
        let locked = self.lock.with_lock(None, || async {
            // Another process may have refreshed while we waited for the lock.
            let current = self.cached().await;
            if let Some(token) = current.as_ref().filter(|t| t.is_fresh()) {
                debug!("token was refreshed by another process");
                return Ok(token.clone());
            }

            let token = self.refresher.refresh_token(current.as_ref(), cancel).await?;
            if !token.is_fresh() {
                return Err(Error::InvalidFreshToken);
            }
            self.write(&token).await?;
            info!(expiry = %token.expiry, "cached new token");
            Ok(token)
        });
        cancel
            .run_until_cancelled(locked)
            .await
            .ok_or(Error::Cancelled)?
    }

    async fn write(&self, token: &Token) -> Result<()> {
        let opts = self.storage.marshal_opts();
        match self.store(token, &opts).await {
            Err(Error::ValueTooLarge) => {
                warn!(
                    storage = self.storage.name(),
                    "token too large for storage, retrying without the refresh token"
                );
                let mut narrower = opts;
                narrower.push(MarshalOpt::StripRefreshToken);
                self.store(token, &narrower).await
            },
            other => other,
        }
    }

    async fn store(&self, token: &Token, opts: &[MarshalOpt]) -> Result<()> {
        let encoded = compress(&token.marshal(opts)?)?;
        self.storage.set(&encoded).await
    }
}

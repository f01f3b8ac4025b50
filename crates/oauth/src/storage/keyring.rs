use std::sync::Arc;

use {
    async_trait::async_trait,
    keyring::{Entry, Error as KeyringError},
    tracing::{debug, warn},
};

use {
    super::{STORAGE_VERSION, Storage},
    crate::error::{Error, Result},
};

/// Keyring service name all entries are filed under.
pub const KEYRING_SERVICE: &str = "cloudlogin";

/// Narrow seam over the OS credential store so tests can run without one.
pub trait KeyringStore: Send + Sync + 'static {
    fn load(&self, service: &str, account: &str) -> Result<Option<String>, KeyringError>;
    fn save(&self, service: &str, account: &str, value: &str) -> Result<(), KeyringError>;
    /// Returns whether an entry existed.
    fn delete(&self, service: &str, account: &str) -> Result<bool, KeyringError>;
}

/// The platform credential store (Keychain, Credential Manager, Secret Service).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyringStore;

impl KeyringStore for DefaultKeyringStore {
    fn load(&self, service: &str, account: &str) -> Result<Option<String>, KeyringError> {
        match Entry::new(service, account)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, service: &str, account: &str, value: &str) -> Result<(), KeyringError> {
        Entry::new(service, account)?.set_password(value)
    }

    fn delete(&self, service: &str, account: &str) -> Result<bool, KeyringError> {
        match Entry::new(service, account)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(KeyringError::NoEntry) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Token blob kept in the OS keyring. Refresh tokens are persisted as-is.
pub struct KeyringStorage<K: KeyringStore> {
    store: Arc<K>,
    account: String,
}

impl<K: KeyringStore> KeyringStorage<K> {
    pub fn new(store: K, client_id: &str, issuer_url: &str) -> Self {
        Self {
            store: Arc::new(store),
            account: format!("{STORAGE_VERSION} {issuer_url} {client_id}"),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Keyring backends block; keep them off the async workers.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&K, &str) -> Result<T, KeyringError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let account = self.account.clone();
        tokio::task::spawn_blocking(move || op(&store, &account))
            .await?
            .map_err(map_keyring_error)
    }
}

fn map_keyring_error(e: KeyringError) -> Error {
    match e {
        KeyringError::TooLong(attr, limit) => {
            warn!(%attr, limit, "value rejected by keyring as too long");
            Error::ValueTooLarge
        },
        other => Error::Keyring(other),
    }
}

#[async_trait]
impl<K: KeyringStore> Storage for KeyringStorage<K> {
    async fn read(&self) -> Result<Option<String>> {
        self.blocking(|store, account| store.load(KEYRING_SERVICE, account))
            .await
    }

    async fn set(&self, value: &str) -> Result<()> {
        let value = value.to_owned();
        self.blocking(move |store, account| store.save(KEYRING_SERVICE, account, &value))
            .await?;
        debug!(account = %self.account, "stored token in keyring");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let existed = self
            .blocking(|store, account| store.delete(KEYRING_SERVICE, account))
            .await?;
        debug!(account = %self.account, existed, "removed keyring entry");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

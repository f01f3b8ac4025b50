//! Persistence for the encoded token blob.
//!
//! Backends store one opaque string per (client, issuer) pair. Decoding and
//! freshness are the cache's business, not the backend's.

pub mod file;
pub mod keyring;

use std::path::PathBuf;

use {async_trait::async_trait, tracing::debug};

use crate::{error::Result, token::MarshalOpt};

pub use self::{
    file::FileStorage,
    keyring::{DefaultKeyringStore, KeyringStorage, KeyringStore},
};

/// Storage key prefix; bump when the on-disk encoding changes incompatibly.
pub(crate) const STORAGE_VERSION: &str = "v0";

#[async_trait]
pub trait Storage: Send + Sync {
    /// The stored value, or `None` when nothing is stored.
    async fn read(&self) -> Result<Option<String>>;

    async fn set(&self, value: &str) -> Result<()>;

    /// Remove the stored value. Deleting a missing value is not an error.
    async fn delete(&self) -> Result<()>;

    /// Fields this backend refuses to persist.
    fn marshal_opts(&self) -> Vec<MarshalOpt> {
        Vec::new()
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Which backend to use for the token cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageKind {
    /// Keyring when a desktop session is plausible, file otherwise.
    #[default]
    Auto,
    File,
    Keyring,
}

/// Environment facts used to pick a storage backend.
#[derive(Debug, Clone, Default)]
pub struct EnvProbe {
    pub os: &'static str,
    pub vars: Vec<(String, String)>,
    pub proc_version: Option<String>,
}

impl EnvProbe {
    /// Snapshot the current process environment.
    pub fn current() -> Self {
        const KEYS: &[&str] = &[
            "DISPLAY",
            "WAYLAND_DISPLAY",
            "XDG_CURRENT_DESKTOP",
            "DESKTOP_SESSION",
            "WSL_DISTRO_NAME",
            "WSL_INTEROP",
        ];
        let vars = KEYS
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect();
        Self {
            os: std::env::consts::OS,
            vars,
            proc_version: std::fs::read_to_string("/proc/version").ok(),
        }
    }

    fn has(&self, key: &str) -> bool {
        self.vars
            .iter()
            .any(|(k, v)| k == key && !v.trim().is_empty())
    }

    fn is_wsl(&self) -> bool {
        self.has("WSL_DISTRO_NAME")
            || self.has("WSL_INTEROP")
            || self
                .proc_version
                .as_deref()
                .is_some_and(|v| v.to_ascii_lowercase().contains("microsoft"))
    }

    fn has_desktop_session(&self) -> bool {
        ["DISPLAY", "WAYLAND_DISPLAY", "XDG_CURRENT_DESKTOP", "DESKTOP_SESSION"]
            .iter()
            .any(|k| self.has(k))
    }
}

/// Resolve [`StorageKind::Auto`] against the environment.
pub fn detect_backend(probe: &EnvProbe) -> StorageKind {
    let kind = match probe.os {
        "macos" | "windows" => StorageKind::Keyring,
        _ if probe.is_wsl() => StorageKind::File,
        _ if probe.has_desktop_session() => StorageKind::Keyring,
        _ => StorageKind::File,
    };
    debug!(os = probe.os, ?kind, "detected storage backend");
    kind
}

/// Parameters shared by every backend.
#[derive(Debug, Clone)]
pub struct StorageParams {
    pub client_id: String,
    pub issuer_url: String,
    pub cache_dir: PathBuf,
    pub persist_refresh_token_on_disk: bool,
}

/// Build the backend selected by `kind`, resolving `Auto` with `probe`.
pub fn open_storage(
    kind: StorageKind,
    probe: &EnvProbe,
    params: &StorageParams,
) -> Result<Box<dyn Storage>> {
    let kind = match kind {
        StorageKind::Auto => detect_backend(probe),
        other => other,
    };
    Ok(match kind {
        StorageKind::Keyring => Box::new(KeyringStorage::new(
            DefaultKeyringStore,
            &params.client_id,
            &params.issuer_url,
        )),
        StorageKind::File | StorageKind::Auto => Box::new(
            FileStorage::new(&params.cache_dir, &params.client_id, &params.issuer_url)
                .persist_refresh_token(params.persist_refresh_token_on_disk),
        ),
    })
}

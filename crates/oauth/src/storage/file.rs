use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    sha2::{Digest, Sha256},
    tokio::sync::Mutex,
    tracing::debug,
};

use {
    super::{STORAGE_VERSION, Storage},
    crate::{error::Result, token::MarshalOpt},
};

/// Token blob kept in a private file under the cache directory.
///
/// Refresh tokens are stripped before writing unless explicitly allowed,
/// since a plain file offers much weaker protection than an OS keyring.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    persist_refresh_token: bool,
    io: Mutex<()>,
}

impl FileStorage {
    pub fn new(cache_dir: &Path, client_id: &str, issuer_url: &str) -> Self {
        Self {
            path: cache_dir.join(file_key(client_id, issuer_url)),
            persist_refresh_token: false,
            io: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn persist_refresh_token(mut self, persist: bool) -> Self {
        self.persist_refresh_token = persist;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Hex SHA-256 of the versioned (client, issuer) key. Hashing keeps URLs out
/// of file names.
fn file_key(client_id: &str, issuer_url: &str) -> String {
    let digest = Sha256::digest(format!("{STORAGE_VERSION} {client_id} {issuer_url}"));
    format!("{digest:x}")
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self) -> Result<Option<String>> {
        let _io = self.io.lock().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, value: &str) -> Result<()> {
        let _io = self.io.lock().await;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
            set_permissions(dir, 0o700).await?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        set_permissions(&tmp, 0o600).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "wrote token cache file");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let _io = self.io.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn marshal_opts(&self) -> Vec<MarshalOpt> {
        if self.persist_refresh_token {
            Vec::new()
        } else {
            vec![MarshalOpt::StripRefreshToken]
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

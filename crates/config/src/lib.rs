//! Configuration for the `cloudlogin` binary.
//!
//! Loaded once at start-up from a TOML file (explicit path or the platform
//! config directory) and then overridden by `CLOUDLOGIN_*` environment
//! variables. The library crates never read it themselves; the binary maps it
//! onto their option structs.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use {
    anyhow::{Context, Result, bail},
    serde::Deserialize,
    tracing::debug,
};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_PREFIX: &str = "CLOUDLOGIN_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowSetting {
    #[default]
    Browser,
    Device,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageSetting {
    #[default]
    Auto,
    File,
    Keyring,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStyleSetting {
    #[default]
    Params,
    Header,
}

macro_rules! lowercase_from_str {
    ($ty:ty { $($name:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    other => bail!(
                        "invalid value {other:?}, expected one of: {}",
                        [$($name),+].join(", ")
                    ),
                }
            }
        }
    };
}

lowercase_from_str!(FlowSetting { "browser" => FlowSetting::Browser, "device" => FlowSetting::Device });
lowercase_from_str!(StorageSetting {
    "auto" => StorageSetting::Auto,
    "file" => StorageSetting::File,
    "keyring" => StorageSetting::Keyring,
});
lowercase_from_str!(AuthStyleSetting {
    "params" => AuthStyleSetting::Params,
    "header" => AuthStyleSetting::Header,
});

/// Inclusive port range for the browser-login callback listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// `config.toml`. Every key is optional; unset keys fall back to the
/// library defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub client_id: Option<String>,
    pub issuer_url: Option<String>,
    pub flow: FlowSetting,
    pub scopes: Option<Vec<String>>,
    pub storage: StorageSetting,
    pub cache_dir: Option<PathBuf>,
    pub lock_path: Option<PathBuf>,
    pub callback_ports: Option<PortRange>,
    pub auth_timeout_secs: Option<u64>,
    pub success_message: Option<String>,
    pub persist_refresh_token_on_disk: bool,
    pub auth_style: AuthStyleSetting,
}

/// `<config dir>/cloudlogin/config.toml` for the current platform.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "cloudlogin").map(|d| d.config_dir().join(CONFIG_FILE_NAME))
}

impl Config {
    /// Load from `path`, or from [`default_config_path`] when `None`, then
    /// apply environment overrides.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("no config file, using defaults");
                    Self::default()
                },
            },
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `CLOUDLOGIN_*` overrides from `vars`. Unrelated variables are
    /// ignored; empty values are treated as unset.
    pub fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            match name {
                "CLIENT_ID" => self.client_id = Some(value),
                "ISSUER_URL" => self.issuer_url = Some(value),
                "FLOW" => self.flow = value.parse().with_context(|| key.clone())?,
                "STORAGE" => self.storage = value.parse().with_context(|| key.clone())?,
                _ => continue,
            }
            debug!(%key, "config overridden from environment");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ports) = self.callback_ports
            && (ports.start == 0 || ports.start > ports.end)
        {
            bail!("callback_ports must be a non-empty range of non-zero ports, got {ports}");
        }
        if self.auth_timeout_secs == Some(0) {
            bail!("auth_timeout_secs must be greater than zero");
        }
        if let Some(issuer) = &self.issuer_url
            && !(issuer.starts_with("https://") || issuer.starts_with("http://"))
        {
            bail!("issuer_url must be an http(s) URL, got {issuer:?}");
        }
        Ok(())
    }
}

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    anyhow::{Context, Result},
    chrono::Utc,
    clap::{Args, ValueEnum},
    cloudlogin_config::{AuthStyleSetting, Config, FlowSetting, StorageSetting},
    cloudlogin_oauth::{
        AuthStyle, Flow, GetTokenOptions, StorageKind, Token, cached_token, get_token, logout,
    },
    serde_json::json,
    tokio_util::sync::CancellationToken,
    tracing::info,
};

/// Which client and provider to act on. Flags win over config and env.
#[derive(Args, Debug, Clone, Default)]
pub struct Target {
    /// OAuth client identifier.
    #[arg(long)]
    client_id: Option<String>,
    /// OIDC issuer URL.
    #[arg(long)]
    issuer_url: Option<String>,
}

impl Target {
    fn resolve(&self, config: &Config) -> Result<(String, String)> {
        let client_id = self
            .client_id
            .clone()
            .or_else(|| config.client_id.clone())
            .context("no client id: pass --client-id, set CLOUDLOGIN_CLIENT_ID or client_id in the config file")?;
        let issuer_url = self
            .issuer_url
            .clone()
            .or_else(|| config.issuer_url.clone())
            .context("no issuer URL: pass --issuer-url, set CLOUDLOGIN_ISSUER_URL or issuer_url in the config file")?;
        Ok((client_id, issuer_url))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// The raw ID token.
    #[default]
    IdToken,
    /// ID token, access token, expiry and claims as JSON.
    Json,
}

pub async fn token(
    config: &Config,
    target: &Target,
    device: bool,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let (client_id, issuer_url) = target.resolve(config)?;
    let mut options = options_from_config(config);
    if device {
        options.flow = Flow::Device;
    }
    let token = get_token(&client_id, &issuer_url, options, cancel).await?;
    println!("{}", render(&token, format)?);
    Ok(())
}

pub async fn status(config: &Config, target: &Target) -> Result<()> {
    let (client_id, issuer_url) = target.resolve(config)?;
    let cached = cached_token(&client_id, &issuer_url, &options_from_config(config)).await?;
    println!("{}", status_line(cached.as_ref()));
    Ok(())
}

pub async fn logout_command(config: &Config, target: &Target) -> Result<()> {
    let (client_id, issuer_url) = target.resolve(config)?;
    logout(&client_id, &issuer_url, &options_from_config(config)).await?;
    info!(%client_id, %issuer_url, "logged out");
    println!("Logged out.");
    Ok(())
}

pub fn options_from_config(config: &Config) -> GetTokenOptions {
    let mut options = GetTokenOptions {
        flow: match config.flow {
            FlowSetting::Browser => Flow::Browser,
            FlowSetting::Device => Flow::Device,
        },
        storage: match config.storage {
            StorageSetting::Auto => StorageKind::Auto,
            StorageSetting::File => StorageKind::File,
            StorageSetting::Keyring => StorageKind::Keyring,
        },
        auth_style: match config.auth_style {
            AuthStyleSetting::Params => AuthStyle::InParams,
            AuthStyleSetting::Header => AuthStyle::InHeader,
        },
        persist_refresh_token_on_disk: config.persist_refresh_token_on_disk,
        ..GetTokenOptions::default()
    };
    if let Some(scopes) = &config.scopes {
        options.scopes = scopes.clone();
    }
    if let Some(dir) = &config.cache_dir {
        options.cache_dir = dir.clone();
    }
    if let Some(path) = &config.lock_path {
        options.lock_path = absolute(path);
    }
    if let Some(ports) = config.callback_ports {
        options.callback_ports = (ports.start, ports.end);
    }
    if let Some(secs) = config.auth_timeout_secs {
        options.auth_timeout = Duration::from_secs(secs);
    }
    if let Some(message) = &config.success_message {
        options.success_message = message.clone();
    }
    options
}

/// The lock requires an absolute path; resolve relative config values
/// against the working directory.
fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn render(token: &Token, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::IdToken => token.id_token.clone(),
        OutputFormat::Json => serde_json::to_string_pretty(&json!({
            "id_token": token.id_token,
            "access_token": token.access_token,
            "expiry": token.expiry,
            "claims": token.claims,
        }))?,
    })
}

fn status_line(token: Option<&Token>) -> String {
    let Some(token) = token else {
        return "No cached token.".to_string();
    };
    let who = token
        .claims
        .email
        .as_deref()
        .unwrap_or(token.claims.subject.as_str());
    let remaining = token.expiry - Utc::now();
    let validity = if token.is_fresh() {
        format!(
            "valid ({}h {}m remaining)",
            remaining.num_hours(),
            remaining.num_minutes() % 60
        )
    } else if token.refresh_token_usable() {
        "expired (refreshable)".to_string()
    } else {
        "expired".to_string()
    };
    format!("{who} [{validity}]")
}

use {serde::Deserialize, tracing::debug};

use crate::error::{Error, Result};

/// Subset of the OpenID provider metadata document this crate relies on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub device_authorization_endpoint: Option<String>,
    #[serde(default)]
    pub introspection_endpoint: Option<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Fetch `{issuer}/.well-known/openid-configuration` and check that the
    /// document describes the issuer that was asked for.
    #[tracing::instrument(skip_all, fields(issuer = %issuer_url))]
    pub async fn discover(http: &reqwest::Client, issuer_url: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer_url.trim_end_matches('/')
        );
        let response = http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Discovery(format!(
                "{url} returned HTTP {}",
                status.as_u16()
            )));
        }
        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("invalid metadata document: {e}")))?;

        if !same_issuer(&metadata.issuer, issuer_url) {
            return Err(Error::Discovery(format!(
                "issuer mismatch: expected {issuer_url}, provider reports {}",
                metadata.issuer
            )));
        }
        debug!(
            token_endpoint = %metadata.token_endpoint,
            device = metadata.device_authorization_endpoint.is_some(),
            introspection = metadata.introspection_endpoint.is_some(),
            "discovered provider metadata"
        );
        Ok(metadata)
    }

    /// The advertised device authorization endpoint, or the conventional
    /// `{issuer}/v1/device/authorize` when discovery omits it.
    pub fn device_endpoint(&self) -> String {
        self.device_authorization_endpoint.clone().unwrap_or_else(|| {
            format!("{}/v1/device/authorize", self.issuer.trim_end_matches('/'))
        })
    }

    /// An empty list means the provider did not say; assume support.
    pub fn supports_pkce_s256(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self.code_challenge_methods_supported.iter().any(|m| m == "S256")
    }
}

fn same_issuer(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

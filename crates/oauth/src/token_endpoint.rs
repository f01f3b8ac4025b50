//! Form-encoded calls against the provider's token, device-authorization and
//! introspection endpoints.

use {
    chrono::{DateTime, TimeDelta, Utc},
    serde::{Deserialize, de::DeserializeOwned},
    tracing::debug,
};

use crate::error::{Error, Result};

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Where the client identifier travels on token endpoint requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthStyle {
    /// `client_id` form parameter (public clients).
    #[default]
    InParams,
    /// HTTP Basic with the client id as user name and an empty password.
    InHeader,
}

/// Successful token endpoint response.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Access token expiry computed from `expires_in`, if the provider sent a
    /// positive one. Lifetimes past the representable range read as absent.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .filter(|secs| *secs > 0)
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
    }

    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// RFC 8628 §3.2 device authorization response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub interval: Option<u64>,
}

/// RFC 7662 introspection response; only the fields used here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Introspection {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl Introspection {
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }
}

/// Token endpoint client bound to one OAuth client id.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    http: reqwest::Client,
    client_id: String,
    auth_style: AuthStyle,
}

impl TokenEndpoint {
    pub fn new(http: reqwest::Client, client_id: impl Into<String>, auth_style: AuthStyle) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            auth_style,
        }
    }

    pub async fn exchange_code(
        &self,
        token_url: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        self.post_form(token_url, vec![
            ("grant_type", GRANT_AUTHORIZATION_CODE),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    pub async fn refresh(
        &self,
        token_url: &str,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse> {
        let scope = scopes.join(" ");
        let mut form = vec![
            ("grant_type", GRANT_REFRESH_TOKEN),
            ("refresh_token", refresh_token),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        self.post_form(token_url, form).await
    }

    /// One device-code poll. Pending and slow-down answers come back as
    /// [`Error::OAuth`] for the caller to classify.
    pub async fn poll_device_code(&self, token_url: &str, device_code: &str) -> Result<TokenResponse> {
        self.post_form(token_url, vec![
            ("grant_type", GRANT_DEVICE_CODE),
            ("device_code", device_code),
        ])
        .await
    }

    pub async fn request_device_code(
        &self,
        device_url: &str,
        scopes: &[String],
    ) -> Result<DeviceAuthorization> {
        let scope = scopes.join(" ");
        self.post_form(device_url, vec![("scope", scope.as_str())]).await
    }

    pub async fn introspect_refresh_token(
        &self,
        introspection_url: &str,
        refresh_token: &str,
    ) -> Result<Introspection> {
        self.post_form(introspection_url, vec![
            ("token", refresh_token),
            ("token_type_hint", "refresh_token"),
        ])
        .await
    }

    async fn post_form<T: DeserializeOwned>(&self, url: &str, mut form: Vec<(&str, &str)>) -> Result<T> {
        let mut request = self.http.post(url).header(reqwest::header::ACCEPT, "application/json");
        match self.auth_style {
            AuthStyle::InParams => form.push(("client_id", self.client_id.as_str())),
            AuthStyle::InHeader => request = request.basic_auth(&self.client_id, Some("")),
        }

        let response = request.form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let err = parse_error(status.as_u16(), &body);
            debug!(%url, status = status.as_u16(), error = %err, "token endpoint rejected request");
            return Err(err);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn parse_error(status: u16, body: &str) -> Error {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(parsed) => Error::OAuth {
            status,
            error: parsed.error,
            description: parsed.error_description,
        },
        Err(_) => Error::OAuth {
            status,
            error: "unexpected_response".into(),
            description: Some(body.chars().take(200).collect()),
        },
    }
}

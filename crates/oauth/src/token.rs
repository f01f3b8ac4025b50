//! The token value object, its freshness rules and its persisted encoding.

use std::{
    fmt,
    io::{Read, Write},
};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    chrono::{DateTime, Duration, Utc},
    flate2::{Compression, read::GzDecoder, write::GzEncoder},
    serde::{Deserialize, Serialize},
};

use crate::error::{Error, Result};

/// Schema version written into every serialized token.
pub const TOKEN_VERSION: u32 = 0;

/// Tokens expiring within this window are treated as stale so the caller
/// never hands out a token that dies mid-request.
pub const FRESHNESS_SKEW_SECS: i64 = 5 * 60;

/// Claims extracted from a verified ID token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Authentication methods references (`amr`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub amr: Vec<String>,
}

/// Result of a successful login or refresh.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub version: u32,
    pub id_token: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry of the ID/access token, never of the refresh token.
    #[serde(default)]
    pub expiry: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claims: Claims,
}

/// Marshal-time transformations a storage backend may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalOpt {
    /// Drop the refresh token and its expiry before persisting.
    StripRefreshToken,
}

impl MarshalOpt {
    fn apply(self, token: &mut Token) {
        match self {
            Self::StripRefreshToken => {
                token.refresh_token = None;
                token.refresh_token_expiry = None;
            },
        }
    }
}

impl Token {
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry != DateTime::<Utc>::default()
            && self.expiry > now + Duration::seconds(FRESHNESS_SKEW_SECS)
    }

    /// Whether a silent refresh is worth attempting.
    pub fn refresh_token_usable(&self) -> bool {
        let Some(refresh) = self.refresh_token.as_deref() else {
            return false;
        };
        if refresh.is_empty() {
            return false;
        }
        self.refresh_token_expiry.is_none_or(|expiry| expiry > Utc::now())
    }

    /// JSON-encode then base64-encode a copy of the token with `opts` applied.
    pub fn marshal(&self, opts: &[MarshalOpt]) -> Result<String> {
        let mut token = self.clone();
        for opt in opts {
            opt.apply(&mut token);
        }
        let json = serde_json::to_vec(&token).map_err(Error::Marshal)?;
        Ok(STANDARD.encode(json))
    }

    /// Inverse of [`Token::marshal`].
    ///
    /// `None` yields an empty, never-fresh token so that "nothing cached" and
    /// "something cached" flow through the same freshness check.
    pub fn from_string(serialized: Option<&str>, opts: &[MarshalOpt]) -> Result<Self> {
        let Some(serialized) = serialized else {
            return Ok(Self::default());
        };
        let json = STANDARD
            .decode(serialized.trim())
            .map_err(|e| Error::Decode(format!("invalid base64: {e}")))?;
        let mut token: Token = serde_json::from_slice(&json)
            .map_err(|e| Error::Decode(format!("invalid JSON: {e}")))?;
        if token.version != TOKEN_VERSION {
            return Err(Error::Decode(format!(
                "unsupported token version {}",
                token.version
            )));
        }
        for opt in opts {
            opt.apply(&mut token);
        }
        Ok(token)
    }
}

/// Freshness of an optional token; a missing token is never fresh.
pub fn is_fresh(token: Option<&Token>) -> bool {
    token.is_some_and(Token::is_fresh)
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("version", &self.version)
            .field("id_token", &mask(&self.id_token))
            .field("access_token", &mask(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(mask))
            .field("expiry", &self.expiry)
            .field("refresh_token_expiry", &self.refresh_token_expiry)
            .field("claims", &self.claims)
            .finish()
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        format!("<redacted {} bytes>", secret.len())
    }
}

/// Gzip a marshalled token for storage. The compressed bytes are wrapped in
/// base64 so every backend can store the result as a plain string.
pub fn compress(marshalled: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(marshalled.as_bytes())?;
    let bytes = encoder.finish()?;
    Ok(STANDARD.encode(bytes))
}

pub fn decompress(stored: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(stored.trim())
        .map_err(|e| Error::Decode(format!("invalid base64 envelope: {e}")))?;
    let mut out = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut out)
        .map_err(|e| Error::Decode(format!("invalid gzip payload: {e}")))?;
    Ok(out)
}

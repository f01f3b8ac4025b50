//! ID token signature and claim verification against the provider's JWKS.

use {
    chrono::{DateTime, Utc},
    jsonwebtoken::{
        DecodingKey, Validation, decode, decode_header,
        jwk::{Jwk, JwkSet},
    },
    serde::{Deserialize, Deserializer},
    tokio::sync::RwLock,
    tracing::debug,
};

use crate::{
    error::{Error, Result},
    security::constant_time_eq,
    token::Claims,
};

#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    #[serde(default, deserialize_with = "string_or_vec")]
    aud: Vec<String>,
    exp: i64,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    amr: Vec<String>,
}

fn string_or_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// A signature-checked ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdToken {
    pub claims: Claims,
    pub expiry: DateTime<Utc>,
}

/// Verifies ID tokens issued to one client by one issuer.
pub struct IdTokenVerifier {
    http: reqwest::Client,
    jwks_uri: String,
    issuer: String,
    client_id: String,
    keys: RwLock<Option<JwkSet>>,
}

impl IdTokenVerifier {
    pub fn new(
        http: reqwest::Client,
        jwks_uri: impl Into<String>,
        issuer: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            jwks_uri: jwks_uri.into(),
            issuer: issuer.into(),
            client_id: client_id.into(),
            keys: RwLock::new(None),
        }
    }

    /// Check signature, issuer, audience and expiry, then the nonce when one
    /// is expected.
    pub async fn verify(&self, raw: &str, expected_nonce: Option<&str>) -> Result<VerifiedIdToken> {
        let header = decode_header(raw)?;
        let jwk = self.key_for(header.kid.as_deref()).await?;
        let key = DecodingKey::from_jwk(&jwk)?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_issuer(&[self.issuer.as_str()]);
        let claims = decode::<RawClaims>(raw, &key, &validation)?.claims;

        if let Some(expected) = expected_nonce {
            let matches = claims
                .nonce
                .as_deref()
                .is_some_and(|got| constant_time_eq(got, expected));
            if !matches {
                return Err(Error::NonceMismatch);
            }
        }

        Ok(VerifiedIdToken {
            expiry: DateTime::from_timestamp(claims.exp, 0).unwrap_or_default(),
            claims: Claims {
                issuer: claims.iss,
                audience: claims.aud,
                subject: claims.sub,
                name: claims.name,
                email: claims.email,
                amr: claims.amr,
            },
        })
    }

    /// Look up a signing key, refetching the JWKS once when the `kid` is
    /// unknown in case the provider rotated keys.
    async fn key_for(&self, kid: Option<&str>) -> Result<Jwk> {
        if let Some(keys) = self.keys.read().await.as_ref()
            && let Some(jwk) = select_key(keys, kid)
        {
            return Ok(jwk);
        }

        let fetched = self.fetch().await?;
        let found = select_key(&fetched, kid);
        *self.keys.write().await = Some(fetched);
        found.ok_or_else(|| Error::UnknownSigningKey(kid.map(str::to_string)))
    }

    async fn fetch(&self) -> Result<JwkSet> {
        debug!(jwks_uri = %self.jwks_uri, "fetching signing keys");
        let keys = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        Ok(keys)
    }
}

fn select_key(keys: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => keys.find(kid).cloned(),
        // Without a kid only an unambiguous single-key set is usable.
        None if keys.keys.len() == 1 => keys.keys.first().cloned(),
        None => None,
    }
}

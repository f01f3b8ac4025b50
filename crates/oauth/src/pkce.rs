use std::fmt;

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::{TryRngCore, rngs::OsRng},
    sha2::{Digest, Sha256},
};

use crate::error::{Error, Result};

const STATE_BYTES: usize = 32;
const NONCE_BYTES: usize = 32;
const VERIFIER_BYTES: usize = 64;

/// Per-attempt secrets for an interactive login. Never reuse across attempts.
#[derive(Clone)]
pub struct OAuthMaterial {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub code_challenge: String,
}

impl OAuthMaterial {
    /// Draw fresh state, nonce and PKCE verifier from the OS CSPRNG.
    pub fn generate() -> Result<Self> {
        let state = random_url_safe(STATE_BYTES)?;
        let nonce = random_url_safe(NONCE_BYTES)?;
        let code_verifier = random_url_safe(VERIFIER_BYTES)?;
        let code_challenge = code_challenge_s256(&code_verifier);
        Ok(Self {
            state,
            nonce,
            code_verifier,
            code_challenge,
        })
    }
}

impl fmt::Debug for OAuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthMaterial")
            .field("code_challenge", &self.code_challenge)
            .finish_non_exhaustive()
    }
}

/// `base64url(sha256(verifier))` without padding.
pub fn code_challenge_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_url_safe(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Randomness(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

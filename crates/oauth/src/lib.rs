//! OIDC token issuance, caching and refresh.
//!
//! [`get_token`] is the entry point: it returns a cached token while it is
//! fresh, refreshes it silently when a refresh token is available, and falls
//! back to an interactive browser or device login otherwise. Refreshes are
//! serialized across processes through a file lock.

pub mod authenticator;
pub mod browser;
pub mod cache;
pub mod callback_server;
pub mod client;
pub mod discovery;
pub mod error;
pub mod getter;
pub mod id_token;
pub mod lock;
pub mod pkce;
mod security;
pub mod storage;
pub mod token;
pub mod token_endpoint;

#[cfg(test)]
mod test_support;

pub use {
    authenticator::{
        AuthCodeAuthenticator, AuthCodeOptions, Authenticator, DeviceGrantAuthenticator,
        DeviceGrantOptions, Prompt,
    },
    browser::{SystemBrowser, UrlOpener},
    cache::{Cache, TokenRefresher},
    client::{OidcClient, OidcClientOptions},
    error::{Error, Result},
    getter::{Flow, GetTokenOptions, cached_token, get_token, logout},
    lock::FileLock,
    storage::{Storage, StorageKind},
    token::{Claims, Token, is_fresh},
    token_endpoint::AuthStyle,
};

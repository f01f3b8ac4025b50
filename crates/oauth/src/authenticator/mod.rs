//! Interactive login strategies.

pub mod auth_code;
pub mod device;

use std::{
    io::{IsTerminal, Write},
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

pub use self::{
    auth_code::{AuthCodeAuthenticator, AuthCodeOptions},
    device::{DeviceGrantAuthenticator, DeviceGrantOptions},
};
use crate::{client::OidcClient, error::Result, token::Token};

/// The interactive flow used when no usable token or refresh token exists.
pub enum Authenticator {
    AuthorizationCode(AuthCodeAuthenticator),
    DeviceGrant(DeviceGrantAuthenticator),
}

impl Authenticator {
    pub async fn authenticate(&self, client: &OidcClient, cancel: &CancellationToken) -> Result<Token> {
        match self {
            Self::AuthorizationCode(a) => a.authenticate(client, cancel).await,
            Self::DeviceGrant(a) => a.authenticate(client, cancel).await,
        }
    }
}

/// Where user-facing login instructions are written.
#[derive(Clone)]
pub struct Prompt {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    interactive: bool,
}

impl Prompt {
    /// Standard error; stdout stays reserved for command output.
    pub fn stderr() -> Self {
        let interactive = std::io::stderr().is_terminal();
        Self::new(std::io::stderr(), interactive)
    }

    pub fn new(sink: impl Write + Send + 'static, interactive: bool) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
            interactive,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub(crate) fn print(&self, text: &str) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_all(text.as_bytes());
            let _ = sink.flush();
        }
    }
}

impl Default for Prompt {
    fn default() -> Self {
        Self::stderr()
    }
}

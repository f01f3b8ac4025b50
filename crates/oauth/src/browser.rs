use std::process::Command;

use {
    async_trait::async_trait,
    tracing::{debug, warn},
};

use crate::{authenticator::Prompt, error::Result};

/// Opens an authorization URL for the user.
#[async_trait]
pub trait UrlOpener: Send + Sync {
    async fn open(&self, url: &str) -> Result<()>;
}

/// The platform's default browser.
///
/// Launcher output is captured and only written to the prompt when every
/// launcher fails, so a normal login stays quiet.
#[derive(Clone, Default)]
pub struct SystemBrowser {
    prompt: Prompt,
}

impl SystemBrowser {
    pub fn new(prompt: Prompt) -> Self {
        Self { prompt }
    }
}

#[async_trait]
impl UrlOpener for SystemBrowser {
    async fn open(&self, url: &str) -> Result<()> {
        let commands = open::commands(url);
        let prompt = self.prompt.clone();
        tokio::task::spawn_blocking(move || launch(commands, &prompt)).await?
    }
}

/// Try each launcher in turn until one exits successfully.
fn launch(commands: impl IntoIterator<Item = Command>, prompt: &Prompt) -> Result<()> {
    let mut failures = Vec::new();
    for mut command in commands {
        let program = command.get_program().to_string_lossy().into_owned();
        match command.output() {
            Ok(output) if output.status.success() => {
                debug!(%program, "opened browser");
                return Ok(());
            },
            Ok(output) => failures.push(format!(
                "{program} exited with {}\n{}{}",
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            )),
            Err(e) => failures.push(format!("{program}: {e}")),
        }
    }

    warn!(attempts = failures.len(), "could not launch a browser");
    for failure in &failures {
        prompt.print(&format!("{}\n", failure.trim_end()));
    }
    Err(std::io::Error::other("no browser launcher succeeded").into())
}

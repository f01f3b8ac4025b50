use std::time::Duration;

use {
    tokio::time::{Instant, sleep_until},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use {
    super::Prompt,
    crate::{
        client::{OidcClient, token_from_response},
        error::{Error, Result},
        token::Token,
        token_endpoint::DeviceAuthorization,
    },
};

/// Poll interval when the provider does not send one (RFC 8628 §3.2).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Added to the poll interval on every `slow_down` answer.
pub const DEFAULT_SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

const BOX_WIDTH: usize = 62;

pub struct DeviceGrantOptions {
    pub default_interval: Duration,
    pub slow_down_increment: Duration,
    pub prompt: Prompt,
}

impl Default for DeviceGrantOptions {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_POLL_INTERVAL,
            slow_down_increment: DEFAULT_SLOW_DOWN_INCREMENT,
            prompt: Prompt::default(),
        }
    }
}

/// Headless login: show a user code, then poll the token endpoint until the
/// user approves it elsewhere.
pub struct DeviceGrantAuthenticator {
    options: DeviceGrantOptions,
}

enum Poll {
    Pending,
    SlowDown,
}

impl DeviceGrantAuthenticator {
    pub fn new(options: DeviceGrantOptions) -> Self {
        Self { options }
    }

    #[tracing::instrument(skip_all, fields(client_id = %client.client_id()))]
    pub async fn authenticate(&self, client: &OidcClient, cancel: &CancellationToken) -> Result<Token> {
        let provider = client.provider(cancel).await?;
        let device_url = provider.metadata.device_endpoint();
        let auth = cancel
            .run_until_cancelled(client.endpoint().request_device_code(&device_url, client.scopes()))
            .await
            .ok_or(Error::Cancelled)??;

        let deadline = Instant::now()
            .checked_add(Duration::from_secs(auth.expires_in))
            .ok_or_else(|| Error::OAuth {
                status: 200,
                error: "invalid_response".into(),
                description: Some(format!("device code lifetime {}s is out of range", auth.expires_in)),
            })?;
        let mut interval = auth
            .interval
            .filter(|secs| *secs > 0)
            .map_or(self.options.default_interval, Duration::from_secs);
        self.options.prompt.print(&render_instructions(&auth));
        info!(expires_in = auth.expires_in, ?interval, "waiting for device approval");

        let token_url = &provider.metadata.token_endpoint;
        let mut attempt: u32 = 0;
        loop {
            let next = Instant::now()
                .checked_add(interval)
                .map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep_until(next) => {},
            }
            if Instant::now() >= deadline {
                self.finish_countdown();
                return Err(Error::DeviceCodeExpired);
            }

            attempt += 1;
            let poll = client.endpoint().poll_device_code(token_url, &auth.device_code);
            let outcome = cancel
                .run_until_cancelled(poll)
                .await
                .ok_or(Error::Cancelled)?;
            match outcome.map_err(classify) {
                Ok(response) => {
                    self.finish_countdown();
                    return token_from_response(&provider.verifier, response, None, None).await;
                },
                Err(PollError::Continue(Poll::Pending)) => {
                    debug!(attempt, "authorization pending");
                },
                Err(PollError::Continue(Poll::SlowDown)) => {
                    interval = interval.saturating_add(self.options.slow_down_increment);
                    debug!(attempt, ?interval, "provider asked to slow down");
                },
                Err(PollError::Fatal(e)) => {
                    self.finish_countdown();
                    return Err(e);
                },
            }
            self.show_countdown(deadline);
        }
    }

    fn show_countdown(&self, deadline: Instant) {
        if !self.options.prompt.is_interactive() {
            return;
        }
        let left = deadline.saturating_duration_since(Instant::now()).as_secs();
        self.options.prompt.print(&format!(
            "\r  Code expires in {:02}:{:02} ",
            left / 60,
            left % 60
        ));
    }

    fn finish_countdown(&self) {
        if self.options.prompt.is_interactive() {
            self.options.prompt.print("\n");
        }
    }
}

enum PollError {
    Continue(Poll),
    Fatal(Error),
}

fn classify(e: Error) -> PollError {
    match e {
        Error::OAuth {
            status,
            error,
            description,
        } => match error.as_str() {
            "authorization_pending" => PollError::Continue(Poll::Pending),
            "slow_down" => PollError::Continue(Poll::SlowDown),
            "expired_token" => PollError::Fatal(Error::DeviceCodeExpired),
            "access_denied" => PollError::Fatal(Error::AccessDenied),
            _ => PollError::Fatal(Error::OAuth {
                status,
                error,
                description,
            }),
        },
        other => PollError::Fatal(other),
    }
}

fn render_instructions(auth: &DeviceAuthorization) -> String {
    let minutes = auth.expires_in.div_ceil(60);
    let mut lines = vec![
        "To sign in, open this page in a browser:".to_string(),
        String::new(),
        format!("  {}", auth.verification_uri),
        String::new(),
        "and enter the code:".to_string(),
        String::new(),
        format!("  {}", auth.user_code),
        String::new(),
        format!("The code expires in {minutes} minute(s)."),
    ];
    if let Some(complete) = &auth.verification_uri_complete {
        lines.push(String::new());
        lines.push("Or open this link, which includes the code:".to_string());
        lines.push(format!("  {complete}"));
    }

    let border = format!("+{}+\n", "-".repeat(BOX_WIDTH + 2));
    let mut out = border.clone();
    for line in lines {
        out.push_str(&format!("| {line:<BOX_WIDTH$} |\n"));
    }
    out.push_str(&border);
    out
}

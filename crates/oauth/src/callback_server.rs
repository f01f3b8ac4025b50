//! One-shot localhost listener for the authorization-code redirect.
//!
//! The handler validates `state`, runs the code exchange and hands the result
//! to the waiting login through a bounded channel. Only the first redirect
//! carrying a code or an error is processed.

use std::{net::Ipv4Addr, sync::Arc};

use {
    async_trait::async_trait,
    axum::{
        Router,
        extract::{Query, State},
        http::StatusCode,
        response::{Html, IntoResponse, Response},
        routing::get,
    },
    serde::Deserialize,
    tokio::{
        net::TcpListener,
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    security::constant_time_eq,
};

pub const DEFAULT_PORT_RANGE: (u16, u16) = (49152, 49215);

const FAILURE_HTML: &str = "<!doctype html><html><body><h1>Login failed</h1>\
<p>Return to your terminal for details.</p></body></html>";

/// Work done with the authorization code once `state` has been checked.
#[async_trait]
pub trait RedirectHandler: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn exchange(&self, code: String) -> Result<Self::Output>;
}

#[derive(Debug, Default, Deserialize)]
struct RedirectQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct ServerState<H: RedirectHandler> {
    handler: H,
    expected_state: String,
    success_message: String,
    results: Mutex<Option<mpsc::Sender<Result<H::Output>>>>,
}

/// A bound but not yet serving callback port.
pub struct CallbackListener {
    listener: TcpListener,
    port: u16,
}

impl CallbackListener {
    /// Bind the first free port in `ports` (inclusive).
    pub async fn bind(ports: (u16, u16)) -> Result<Self> {
        let (listener, port) = bind_in_range(ports).await?;
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Start serving redirects. Results arrive on the returned receiver.
    pub fn serve<H: RedirectHandler>(
        self,
        expected_state: String,
        success_message: String,
        handler: H,
    ) -> (CallbackServer, mpsc::Receiver<Result<H::Output>>) {
        let Self { listener, port } = self;
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(ServerState {
            handler,
            expected_state,
            success_message,
            results: Mutex::new(Some(tx)),
        });
        let app = Router::new()
            .route("/", get(handle_redirect::<H>))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "callback server error");
            }
            debug!(port, "callback server stopped");
        });
        info!(port, "callback server listening");

        (
            CallbackServer {
                port,
                shutdown: Some(shutdown_tx),
                task: Some(task),
            },
            rx,
        )
    }
}

/// A running callback listener. Dropping it stops the server.
pub struct CallbackServer {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait for in-flight responses.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn bind_in_range((start, end): (u16, u16)) -> Result<(TcpListener, u16)> {
    for port in start..=end {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!(port, error = %e, "callback port unavailable"),
        }
    }
    Err(Error::NoPortAvailable { start, end })
}

async fn handle_redirect<H: RedirectHandler>(
    State(state): State<Arc<ServerState<H>>>,
    Query(query): Query<RedirectQuery>,
) -> Response {
    if query.code.is_none() && query.error.is_none() {
        return (StatusCode::BAD_REQUEST, "missing code").into_response();
    }
    let Some(tx) = state.results.lock().await.take() else {
        return (StatusCode::GONE, "login already completed").into_response();
    };

    let result = process(&state, query).await;
    let page = match &result {
        Ok(_) => (StatusCode::OK, Html(success_page(&state.success_message))),
        Err(e) => {
            warn!(error = %e, "login redirect rejected");
            (StatusCode::BAD_REQUEST, Html(FAILURE_HTML.to_string()))
        },
    };
    if tx.send(result).await.is_err() {
        debug!("login no longer waiting for the redirect");
    }
    page.into_response()
}

async fn process<H: RedirectHandler>(
    state: &ServerState<H>,
    query: RedirectQuery,
) -> Result<H::Output> {
    let got = query.state.as_deref().unwrap_or_default();
    if !constant_time_eq(got, &state.expected_state) {
        return Err(Error::StateMismatch);
    }
    if let Some(error) = query.error {
        return Err(match error.as_str() {
            "access_denied" => Error::AccessDenied,
            _ => Error::AuthorizationFailed {
                error,
                description: query.error_description,
            },
        });
    }
    let code = query.code.unwrap_or_default();
    state.handler.exchange(code).await
}

fn success_page(message: &str) -> String {
    format!(
        "<!doctype html><html><body><h1>{}</h1><p>You can close this window.</p></body></html>",
        escape_html(message)
    )
}

fn escape_html(s: &str) -> String {
    s.chars()
        .fold(String::with_capacity(s.len()), |mut out, c| {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                c => out.push(c),
            }
            out
        })
}

//! In-process OpenID provider and helpers shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    io::Write,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration as StdDuration,
};

use {
    async_trait::async_trait,
    axum::{
        Form, Json, Router,
        extract::{Query, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Redirect, Response},
        routing::{get, post},
    },
    chrono::{Duration, Utc},
    jsonwebtoken::{Algorithm, EncodingKey, Header, encode},
    serde_json::{Value, json},
    tokio::{net::TcpListener, task::JoinHandle},
    url::Url,
};

use crate::{
    authenticator::{
        AuthCodeAuthenticator, AuthCodeOptions, Authenticator, DeviceGrantAuthenticator,
        DeviceGrantOptions, Prompt,
    },
    browser::UrlOpener,
    client::{OidcClient, OidcClientOptions},
    error::Result,
    pkce::code_challenge_s256,
    token::{Claims, TOKEN_VERSION, Token},
};

const KEY_ID: &str = "test-key";
const JWK_N: &str = "0nZfKut9uO8sKrq6N2mQgTgfbaN53et-yLB5lcLQnU7fx7dgycjVU2gA7SoHtuz_Zu2ZruH2Wi6JzJp8jEnKd9nHFX9BNF5ns89zroz8ICf3h18KW0NVStAbnz2smF-tvv-QH1Np9cg04LLRKSWlEO6FZnGcUYkydsGhM_eKlgzvgUSDt8NLx5oOMjDF5Mq9Mwm6SH8M5tXm-n-0rO7svh87j2bcEAzK4UU7n1tAqgwPnNHvdxxk3rkdmUSWBSOqjHui5xmhpOtsbHQMidJcxmze2IjSkwBnEgHUFMegQER1zOq88GF4gU52A2K1ufRWC9vYoB0Z4GmG2aPeVGHmrQ";
const JWK_E: &str = "AQAB";

const ACCESS_TTL_SECS: i64 = 3600;
const REFRESH_TTL_DAYS: i64 = 30;

/// Endpoint hit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Calls {
    pub discovery: usize,
    pub jwks: usize,
    pub authorize: usize,
    /// Every POST to the token endpoint, whatever the grant.
    pub token: usize,
    pub code_exchange: usize,
    pub refresh: usize,
    pub device_authorize: usize,
    pub device_poll: usize,
    pub introspect: usize,
}

impl Calls {
    /// Requests served across all endpoints.
    pub fn total(&self) -> usize {
        self.discovery + self.jwks + self.authorize + self.token + self.device_authorize + self.introspect
    }
}

struct PendingCode {
    nonce: Option<String>,
    challenge: Option<String>,
    redirect_uri: String,
}

struct IdpState {
    issuer: String,
    key: EncodingKey,
    calls: Mutex<Calls>,
    codes: Mutex<HashMap<String, PendingCode>>,
    refresh_tokens: Mutex<HashMap<String, i64>>,
    device_script: Mutex<VecDeque<String>>,
    device_expires_in: AtomicU64,
    device_interval: AtomicU64,
    omit_id_token_on_refresh: AtomicBool,
    reject_refresh: AtomicBool,
    introspection_inactive: AtomicBool,
    last_client_auth: Mutex<Option<String>>,
    serial: AtomicUsize,
}

impl IdpState {
    fn count(&self, f: impl FnOnce(&mut Calls)) {
        if let Ok(mut calls) = self.calls.lock() {
            f(&mut calls);
        }
    }

    fn next(&self) -> usize {
        self.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn sign(&self, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &self.key).unwrap()
    }

    fn standard_claims(&self, nonce: Option<&str>, ttl: Duration) -> Value {
        let now = Utc::now();
        let mut claims = json!({
            "iss": self.issuer,
            "sub": FakeIdp::SUBJECT,
            "aud": FakeIdp::CLIENT_ID,
            "iat": now.timestamp(),
            "exp": (now + ttl).timestamp(),
            "email": FakeIdp::EMAIL,
            "name": FakeIdp::NAME,
            "amr": ["pwd"],
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = json!(nonce);
        }
        claims
    }

    fn register_refresh_token(&self) -> String {
        let token = format!("refresh-{}", self.next());
        let exp = (Utc::now() + Duration::days(REFRESH_TTL_DAYS)).timestamp();
        if let Ok(mut known) = self.refresh_tokens.lock() {
            known.insert(token.clone(), exp);
        }
        token
    }

    fn token_response(&self, nonce: Option<&str>, with_id_token: bool) -> Value {
        let mut body = json!({
            "access_token": format!("access-{}", self.next()),
            "token_type": "Bearer",
            "expires_in": ACCESS_TTL_SECS,
            "refresh_token": self.register_refresh_token(),
            "scope": "openid offline_access email groups",
        });
        if with_id_token {
            let claims = self.standard_claims(nonce, Duration::seconds(ACCESS_TTL_SECS));
            body["id_token"] = json!(self.sign(KEY_ID, &claims));
        }
        body
    }
}

/// A minimal OpenID provider on a random loopback port.
pub(crate) struct FakeIdp {
    addr: SocketAddr,
    state: Arc<IdpState>,
    task: JoinHandle<()>,
}

impl Drop for FakeIdp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeIdp {
    pub const CLIENT_ID: &'static str = "test-client";
    pub const SUBJECT: &'static str = "00u-test-subject";
    pub const EMAIL: &'static str = "dev@example.com";
    pub const NAME: &'static str = "Test User";

    pub async fn start() -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(IdpState {
            issuer: format!("http://{addr}"),
            key: EncodingKey::from_rsa_pem(include_bytes!("testdata/idp_key.pem")).unwrap(),
            calls: Mutex::default(),
            codes: Mutex::default(),
            refresh_tokens: Mutex::default(),
            device_script: Mutex::default(),
            device_expires_in: AtomicU64::new(600),
            device_interval: AtomicU64::new(1),
            omit_id_token_on_refresh: AtomicBool::new(false),
            reject_refresh: AtomicBool::new(false),
            introspection_inactive: AtomicBool::new(false),
            last_client_auth: Mutex::default(),
            serial: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(discovery))
            .route("/keys", get(jwks))
            .route("/authorize", get(authorize))
            .route("/token", post(token))
            .route("/device", post(device_authorize))
            .route("/introspect", post(introspect))
            .with_state(Arc::clone(&state));
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state, task }
    }

    pub fn issuer(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn token_url(&self) -> String {
        format!("{}/token", self.issuer())
    }

    pub fn introspection_url(&self) -> String {
        format!("{}/introspect", self.issuer())
    }

    pub fn calls(&self) -> Calls {
        self.state.calls.lock().map(|c| *c).unwrap_or_default()
    }

    /// How the client identified itself on the last token or introspection
    /// request: `"header"` or `"params"`.
    pub fn last_client_auth(&self) -> Option<String> {
        self.state.last_client_auth.lock().ok().and_then(|a| a.clone())
    }

    pub fn set_omit_id_token_on_refresh(&self, omit: bool) {
        self.state.omit_id_token_on_refresh.store(omit, Ordering::SeqCst);
    }

    pub fn set_reject_refresh(&self, reject: bool) {
        self.state.reject_refresh.store(reject, Ordering::SeqCst);
    }

    /// Answer `active: false` to every introspection request, as providers do
    /// for clients that may not introspect.
    pub fn set_introspection_inactive(&self, inactive: bool) {
        self.state.introspection_inactive.store(inactive, Ordering::SeqCst);
    }

    pub fn set_device_expires_in(&self, secs: u64) {
        self.state.device_expires_in.store(secs, Ordering::SeqCst);
    }

    pub fn set_device_interval(&self, secs: u64) {
        self.state.device_interval.store(secs, Ordering::SeqCst);
    }

    /// Error codes returned by successive device-code polls before the
    /// provider finally issues tokens.
    pub fn script_device_polls(&self, errors: &[&str]) {
        let mut script = self.state.device_script.lock().unwrap();
        script.extend(errors.iter().map(|e| e.to_string()));
    }

    pub fn sign_id_token(&self, nonce: Option<&str>, ttl: Duration) -> String {
        self.state.sign(KEY_ID, &self.state.standard_claims(nonce, ttl))
    }

    pub fn sign_claims(&self, claims: Value) -> String {
        self.state.sign(KEY_ID, &claims)
    }

    pub fn sign_with_kid(&self, kid: &str, ttl: Duration) -> String {
        self.state.sign(kid, &self.state.standard_claims(None, ttl))
    }

    /// An expired token whose refresh token the provider still honours.
    pub fn issue_stale_token(&self) -> Token {
        let expired = Utc::now() - Duration::minutes(10);
        Token {
            version: TOKEN_VERSION,
            id_token: self.sign_id_token(None, Duration::minutes(-10)),
            access_token: format!("access-{}", self.state.next()),
            refresh_token: Some(self.state.register_refresh_token()),
            expiry: expired,
            refresh_token_expiry: None,
            claims: Claims {
                issuer: self.issuer(),
                audience: vec![Self::CLIENT_ID.to_string()],
                subject: Self::SUBJECT.to_string(),
                name: Some(Self::NAME.to_string()),
                email: Some(Self::EMAIL.to_string()),
                amr: vec!["pwd".to_string()],
            },
        }
    }
}

fn oauth_error(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error, "error_description": format!("fake idp: {error}") })))
        .into_response()
}

/// Record and check how the client authenticated.
fn client_authenticated(state: &IdpState, headers: &HeaderMap, form: &HashMap<String, String>) -> bool {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));
    let (style, ok) = if basic {
        ("header", true)
    } else {
        ("params", form.get("client_id").map(String::as_str) == Some(FakeIdp::CLIENT_ID))
    };
    if let Ok(mut last) = state.last_client_auth.lock() {
        *last = Some(style.to_string());
    }
    ok
}

async fn discovery(State(state): State<Arc<IdpState>>) -> Json<Value> {
    state.count(|c| c.discovery += 1);
    let iss = &state.issuer;
    Json(json!({
        "issuer": iss,
        "authorization_endpoint": format!("{iss}/authorize"),
        "token_endpoint": format!("{iss}/token"),
        "jwks_uri": format!("{iss}/keys"),
        "device_authorization_endpoint": format!("{iss}/device"),
        "introspection_endpoint": format!("{iss}/introspect"),
        "code_challenge_methods_supported": ["S256"],
        "grant_types_supported": [
            "authorization_code",
            "refresh_token",
            "urn:ietf:params:oauth:grant-type:device_code",
        ],
    }))
}

async fn jwks(State(state): State<Arc<IdpState>>) -> Json<Value> {
    state.count(|c| c.jwks += 1);
    Json(json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": KEY_ID,
            "n": JWK_N,
            "e": JWK_E,
        }]
    }))
}

async fn authorize(
    State(state): State<Arc<IdpState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.count(|c| c.authorize += 1);
    let Some(redirect_uri) = params.get("redirect_uri") else {
        return (StatusCode::BAD_REQUEST, "missing redirect_uri").into_response();
    };
    if params.get("client_id").map(String::as_str) != Some(FakeIdp::CLIENT_ID)
        || params.get("response_type").map(String::as_str) != Some("code")
    {
        return (StatusCode::BAD_REQUEST, "bad authorization request").into_response();
    }

    let code = format!("code-{}", state.next());
    if let Ok(mut codes) = state.codes.lock() {
        codes.insert(code.clone(), PendingCode {
            nonce: params.get("nonce").cloned(),
            challenge: params.get("code_challenge").cloned(),
            redirect_uri: redirect_uri.clone(),
        });
    }
    let Ok(mut target) = Url::parse(redirect_uri) else {
        return (StatusCode::BAD_REQUEST, "invalid redirect_uri").into_response();
    };
    target
        .query_pairs_mut()
        .append_pair("code", &code)
        .append_pair("state", params.get("state").map(String::as_str).unwrap_or_default());
    Redirect::to(target.as_str()).into_response()
}

async fn token(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.count(|c| c.token += 1);
    if !client_authenticated(&state, &headers, &form) {
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client");
    }
    let field = |name: &str| form.get(name).map(String::as_str).unwrap_or_default();

    match field("grant_type") {
        "authorization_code" => {
            state.count(|c| c.code_exchange += 1);
            let pending = state.codes.lock().ok().and_then(|mut c| c.remove(field("code")));
            let Some(pending) = pending else {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant");
            };
            let challenge_ok = pending
                .challenge
                .as_deref()
                .is_some_and(|c| c == code_challenge_s256(field("code_verifier")));
            if !challenge_ok || pending.redirect_uri != field("redirect_uri") {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant");
            }
            Json(state.token_response(pending.nonce.as_deref(), true)).into_response()
        },
        "refresh_token" => {
            state.count(|c| c.refresh += 1);
            if state.reject_refresh.load(Ordering::SeqCst) {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant");
            }
            let known = state
                .refresh_tokens
                .lock()
                .map(|k| k.contains_key(field("refresh_token")))
                .unwrap_or(false);
            if !known {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant");
            }
            let with_id_token = !state.omit_id_token_on_refresh.load(Ordering::SeqCst);
            Json(state.token_response(None, with_id_token)).into_response()
        },
        "urn:ietf:params:oauth:grant-type:device_code" => {
            state.count(|c| c.device_poll += 1);
            if field("device_code").is_empty() {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_request");
            }
            let scripted = state.device_script.lock().ok().and_then(|mut s| s.pop_front());
            match scripted {
                Some(error) => oauth_error(StatusCode::BAD_REQUEST, &error),
                None => Json(state.token_response(None, true)).into_response(),
            }
        },
        _ => oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type"),
    }
}

async fn device_authorize(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.count(|c| c.device_authorize += 1);
    if !client_authenticated(&state, &headers, &form) {
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client");
    }
    let iss = &state.issuer;
    Json(json!({
        "device_code": format!("device-{}", state.next()),
        "user_code": "WDJB-MJHT",
        "verification_uri": format!("{iss}/activate"),
        "verification_uri_complete": format!("{iss}/activate?user_code=WDJB-MJHT"),
        "expires_in": state.device_expires_in.load(Ordering::SeqCst),
        "interval": state.device_interval.load(Ordering::SeqCst),
    }))
    .into_response()
}

async fn introspect(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.count(|c| c.introspect += 1);
    if !client_authenticated(&state, &headers, &form) {
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client");
    }
    let exp = form
        .get("token")
        .and_then(|t| state.refresh_tokens.lock().ok()?.get(t).copied())
        .filter(|_| !state.introspection_inactive.load(Ordering::SeqCst));
    match exp {
        Some(exp) => Json(json!({ "active": true, "exp": exp })).into_response(),
        None => Json(json!({ "active": false })).into_response(),
    }
}

/// Plays the browser: follows the authorization redirect back to the
/// callback listener, optionally forging `state` on the way.
#[derive(Debug, Clone, Default)]
pub(crate) struct FetchingOpener {
    forge_state: bool,
}

impl FetchingOpener {
    pub fn forging_state() -> Self {
        Self { forge_state: true }
    }
}

#[async_trait]
impl UrlOpener for FetchingOpener {
    async fn open(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        let forge_state = self.forge_state;
        tokio::spawn(async move {
            let http = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap();
            let response = http.get(&url).send().await.unwrap();
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap();
            let mut callback = Url::parse(&location).unwrap();
            if forge_state {
                let pairs: Vec<(String, String)> = callback
                    .query_pairs()
                    .map(|(k, v)| {
                        let v = if k == "state" { "forged".into() } else { v.into_owned() };
                        (k.into_owned(), v)
                    })
                    .collect();
                callback.query_pairs_mut().clear().extend_pairs(pairs);
            }
            let _ = http.get(callback).send().await;
        });
        Ok(())
    }
}

/// A browser the user never looks at.
pub(crate) struct SilentOpener;

#[async_trait]
impl UrlOpener for SilentOpener {
    async fn open(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}

/// No browser available at all.
pub(crate) struct FailingOpener;

#[async_trait]
impl UrlOpener for FailingOpener {
    async fn open(&self, _url: &str) -> Result<()> {
        Err(std::io::Error::other("no display").into())
    }
}

/// Cloneable in-memory prompt sink.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub(crate) fn quiet_prompt() -> Prompt {
    Prompt::new(std::io::sink(), false)
}

pub(crate) fn auth_code_client(idp: &FakeIdp, options: AuthCodeOptions) -> OidcClient {
    let authenticator = Authenticator::AuthorizationCode(AuthCodeAuthenticator::new(options));
    OidcClient::new(FakeIdp::CLIENT_ID, &idp.issuer(), OidcClientOptions::new(authenticator))
}

/// Browser-flow client whose "browser" completes the login immediately.
pub(crate) fn test_client(idp: &FakeIdp) -> OidcClient {
    auth_code_client(idp, AuthCodeOptions {
        timeout: StdDuration::from_secs(10),
        opener: Arc::new(FetchingOpener::default()),
        prompt: quiet_prompt(),
        ..AuthCodeOptions::default()
    })
}

pub(crate) fn test_device_client(idp: &FakeIdp, prompt: Prompt) -> OidcClient {
    let authenticator = Authenticator::DeviceGrant(DeviceGrantAuthenticator::new(DeviceGrantOptions {
        slow_down_increment: StdDuration::from_secs(1),
        prompt,
        ..DeviceGrantOptions::default()
    }));
    OidcClient::new(FakeIdp::CLIENT_ID, &idp.issuer(), OidcClientOptions::new(authenticator))
}

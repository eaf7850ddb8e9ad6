//! HTTP API: POST /login, GET /session, GET /fetch-numbers, GET /fetch-sms, GET /healthz,
//! and GET /metrics when metrics are enabled. Every failure becomes a JSON body.

use crate::client::PanelClient;
use crate::config::Config;
use crate::health;
use crate::login::{self, Credentials, LoginError};
use crate::metrics;
use crate::panel::{self, FetchOutcome};
use crate::session::{SessionHolder, mask_cookie};
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Form, FromRequest, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Largest accepted /login request body.
const LOGIN_BODY_LIMIT: usize = 64 * 1024;

/// Shared state for all handlers.
pub struct AppState {
    pub config: Config,
    pub client: PanelClient,
    pub session: SessionHolder,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, session: SessionHolder) -> anyhow::Result<Self> {
        let client = PanelClient::new(&config)?;
        Ok(Self {
            config,
            client,
            session,
            started_at: Instant::now(),
        })
    }
}

/// Optional credential overrides for POST /login.
#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

/// Body of POST /login (and of the `login` CLI command).
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(rename = "foundFields", skip_serializing_if = "Option::is_none")]
    pub found_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoginResponse {
    fn failure(msg: Option<String>) -> Self {
        Self {
            ok: false,
            msg,
            cookie: None,
            found_fields: None,
            sample: None,
            error: None,
        }
    }
}

/// Body of GET /session.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub cookie: Option<String>,
}

/// Failure body for the proxy endpoints.
#[derive(Debug, Serialize)]
pub struct FetchFailure {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Login body extractor: JSON or form-encoded; empty or other content types mean "no overrides".
pub struct LoginBody(pub LoginRequest);

impl<S> FromRequest<S> for LoginBody
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, LOGIN_BODY_LIMIT)
            .await
            .map_err(|e| bad_request(format!("read request body: {}", e)))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LoginBody(LoginRequest::default()));
        }
        let req = Request::from_parts(parts, Body::from(bytes));
        if content_type.starts_with("application/json") {
            let Json(body) = Json::<LoginRequest>::from_request(req, state)
                .await
                .map_err(|r| bad_request(r.body_text()))?;
            Ok(LoginBody(body))
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(body) = Form::<LoginRequest>::from_request(req, state)
                .await
                .map_err(|r| bad_request(r.body_text()))?;
            Ok(LoginBody(body))
        } else {
            Ok(LoginBody(LoginRequest::default()))
        }
    }
}

fn bad_request(error: String) -> Response {
    let body = FetchFailure {
        ok: false,
        msg: None,
        error: Some(error),
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Run the login flow, store the cookie on success, and shape the response body.
pub async fn login_and_store(
    client: &PanelClient,
    session: &SessionHolder,
    creds: &Credentials,
) -> (StatusCode, LoginResponse) {
    match login::login(client, creds).await {
        Ok(cookie) => {
            let masked = mask_cookie(Some(&cookie));
            session.persist(cookie).await;
            metrics::record_login("success");
            info!(cookie = masked.as_deref().unwrap_or(""), "session stored");
            let body = LoginResponse {
                ok: true,
                msg: Some("Login successful".to_string()),
                cookie: masked,
                ..LoginResponse::failure(None)
            };
            (StatusCode::OK, body)
        }
        Err(e) => {
            metrics::record_login(e.kind());
            warn!(kind = e.kind(), error = %e, "login failed");
            login_error_response(e)
        }
    }
}

fn login_error_response(e: LoginError) -> (StatusCode, LoginResponse) {
    let msg = Some(e.to_string());
    match e {
        LoginError::FieldsNotFound { found_fields } => (
            StatusCode::OK,
            LoginResponse {
                found_fields: Some(found_fields),
                ..LoginResponse::failure(msg)
            },
        ),
        LoginError::NoCookie { sample } => (
            StatusCode::UNAUTHORIZED,
            LoginResponse {
                sample: Some(sample),
                ..LoginResponse::failure(msg)
            },
        ),
        LoginError::Request(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            LoginResponse {
                error: Some(format!("{:#}", err)),
                ..LoginResponse::failure(None)
            },
        ),
    }
}

/// POST /login: scrape the panel login form, submit credentials, store the session cookie.
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    LoginBody(req): LoginBody,
) -> impl IntoResponse {
    let creds = Credentials::resolve(
        req.user.as_deref(),
        req.pass.as_deref(),
        &state.config.panel_user,
        &state.config.panel_pass,
    );
    let (status, body) = login_and_store(&state.client, &state.session, &creds).await;
    (status, Json(body))
}

/// GET /session: masked stored cookie or null.
pub async fn session_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = SessionResponse {
        cookie: state.session.masked().await,
    };
    (StatusCode::OK, Json(body))
}

/// GET /fetch-numbers: raw numbers list from the panel.
pub async fn fetch_numbers_handler(State(state): State<Arc<AppState>>) -> Response {
    passthrough(panel::fetch_numbers(&state.client, &state.session).await)
}

/// GET /fetch-sms: raw SMS log for the current UTC day.
pub async fn fetch_sms_handler(State(state): State<Arc<AppState>>) -> Response {
    passthrough(panel::fetch_sms(&state.client, &state.session).await)
}

fn passthrough(result: anyhow::Result<FetchOutcome>) -> Response {
    match result {
        Ok(FetchOutcome::Body(body)) => {
            (StatusCode::OK, [(CONTENT_TYPE, "application/json")], body).into_response()
        }
        Ok(FetchOutcome::LoginRequired) => {
            let body = FetchFailure {
                ok: false,
                msg: Some("Login required".to_string()),
                error: None,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            warn!(error = %format!("{:#}", e), "panel fetch failed");
            let body = FetchFailure {
                ok: false,
                msg: None,
                error: Some(format!("{:#}", e)),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
    }
}

/// All routes with state attached. /metrics only when enabled in config.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/login", post(login_handler))
        .route("/session", get(session_handler))
        .route("/fetch-numbers", get(fetch_numbers_handler))
        .route("/fetch-sms", get(fetch_sms_handler))
        .route("/healthz", get(health::healthz_handler));
    if state.config.metrics_enabled {
        app = app.route(
            "/metrics",
            get(|| async {
                (
                    [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                    metrics::encode(),
                )
            }),
        );
    }
    app.with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("api server error: {}", e))
}

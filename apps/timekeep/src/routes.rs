use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use metrics::counter;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{clear_session_cookie, session_cookie, token_from_headers, AuthError};
use crate::state::AppState;
use crate::storage::{StoreError, User, UserId};
use crate::websocket::ws_handler;

/// Unreserved characters stay as they are; everything else is escaped.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/logout", get(logout))
        .route("/session", get(current_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Unavailable(StoreError),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Unavailable(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unavailable(err) => {
                warn!(error = %err, "storage unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ApiErrorBody {
                        error: "unavailable",
                        message: Some("storage is unavailable".into()),
                    }),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct SessionUser {
    id: UserId,
    username: String,
}

impl From<User> for SessionUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
        }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn signup(
    State(state): State<AppState>,
    Form(credentials): Form<Credentials>,
) -> Result<Response, ApiError> {
    let outcome = state
        .accounts()
        .signup(&credentials.username, &credentials.password)
        .await;
    login_response("signup", outcome)
}

async fn login(
    State(state): State<AppState>,
    Form(credentials): Form<Credentials>,
) -> Result<Response, ApiError> {
    let outcome = state
        .accounts()
        .login(&credentials.username, &credentials.password)
        .await;
    login_response("login", outcome)
}

fn login_response(
    action: &'static str,
    outcome: Result<(User, String), AuthError>,
) -> Result<Response, ApiError> {
    match outcome {
        Ok((user, token)) => {
            counter!("timekeep_auth_total", 1, "action" => action, "result" => "ok");
            info!(user_id = user.id, username = %user.username, action, "session created");
            Ok((
                [(header::SET_COOKIE, session_cookie(&token))],
                Redirect::to("/"),
            )
                .into_response())
        }
        Err(AuthError::Store(err)) => Err(err.into()),
        Err(err) => {
            counter!("timekeep_auth_total", 1, "action" => action, "result" => "rejected");
            info!(action, reason = %err, "authentication rejected");
            Ok(auth_error_redirect(&err).into_response())
        }
    }
}

fn auth_error_redirect(err: &AuthError) -> Redirect {
    match err.user_message() {
        Some(message) => Redirect::to(&format!(
            "/?authError={}",
            utf8_percent_encode(message, QUERY_VALUE)
        )),
        None => Redirect::to("/"),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let Some(token) = token_from_headers(&headers) else {
        return Ok(Redirect::to("/").into_response());
    };
    let resolver = state.sessions();
    if let Some(user) = resolver.resolve_by_token(Some(&token)).await? {
        resolver.delete_session(&token).await?;
        if let Some(channel) = state.registry().lookup(user.id) {
            channel.close("logged out");
        }
        info!(user_id = user.id, "session ended");
    }
    Ok((
        [(header::SET_COOKIE, clear_session_cookie())],
        Redirect::to("/"),
    )
        .into_response())
}

async fn current_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = token_from_headers(&headers);
    let user = state
        .sessions()
        .resolve_by_token(token.as_deref())
        .await?
        .map(SessionUser::from);
    Ok(Json(json!({ "user": user })))
}

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{FormRejection, QueryRejection};
use axum::extract::{Form, Query, State};
use axum::http::{HeaderName, Uri, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::auth_flow::{AuthChallengeFlow, LoginChallenge};
use crate::config::Config;
use crate::deposit_flow::DepositIntentFlow;
use crate::deposit_provider::DepositAddressProvider;
use crate::error::BridgeError;
use crate::gateway::PaymentGateway;
use crate::notifications::NotificationHub;
use crate::sessions::SessionRegistry;
use crate::withdraw_flow::{WithdrawParams, WithdrawalFlow};

const SERVICE_NAME: &str = "openagents-lnurl-bridge";
const SSE_KEEP_ALIVE_SECONDS: u64 = 15;

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<dyn PaymentGateway>,
    sessions: Arc<SessionRegistry>,
    notifications: Arc<NotificationHub>,
    auth: Arc<AuthChallengeFlow>,
    withdrawals: Arc<WithdrawalFlow>,
    deposits: Arc<DepositIntentFlow>,
    session_ttl: Duration,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: &Config,
        gateway: Arc<dyn PaymentGateway>,
        provider: Arc<dyn DepositAddressProvider>,
    ) -> Self {
        let session_ttl = Duration::from_secs(config.session_ttl_seconds);
        let sessions = Arc::new(SessionRegistry::new(session_ttl));
        let notifications = Arc::new(NotificationHub::default());
        let withdrawals = Arc::new(WithdrawalFlow::new(
            config,
            Arc::clone(&gateway),
            Arc::clone(&sessions),
            Arc::clone(&notifications),
        ));
        let auth = Arc::new(AuthChallengeFlow::new(
            config.service_url.clone(),
            Arc::clone(&sessions),
            Arc::clone(&notifications),
            Arc::clone(&withdrawals),
        ));
        let deposits = Arc::new(DepositIntentFlow::new(
            config,
            Arc::clone(&gateway),
            provider,
            Arc::clone(&sessions),
            Arc::clone(&notifications),
        ));
        Self {
            gateway,
            sessions,
            notifications,
            auth,
            withdrawals,
            deposits,
            session_ttl,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn withdrawals(&self) -> &WithdrawalFlow {
        &self.withdrawals
    }

    /// Drop idle sessions, their disconnected channels, and old settlements.
    pub fn sweep(&self) {
        let now = Utc::now();
        let sessions = self.sessions.sweep_expired(now);
        let channels = self.notifications.sweep_idle(now, self.session_ttl);
        let settlements = self.withdrawals.sweep_settlements(now, self.session_ttl);
        if sessions + channels + settlements > 0 {
            tracing::info!(
                target: "lnurl_bridge.sessions",
                sessions,
                channels,
                settlements,
                "swept expired state"
            );
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/login-challenge", get(login_challenge))
        .route("/login-callback", get(login_callback))
        .route("/withdraw-request", get(withdraw_request))
        .route("/withdraw-callback", get(withdraw_callback))
        .route("/deposit-intent", post(deposit_intent))
        .route("/cancel-intent", post(cancel_intent))
        .route("/events", get(events))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session: String,
}

#[derive(Debug, Deserialize)]
struct LoginCallbackQuery {
    k1: String,
    sig: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct WithdrawCallbackQuery {
    session: String,
    k1: String,
    sig: String,
    pr: String,
}

#[derive(Debug, Deserialize)]
struct DepositIntentForm {
    session: String,
    amount: u64,
}

fn ok_response() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

fn query_rejection(rejection: QueryRejection) -> BridgeError {
    BridgeError::usage(rejection.body_text())
}

/// Query string after the last `?`; some wallets append a second one.
fn last_query_segment(uri: &Uri) -> &str {
    let query = uri.query().unwrap_or_default();
    query.rsplit_once('?').map_or(query, |(_, last)| last)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "gateway": state.gateway.backend(),
    }))
}

async fn login_challenge(
    State(state): State<AppState>,
) -> Result<Json<LoginChallenge>, BridgeError> {
    Ok(Json(state.auth.issue_challenge()?))
}

async fn login_callback(
    State(state): State<AppState>,
    uri: Uri,
) -> Result<Json<serde_json::Value>, BridgeError> {
    let params: LoginCallbackQuery = serde_urlencoded::from_str(last_query_segment(&uri))
        .map_err(|error| BridgeError::usage(format!("invalid login callback: {error}")))?;
    state
        .auth
        .verify_challenge(&params.k1, &params.sig, &params.key)
        .await?;
    Ok(ok_response())
}

async fn withdraw_request(
    State(state): State<AppState>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> Result<Json<WithdrawParams>, BridgeError> {
    let Query(query) = query.map_err(query_rejection)?;
    Ok(Json(
        state
            .withdrawals
            .issue_withdraw_params(&query.session)
            .await?,
    ))
}

async fn withdraw_callback(
    State(state): State<AppState>,
    query: Result<Query<WithdrawCallbackQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, BridgeError> {
    let Query(query) = query.map_err(query_rejection)?;
    state
        .withdrawals
        .execute_withdraw(&query.session, &query.k1, &query.sig, &query.pr)
        .await?;
    Ok(ok_response())
}

async fn deposit_intent(
    State(state): State<AppState>,
    form: Result<Form<DepositIntentForm>, FormRejection>,
) -> Result<Json<serde_json::Value>, BridgeError> {
    let Form(form) = form.map_err(|rejection| BridgeError::usage(rejection.body_text()))?;
    let amount_msat = form
        .amount
        .checked_mul(1_000)
        .ok_or_else(|| BridgeError::usage("amount is too large"))?;
    state
        .deposits
        .issue_deposit_invoice(&form.session, amount_msat)
        .await?;
    Ok(ok_response())
}

async fn cancel_intent(
    State(state): State<AppState>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, BridgeError> {
    let Query(query) = query.map_err(query_rejection)?;
    state.withdrawals.cancel_intent(&query.session).await?;
    Ok(ok_response())
}

async fn events(
    State(state): State<AppState>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> Result<impl IntoResponse, BridgeError> {
    let Query(query) = query.map_err(query_rejection)?;
    let receiver = state.notifications.subscribe(&query.session);
    tracing::debug!(
        target: "lnurl_bridge.events",
        session = %query.session,
        "event stream opened"
    );

    let stream = ReceiverStream::new(receiver).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.kind.as_str())
                .data(event.payload()),
        )
    });
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEP_ALIVE_SECONDS))
            .text("keep-alive"),
    );
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        sse,
    ))
}

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use super::{AppState, build_router};
use crate::config::Config;
use crate::deposit_provider::{DepositAddressProvider, StaticDepositProvider};
use crate::gateway::{InvoiceStatus, MockPaymentGateway, PaymentGateway, mock_payment_request};
use crate::withdraw_flow::IntentStatus;
use crate::withdraw_flow::tests::TestKey;

struct TestApp {
    router: Router,
    state: AppState,
    gateway: Arc<MockPaymentGateway>,
}

fn test_app() -> TestApp {
    let config = Config::for_tests();
    let gateway = Arc::new(MockPaymentGateway::new());
    let provider: Arc<dyn DepositAddressProvider> =
        Arc::new(StaticDepositProvider::new("bcrt1qtest", "64000"));
    let state = AppState::new(
        &config,
        Arc::clone(&gateway) as Arc<dyn PaymentGateway>,
        provider,
    );
    TestApp {
        router: build_router(state.clone()),
        state,
        gateway,
    }
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<&str>,
) -> Result<axum::response::Response> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(form) => {
            builder = builder.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
            Body::from(form.to_string())
        }
        None => Body::empty(),
    };
    Ok(router.clone().oneshot(builder.body(body)?).await?)
}

async fn get(router: &Router, uri: &str) -> Result<axum::response::Response> {
    send(router, Method::GET, uri, None).await
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let collected = response.into_body().collect().await?;
    let bytes = collected.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn json_str<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string field {field} in {value}"))
}

async fn login(app: &TestApp, key: &TestKey) -> Result<String> {
    let challenge = response_json(get(&app.router, "/login-challenge").await?).await?;
    let session = json_str(&challenge, "session")?.to_string();
    let sig = key.sign(&session)?;
    let response = get(
        &app.router,
        &format!(
            "/login-callback?tag=login&k1={session}&sig={sig}&key={}",
            key.pubkey
        ),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(session)
}

/// Reads SSE frames until one contains `needle` or the deadline passes.
async fn read_events_until(body: &mut Body, needle: &str) -> Result<String> {
    let mut seen = String::new();
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame?.into_data() {
                seen.push_str(&String::from_utf8_lossy(&data));
                if seen.contains(needle) {
                    return Ok::<_, anyhow::Error>(());
                }
            }
        }
        Err(anyhow!("event stream ended"))
    })
    .await;
    match outcome {
        Ok(result) => result.map(|()| seen),
        Err(_) => Err(anyhow!("timed out waiting for {needle}; saw {seen:?}")),
    }
}

#[tokio::test]
async fn health_reports_gateway_backend() -> Result<()> {
    let app = test_app();
    let response = get(&app.router, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await?;
    assert_eq!(json_str(&body, "status")?, "ok");
    assert_eq!(json_str(&body, "gateway")?, "mock");
    Ok(())
}

#[tokio::test]
async fn login_challenge_and_callback_bind_the_session() -> Result<()> {
    let app = test_app();
    let key = TestKey::new(7)?;

    let session = login(&app, &key).await?;
    assert_eq!(session.len(), 64);
    assert_eq!(
        app.state.sessions().lookup_pubkey(&session),
        Some(key.pubkey.clone())
    );
    Ok(())
}

#[tokio::test]
async fn login_callback_parses_the_last_query_segment() -> Result<()> {
    let app = test_app();
    let key = TestKey::new(7)?;
    let challenge = response_json(get(&app.router, "/login-challenge").await?).await?;
    let session = json_str(&challenge, "session")?;
    let sig = key.sign(session)?;

    let response = get(
        &app.router,
        &format!(
            "/login-callback?tag=login&k1={session}?tag=login&k1={session}&sig={sig}&key={}",
            key.pubkey
        ),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_str(&response_json(response).await?, "status")?, "OK");
    Ok(())
}

#[tokio::test]
async fn bad_login_signature_returns_error_shape() -> Result<()> {
    let app = test_app();
    let key = TestKey::new(7)?;
    let other = TestKey::new(9)?;
    let challenge = response_json(get(&app.router, "/login-challenge").await?).await?;
    let session = json_str(&challenge, "session")?;
    let sig = other.sign(session)?;

    let response = get(
        &app.router,
        &format!(
            "/login-callback?tag=login&k1={session}&sig={sig}&key={}",
            key.pubkey
        ),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await?;
    assert_eq!(json_str(&body, "status")?, "ERROR");
    assert!(!json_str(&body, "reason")?.is_empty());
    Ok(())
}

#[tokio::test]
async fn withdraw_request_requires_an_authenticated_session() -> Result<()> {
    let app = test_app();

    let response = get(&app.router, "/withdraw-request?session=unknown").await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&app.router, "/withdraw-request").await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_str(&response_json(response).await?, "status")?, "ERROR");
    Ok(())
}

#[tokio::test]
async fn withdraw_scenario_streams_events_to_completion() -> Result<()> {
    let app = test_app();
    let key = TestKey::new(7)?;
    let challenge = response_json(get(&app.router, "/login-challenge").await?).await?;
    let session = json_str(&challenge, "session")?.to_string();
    app.gateway.insert_invoice(
        &format!("inv-espera-{}", key.pubkey),
        21_000,
        InvoiceStatus::Unpaid,
    );

    let events = get(&app.router, &format!("/events?session={session}")).await?;
    assert_eq!(events.status(), StatusCode::OK);
    assert_eq!(
        events
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    let mut stream = events.into_body();

    let sig = key.sign(&session)?;
    let response = get(
        &app.router,
        &format!(
            "/login-callback?tag=login&k1={session}&sig={sig}&key={}",
            key.pubkey
        ),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let seen = read_events_until(&mut stream, "waiting").await?;
    assert!(seen.contains("event: login"));
    assert!(seen.contains(&key.pubkey));

    let params =
        response_json(get(&app.router, &format!("/withdraw-request?session={session}")).await?)
            .await?;
    assert_eq!(params["minWithdrawable"], Value::from(21_000));
    assert_eq!(params["maxWithdrawable"], Value::from(21_000));
    assert_eq!(json_str(&params, "tag")?, "withdrawRequest");
    let k1 = json_str(&params, "k1")?;
    assert_ne!(k1, session);

    let pr = mock_payment_request(21_000, 42).ok_or_else(|| anyhow!("bad amount"))?;
    let sig = key.sign(k1)?;
    let response = get(
        &app.router,
        &format!("/withdraw-callback?session={session}&k1={k1}&sig={sig}&pr={pr}"),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_str(&response_json(response).await?, "status")?, "OK");

    let seen = read_events_until(&mut stream, "processed").await?;
    assert!(seen.contains("event: withdraw"));
    assert_eq!(app.gateway.paid_requests(), vec![pr.clone()]);
    assert_eq!(
        app.state.withdrawals().status_query(&key.pubkey).await?,
        IntentStatus::None
    );

    let response = get(
        &app.router,
        &format!("/withdraw-callback?session={session}&k1={k1}&sig={sig}&pr={pr}"),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = get(&app.router, &format!("/withdraw-request?session={session}")).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.gateway.paid_requests().len(), 1);
    Ok(())
}

#[tokio::test]
async fn second_withdraw_while_paying_conflicts() -> Result<()> {
    let app = test_app();
    let key = TestKey::new(7)?;
    let session = login(&app, &key).await?;
    app.gateway.insert_invoice(
        &format!("inv-espera-{}", key.pubkey),
        21_000,
        InvoiceStatus::Paid,
    );
    let params =
        response_json(get(&app.router, &format!("/withdraw-request?session={session}")).await?)
            .await?;
    let k1 = json_str(&params, "k1")?;
    let sig = key.sign(k1)?;

    let mismatched = mock_payment_request(21_001, 8).ok_or_else(|| anyhow!("bad amount"))?;
    let response = get(
        &app.router,
        &format!("/withdraw-callback?session={session}&k1={k1}&sig={sig}&pr={mismatched}"),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let pr = mock_payment_request(21_000, 7).ok_or_else(|| anyhow!("bad amount"))?;
    let uri = format!("/withdraw-callback?session={session}&k1={k1}&sig={sig}&pr={pr}");
    app.gateway.hold_payments();
    assert_eq!(get(&app.router, &uri).await?.status(), StatusCode::OK);
    assert_eq!(get(&app.router, &uri).await?.status(), StatusCode::CONFLICT);
    app.gateway.release_payments();
    Ok(())
}

#[tokio::test]
async fn deposit_intent_converts_sats_and_creates_invoice() -> Result<()> {
    let app = test_app();
    let key = TestKey::new(7)?;
    let session = login(&app, &key).await?;

    let response = send(
        &app.router,
        Method::POST,
        "/deposit-intent",
        Some(&format!("amount=21&session={session}")),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        app.gateway
            .invoice(&format!("inv-espera-{}", key.pubkey))
            .map(|invoice| invoice.amount_msat),
        Some(21_000)
    );

    let response = send(
        &app.router,
        Method::POST,
        "/deposit-intent",
        Some("amount=abc&session=x"),
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn cancel_intent_clears_the_open_invoice() -> Result<()> {
    let app = test_app();
    let key = TestKey::new(7)?;
    let session = login(&app, &key).await?;
    app.gateway.insert_invoice(
        &format!("inv-espera-{}", key.pubkey),
        21_000,
        InvoiceStatus::Unpaid,
    );

    let response = send(
        &app.router,
        Method::POST,
        &format!("/cancel-intent?session={session}"),
        None,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        app.state.withdrawals().status_query(&key.pubkey).await?,
        IntentStatus::None
    );

    app.gateway.set_unavailable(Some("connection refused"));
    let response = send(
        &app.router,
        Method::POST,
        &format!("/cancel-intent?session={session}"),
        None,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    Ok(())
}

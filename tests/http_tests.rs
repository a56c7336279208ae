mod common;

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use std::sync::atomic::Ordering;
use tower::ServiceExt;
use voice_relay::http::{create_router, AppState};
use voice_relay::session::SessionStats;
use voice_relay::RelayEngine;

async fn get_json(engine: &RelayEngine, method: &str, uri: &str) -> Result<(StatusCode, serde_json::Value)> {
    let app = create_router(AppState::new(engine.clone()));
    let response = app
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty())?)
        .await?;

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&body)?))
}

async fn engine_with_session() -> (RelayEngine, std::sync::Arc<ScriptedFactory>) {
    let broker = MemoryBroker::new();
    let factory = ScriptedFactory::new(Script {
        never_respond: true,
        ..Default::default()
    });
    let engine = engine_with(broker, factory.clone(), &test_config());

    engine
        .on_inbound(&request_topic("D1"), &audio_request("D1", "S1", &[1u8; 32], None))
        .await;
    let counters = factory.counters.clone();
    eventually(move || counters.pushes.load(Ordering::SeqCst) == 1).await;

    (engine, factory)
}

#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let (engine, _factory) = engine_with_session().await;

    let (status, body) = get_json(&engine, "GET", "/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_sessions"], 1);
    assert_eq!(body["provider"], "scripted");
    Ok(())
}

#[tokio::test]
async fn test_stats_endpoint() -> Result<()> {
    let (engine, _factory) = engine_with_session().await;

    let (status, body) = get_json(&engine, "GET", "/stats").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_sessions"], 1);
    assert_eq!(body["max_sessions"], 50);
    assert_eq!(body["relay"]["sessions_created"], 1);
    assert_eq!(body["relay"]["envelopes_received"], 1);
    Ok(())
}

#[tokio::test]
async fn test_session_listing_and_lookup() -> Result<()> {
    let (engine, _factory) = engine_with_session().await;

    let (status, body) = get_json(&engine, "GET", "/sessions").await?;
    assert_eq!(status, StatusCode::OK);
    let sessions: Vec<SessionStats> = serde_json::from_value(body)?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].device_id, "D1");
    assert_eq!(sessions[0].fragments_in, 1);

    let (status, body) = get_json(&engine, "GET", "/sessions/D1").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session_id"], "S1");
    assert_eq!(body["state"], "streaming");

    let (status, body) = get_json(&engine, "GET", "/sessions/nobody").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nobody"));
    Ok(())
}

#[tokio::test]
async fn test_delete_closes_session() -> Result<()> {
    let (engine, factory) = engine_with_session().await;

    let (status, body) = get_json(&engine, "DELETE", "/sessions/D1").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");
    assert!(engine.registry().get("D1").await.is_none());
    assert_eq!(factory.counters.closed(), 1);

    let (status, _) = get_json(&engine, "DELETE", "/sessions/D1").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

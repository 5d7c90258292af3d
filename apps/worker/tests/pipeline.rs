//! End-to-end pipeline tests over in-memory collaborators: broker payloads
//! are driven straight through the consumers' dispatch path, and the engine
//! drains against the recording REST fake.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use guildsmith_consumer::{AckDecision, QueueConsumer};
use guildsmith_core::EngineConfig;
use guildsmith_engine::dlq::DeadLetterStage;
use guildsmith_engine::{MemoryJobStore, SynthesisEngine};
use guildsmith_kv::{MemoryKvStore, StateStore};
use guildsmith_ratelimit::TokenBucket;
use guildsmith_rest::RecordingChatApi;
use guildsmith_worker::handlers;

struct Pipeline {
    api: Arc<RecordingChatApi>,
    engine: Arc<SynthesisEngine>,
    state: StateStore,
    events: QueueConsumer,
    interactions: QueueConsumer,
}

async fn pipeline() -> Pipeline {
    let api = Arc::new(RecordingChatApi::new());
    let state = StateStore::new(Arc::new(MemoryKvStore::new()), Duration::from_secs(86_400));
    let engine = SynthesisEngine::new(
        EngineConfig {
            concurrency: 2,
            rate_limit_max: 1000,
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            remove_on_complete_age: Duration::from_secs(3600),
            remove_on_fail_age: Duration::from_secs(86_400),
        },
        Arc::new(MemoryJobStore::new()),
        state.clone(),
        api.clone(),
        Arc::new(TokenBucket::new(100.0, 1000.0)),
        None,
    );
    engine.start().await;

    let events = QueueConsumer::new(
        "nats://127.0.0.1:4222",
        "guildsmith-events",
        DeadLetterStage::Event,
        10,
        Arc::new(handlers::event_dispatcher(
            state.clone(),
            engine.clone(),
            api.clone(),
        )),
        None,
    );
    let interactions = QueueConsumer::new(
        "nats://127.0.0.1:4222",
        "guildsmith-interactions",
        DeadLetterStage::Interaction,
        5,
        Arc::new(handlers::interaction_dispatcher(engine.clone(), api.clone())),
        None,
    );

    Pipeline {
        api,
        engine,
        state,
        events,
        interactions,
    }
}

async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn member_join(event_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "eventId": event_id,
        "eventType": "member.join",
        "guildId": "g1",
        "timestamp": 1_700_000_000_000u64,
        "data": {
            "userId": "u1",
            "communityId": "acme",
            "entryRoleId": "r-entry",
            "welcomeMessage": "welcome to the sietch"
        }
    }))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_member_join_has_one_side_effect() {
    let p = pipeline().await;

    assert_eq!(p.events.dispatch_payload(&member_join("e1")).await, AckDecision::Ack);
    assert_eq!(p.events.dispatch_payload(&member_join("e1")).await, AckDecision::Ack);

    wait_until("assign_role to run", Duration::from_secs(5), || {
        p.api.call_count("assign_role") >= 1
    })
    .await;
    // Give a straggler job the chance to surface before asserting exactly-once.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(p.api.call_count("assign_role"), 1);
    assert_eq!(p.api.call_count("send_dm"), 1, "welcome DM sent once");
    assert!(p
        .state
        .is_processed(&guildsmith_core::keys::event_processed_key("e1"))
        .await
        .unwrap());
    let status = p.events.status();
    assert_eq!(status.messages_processed, 2, "both deliveries ack");
    assert_eq!(status.messages_errored, 0);
    p.engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn welcome_dm_respects_cooldown_across_events() {
    let p = pipeline().await;

    assert_eq!(p.events.dispatch_payload(&member_join("e1")).await, AckDecision::Ack);
    // Same member, later join event within the cooldown window.
    assert_eq!(p.events.dispatch_payload(&member_join("e2")).await, AckDecision::Ack);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p.api.call_count("send_dm"), 1, "cooldown suppresses the second DM");
    p.engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_drops_without_state_writes() {
    let p = pipeline().await;

    assert_eq!(p.events.dispatch_payload(b"invalid json").await, AckDecision::Drop);

    let status = p.events.status();
    assert_eq!(status.messages_errored, 1);
    assert_eq!(status.messages_processed, 0);
    assert!(p.api.calls().is_empty());
    p.engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verify_interaction_defers_then_assigns_and_follows_up() {
    let p = pipeline().await;
    let payload = serde_json::to_vec(&json!({
        "eventId": "i-evt-1",
        "eventType": "interaction.command.verify",
        "guildId": "g1",
        "timestamp": 1_700_000_000_000u64,
        "interactionId": "i1",
        "interactionToken": "t1",
        "data": {"userId": "u1", "roleId": "r-verified", "communityId": "acme"}
    }))
    .unwrap();

    assert_eq!(p.interactions.dispatch_payload(&payload).await, AckDecision::Ack);

    assert_eq!(p.api.call_count("defer_reply"), 1);
    assert_eq!(p.api.calls()[0].operation, "defer_reply", "defer precedes everything");
    assert_eq!(p.api.call_count("send_followup"), 1);

    wait_until("verified role assignment", Duration::from_secs(5), || {
        p.api.call_count("assign_role") == 1
    })
    .await;
    assert!(p.engine.is_processed("assign:g1:u1:r-verified").await.unwrap());
    p.engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interaction_without_token_drops_before_any_rest_call() {
    let p = pipeline().await;
    let payload = serde_json::to_vec(&json!({
        "eventId": "i-evt-2",
        "eventType": "interaction.command.verify",
        "guildId": "g1",
        "timestamp": 1_700_000_000_000u64,
        "data": {"userId": "u1", "roleId": "r-verified"}
    }))
    .unwrap();

    assert_eq!(p.interactions.dispatch_payload(&payload).await, AckDecision::Drop);
    assert!(p.api.calls().is_empty());
    assert_eq!(p.interactions.status().messages_errored, 1);
    p.engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn guild_create_manifest_bootstraps_roles_and_channels() {
    let p = pipeline().await;
    let payload = serde_json::to_vec(&json!({
        "eventId": "e-guild-1",
        "eventType": "guild.create",
        "guildId": "g1",
        "timestamp": 1_700_000_000_000u64,
        "data": {
            "communityId": "acme",
            "manifest": {
                "roles": [
                    {"key": "t1", "name": "Tier 1"},
                    {"key": "t2", "name": "Tier 2", "color": 255, "hoist": true}
                ],
                "channels": [
                    {"key": "lounge", "name": "lounge", "topic": "general"}
                ]
            }
        }
    }))
    .unwrap();

    assert_eq!(p.events.dispatch_payload(&payload).await, AckDecision::Ack);

    wait_until("manifest drain", Duration::from_secs(5), || {
        p.api.call_count("create_role") == 2 && p.api.call_count("create_channel") == 1
    })
    .await;

    assert!(p.engine.is_processed("role:acme:t1").await.unwrap());
    assert!(p.engine.is_processed("channel:acme:lounge").await.unwrap());
    let stats = p.engine.stats().await.unwrap();
    assert_eq!(stats.counts.completed, 3);
    assert_eq!(stats.counts.failed, 0);
    p.engine.close().await;
}

mod health_routes {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use guildsmith_worker::health::{self, HealthState};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_reports_degraded_before_consumers_start() {
        let p = pipeline().await;
        let metrics = guildsmith_telemetry::install_metrics().unwrap();
        let state = HealthState::new(
            vec![Arc::new(p.events), Arc::new(p.interactions)],
            p.state.clone(),
            512,
            metrics,
        );
        let router = health::router(state);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["status"], "degraded");
        assert_eq!(report["kv"]["healthy"], true);
        assert_eq!(report["consumers"].as_array().unwrap().len(), 2);

        let metrics_response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics_response.status(), StatusCode::OK);
        p.engine.close().await;
    }
}

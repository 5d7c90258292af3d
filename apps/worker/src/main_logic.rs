use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use guildsmith_consumer::QueueConsumer;
use guildsmith_core::WorkerConfig;
use guildsmith_engine::dlq::{DeadLetterSink, DeadLetterStage, NatsDeadLetters};
use guildsmith_engine::{JobStore, KvJobStore, MemoryJobStore, SynthesisEngine};
use guildsmith_kv::{JetStreamKvStore, KvStore, MemoryKvStore, StateStore};
use guildsmith_ratelimit::TokenBucket;
use guildsmith_rest::{ChatApi, HttpChatApi};

use crate::handlers;
use crate::health::{self, HealthState};

const JOB_BUCKET: &str = "guildsmith-jobs";

/// Boots every component in dependency order, serves health, and drains
/// cleanly on SIGTERM/SIGINT.
pub async fn run() -> Result<()> {
    let config = WorkerConfig::from_env();
    let metrics = guildsmith_telemetry::install_metrics()?;

    // State store first; everything else consults it.
    let state = init_state(&config).await;

    let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(
        reqwest::Client::new(),
        config.discord.clone(),
    ));

    // Broker-side pieces: the durable job store and the dead-letter stream
    // share one connection.
    let broker = async_nats::connect(&config.broker.url)
        .await
        .with_context(|| format!("connect broker {}", config.broker.url))?;
    let js = async_nats::jetstream::new(broker);
    let dead_letters: Option<Arc<dyn DeadLetterSink>> = match NatsDeadLetters::new(js.clone()).await
    {
        Ok(sink) => Some(Arc::new(sink)),
        Err(err) => {
            warn!(error = %err, "dead letter stream unavailable, letters will be logged only");
            None
        }
    };
    let job_store: Arc<dyn JobStore> = match KvJobStore::new(&js, JOB_BUCKET).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(error = %err, "durable job store unavailable, using in-memory queue");
            Arc::new(MemoryJobStore::new())
        }
    };

    let bucket = Arc::new(TokenBucket::new(
        config.bucket.capacity,
        config.bucket.refill_rate,
    ));
    let engine = SynthesisEngine::new(
        config.engine.clone(),
        job_store,
        state.clone(),
        api.clone(),
        bucket,
        dead_letters.clone(),
    );
    engine.start().await;

    let events = Arc::new(QueueConsumer::new(
        &config.broker.url,
        &config.broker.event_queue,
        DeadLetterStage::Event,
        config.broker.event_prefetch,
        Arc::new(handlers::event_dispatcher(
            state.clone(),
            engine.clone(),
            api.clone(),
        )),
        dead_letters.clone(),
    ));
    let interactions = Arc::new(QueueConsumer::new(
        &config.broker.url,
        &config.broker.interaction_queue,
        DeadLetterStage::Interaction,
        config.broker.interaction_prefetch,
        Arc::new(handlers::interaction_dispatcher(engine.clone(), api.clone())),
        dead_letters,
    ));

    tokio::try_join!(events.connect(), interactions.connect())
        .context("connect consumers")?;
    tokio::try_join!(events.start(), interactions.start()).context("start consumers")?;

    let health_state = HealthState::new(
        vec![events.clone(), interactions.clone()],
        state.clone(),
        config.health.memory_threshold_mb,
        metrics,
    );
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.health.port))
        .await
        .with_context(|| format!("bind health port {}", config.health.port))?;
    info!(port = config.health.port, "health endpoint listening");

    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let shutdown = server_shutdown.clone();
        let router = health::router(health_state);
        async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                tracing::error!(error = %err, "health server failed");
            }
        }
    });

    wait_for_shutdown().await?;
    info!("shutdown signal received, draining");

    // Stop deliveries first (in-flight handlers finish), then let the engine
    // wind down, then drop connections.
    tokio::join!(events.stop(), interactions.stop());
    engine.pause();
    engine.close().await;
    tokio::join!(events.close(), interactions.close());
    server_shutdown.cancel();
    let _ = server.await;

    info!("worker stopped cleanly");
    Ok(())
}

async fn init_state(config: &WorkerConfig) -> StateStore {
    let store: Arc<dyn KvStore> = match connect_kv(config).await {
        Ok(store) => store,
        Err(err) => {
            warn!(error = %err, "state store unavailable, falling back to in-memory");
            Arc::new(MemoryKvStore::new())
        }
    };
    StateStore::new(store, config.idempotency_ttl)
}

async fn connect_kv(config: &WorkerConfig) -> Result<Arc<dyn KvStore>> {
    let client = async_nats::connect(&config.kv.url)
        .await
        .with_context(|| format!("connect state store {}", config.kv.url))?;
    let js = async_nats::jetstream::new(client);
    let store = JetStreamKvStore::new(&js, &config.kv.bucket).await?;
    Ok(Arc::new(store))
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("install SIGINT handler")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("install SIGINT handler")?;
    Ok(())
}

use std::sync::Arc;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::Context;
use cine_api::{app, metrics::Metrics, middleware::ResiliencyState, state::{AppState, AuthConfig}, worker};
use cine_booking::{BookingContext, BookingOrchestrator, GatewayRegistry, MomoGateway, SeatLockManager, SettlementService, VnpayGateway};
use cine_core::SystemClock;
use cine_pricing::PricingEngine;
use cine_store::{Config, DbClient, PgStore, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cine_api=debug,cine_booking=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Cine API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let rules = match db.fetch_business_rules(config.business_rules.clone()).await {
        Ok(rules) => rules,
        Err(e) => {
            tracing::warn!("Using file business rules, table overlay failed: {}", e);
            config.business_rules.clone()
        }
    };

    // Redis
    let redis = Arc::new(
        RedisClient::new(&config.redis.url)
            .await
            .context("Failed to connect to Redis")?,
    );

    let gateways = GatewayRegistry::new()
        .with(Arc::new(MomoGateway::new(config.gateways.momo.clone())?))
        .with(Arc::new(VnpayGateway::new(config.gateways.vnpay.clone())?));

    // SSE Broadcast Channel
    let (events, _) = tokio::sync::broadcast::channel(256);

    let ctx = BookingContext::new(
        Arc::new(PgStore::new(db.pool.clone())),
        redis.clone(),
        Arc::new(SystemClock),
        rules.clone(),
        events,
    );
    let orchestrator = Arc::new(BookingOrchestrator::new(ctx.clone(), PricingEngine::default(), gateways.clone()));
    let settlement = Arc::new(SettlementService::new(ctx.clone(), orchestrator.clone(), gateways));
    let seat_locks = Arc::new(SeatLockManager::new(ctx.clone(), PricingEngine::default()));
    let metrics = Arc::new(Metrics::new()?);

    tokio::spawn(worker::start_lock_sweeper(
        seat_locks.clone(),
        metrics.clone(),
        Duration::from_secs(rules.lock_sweep_interval_seconds),
    ));
    tokio::spawn(worker::start_payment_sweeper(
        orchestrator.clone(),
        metrics.clone(),
        Duration::from_secs(rules.payment_sweep_interval_seconds),
    ));

    let app_state = AppState {
        ctx,
        seat_locks,
        orchestrator,
        settlement,
        redis: Some(redis),
        rate_limit: config.rate_limit.clone(),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
        resiliency: Arc::new(ResiliencyState::default()),
        metrics,
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>()
    ).await?;

    Ok(())
}

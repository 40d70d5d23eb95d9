//! SUPS Ledger Server
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum Web Server                         │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                      Routes Layer                        ││
//! │  │  /health  /ws                                            ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Services Layer                        ││
//! │  │  TransactionProcessor  BalanceCache  EventHub  KvCache   ││
//! │  │  BridgeReconciler (background ticker)                    ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Data Layer                            ││
//! │  │  PostgreSQL (transactions, kv, chain_confirmations)      ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Data feed (transfers, prices)  Chain RPC          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sups_ledger::config::BridgeConfig;
use sups_ledger::services::{
    BlockCountingFinality, BridgeReconciler, ConfirmationTracker, FinalityChecker,
    HttpChainSource, ReconcilerHandle, ReconcilerSettings, WithdrawalService,
};
use sups_ledger::{
    routes, AppState, BalanceCache, Config, Database, EventHub, KvCache, TransactionProcessor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 환경변수 로드
    dotenvy::dotenv().ok();

    // 로깅 초기화
    // RUST_LOG=debug,sqlx=warn 형태로 레벨 제어 가능
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "sups_ledger=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting SUPS Ledger");

    // 설정 로드
    let config = Config::from_env()?;
    tracing::info!("📋 Configuration loaded");

    // 데이터베이스 연결
    let db = Arc::new(Database::connect(&config.database_url).await?);
    tracing::info!("🗄️  Database connected");

    // 마이그레이션 실행
    db.run_migrations().await?;
    tracing::info!("📦 Migrations completed");

    // 잔액 캐시: 실패하면 서비스를 시작하지 않는다
    let cache = BalanceCache::initialise(db.clone())
        .await
        .context("failed to load balances from the ledger")?;
    let cache = Arc::new(cache);
    tracing::info!(accounts = cache.len().await, "💰 Balance cache ready");

    let events = Arc::new(EventHub::new());
    let ledger = Arc::new(TransactionProcessor::new(
        db.clone(),
        cache,
        events.clone(),
        config.process_timeout,
    ));
    let kv = Arc::new(KvCache::new(db.clone(), config.kv_cache_ttl));

    let shutdown = CancellationToken::new();
    let reconciler = if config.bridge.enabled {
        let handle = start_reconciler(&config.bridge, &db, &ledger, &kv, &events, &shutdown)?;
        tracing::info!(
            interval_secs = config.bridge.sync_interval.as_secs(),
            run_once = config.bridge.run_once,
            "🔗 Bridge reconciler started"
        );
        Some(handle)
    } else {
        None
    };

    // 앱 상태 구성
    let state = AppState {
        db,
        ledger,
        events,
        kv,
        config: Arc::new(config.clone()),
    };

    let app = create_router(state);

    // 서버 시작
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("🌐 Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // 진행 중인 브릿지 tick 종료 대기
    if let Some(handle) = reconciler {
        handle.stop().await;
    }
    tracing::info!("👋 Shutdown complete");

    Ok(())
}

fn start_reconciler(
    bridge: &BridgeConfig,
    db: &Arc<Database>,
    ledger: &Arc<TransactionProcessor>,
    kv: &Arc<KvCache>,
    events: &Arc<EventHub>,
    shutdown: &CancellationToken,
) -> anyhow::Result<ReconcilerHandle> {
    let source = Arc::new(HttpChainSource::new(&bridge.feed_url, bridge.testnet)?);

    let checkers: Vec<Arc<dyn FinalityChecker>> = vec![
        Arc::new(BlockCountingFinality::new(
            "ethereum",
            &bridge.eth_rpc_url,
            bridge.eth_chain_id,
            bridge.confirmation_depth,
        )?),
        Arc::new(BlockCountingFinality::new(
            "bsc",
            &bridge.bsc_rpc_url,
            bridge.bsc_chain_id,
            bridge.confirmation_depth,
        )?),
    ];
    let confirmations = Arc::new(ConfirmationTracker::new(db.clone(), checkers));

    let withdrawals = Arc::new(WithdrawalService::new(
        ledger.clone(),
        db.clone(),
        db.clone(),
        bridge.withdraw_hold,
    ));

    let reconciler = Arc::new(BridgeReconciler::new(
        ledger.clone(),
        source,
        kv.clone(),
        db.clone(),
        withdrawals,
        confirmations,
        events.clone(),
        ReconcilerSettings {
            purchase_contract: bridge.purchase_contract.clone(),
            eth_chain_id: bridge.eth_chain_id,
            bsc_chain_id: bridge.bsc_chain_id,
        },
    ));

    Ok(reconciler.spawn(bridge.sync_interval, bridge.run_once, shutdown))
}

/// Ctrl-C 수신 시 공유 토큰 취소
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("🛑 Shutdown requested");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

/// 라우터 생성
///
/// ```text
/// GET  /health   - 서버 상태 확인
/// GET  /ws       - 잔액/환율 토픽 구독
/// ```
fn create_router(state: AppState) -> Router {
    let cors = if state.config.is_production() {
        let origins: Vec<_> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/ws", get(routes::ws::ws_handler))

        // 미들웨어
        .layer(TraceLayer::new_for_http())
        .layer(cors)

        // 상태 주입
        .with_state(state)
}

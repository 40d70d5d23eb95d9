//! Health Check Endpoint
//!
//! DB 연결과 잔액 캐시 크기, 출금 롤백 플래그를 함께 보고한다.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::services::KvKey;
use crate::AppState;

/// Health check 응답
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: DatabaseStatus,
    pub cached_accounts: usize,
    pub active_topics: usize,
    /// 출금 자동 롤백 플래그 (피드 상태에 따라 토글됨)
    pub withdraw_rollback: Option<bool>,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct DatabaseStatus {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_start = std::time::Instant::now();
    let db_status = match state.db.health_check().await {
        Ok(_) => DatabaseStatus {
            connected: true,
            latency_ms: Some(db_start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            DatabaseStatus {
                connected: false,
                latency_ms: None,
            }
        }
    };

    Json(HealthResponse {
        status: if db_status.connected { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_status,
        cached_accounts: state.ledger.cache().len().await,
        active_topics: state.events.active_topics(),
        withdraw_rollback: state.kv.get_bool(KvKey::EnableWithdrawRollback, false).await.ok(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

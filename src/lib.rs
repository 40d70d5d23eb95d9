//! SUPS Ledger Engine
//!
//! # Overview
//!
//! 플랫폼 내부 화폐(SUPS)의 append-only 원장과 그 주변 서비스.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP / RPC handlers        Bridge Reconciler ◀── data feed, chain RPC
//!          │                        │   │
//!          └──────────┬─────────────┘   └──▶ KV (cursors, flags, rates)
//!                     ▼
//!           Transaction Processor ──▶ Event Hub ──▶ /ws subscribers
//!              │            │
//!              ▼            ▼
//!        Balance Cache   Ledger Store (PostgreSQL)
//! ```
//!
//! 모든 잔액 변경은 `TransactionProcessor::process` 를 거친다.
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: 에러 타입
//! - `routes`: `/health`, `/ws`
//! - `services`: 원장, 캐시, 이벤트, 브릿지
//! - `db`: 저장소 trait 와 PostgreSQL 구현
//! - `types`: 계정, 금액, 요청 타입

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod services;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use db::Database;
pub use error::{BridgeError, LedgerError, StoreError};
pub use services::{BalanceCache, EventHub, KvCache, TransactionProcessor};

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub ledger: Arc<TransactionProcessor>,
    pub events: Arc<EventHub>,
    pub kv: Arc<KvCache>,
    pub config: Arc<Config>,
}

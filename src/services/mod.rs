//! Services Module
//!
//! 원장 비즈니스 로직
//!
//! # Services
//! - `BalanceCache`: 계정별 잔액 캐시 + 계정 락
//! - `TransactionProcessor`: 직렬화된 트랜잭션 처리 (유일한 쓰기 경로)
//! - `EventHub`: 토픽별 잔액/환율 이벤트 발행
//! - `KvCache`: 커서, 운영 플래그, 환율
//! - `BridgeReconciler`: 온체인 기록 → 원장 트랜잭션
//! - `WithdrawalService`: 출금 보류와 만료 시 롤백

pub mod balance_cache;
pub mod chain_source;
pub mod events;
pub mod finality;
pub mod kv;
pub mod ledger;
pub mod reconciler;
pub mod withdrawals;

pub use balance_cache::{AccountLocks, BalanceCache};
pub use chain_source::{BridgeStream, ChainSource, HttpChainSource, TransferRecord};
pub use events::{BalanceEvent, BalancePublisher, EventHub, EventMessage};
pub use finality::{BlockCountingFinality, ConfirmationTracker, FinalityChecker};
pub use kv::{ExchangeRates, KvCache, KvKey};
pub use ledger::{CallContext, LedgerService, ProcessedTransaction, TransactionProcessor};
pub use reconciler::{BridgeReconciler, ReconcilerHandle, ReconcilerSettings};
pub use withdrawals::{WithdrawalHold, WithdrawalService};

//! Repository Traits
//!
//! 원장 코어는 이 trait 들에만 의존한다.
//!
//! - `LedgerStore`: append-only 트랜잭션 로그 + 잔액 재계산
//! - `KvStore`: 커서/환율/운영 플래그
//! - `ConfirmationStore`: chain confirmation pending → confirmed
//! - `AccountDirectory`: 지갑 주소 ↔ 계정
//! - `RefundStore`: 출금 보류 및 롤백
//!
//! PostgreSQL 구현은 db/mod.rs의 `Database`, 테스트용 in-memory 구현은 `mock`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{ChainConfirmation, ExpiredWithdrawal, NewPendingRefund, TransactionRecord};
use crate::error::StoreError;
use crate::types::{AccountId, Balance, ChainEvent, TxHash, WalletAddress};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 하나의 DB 트랜잭션 안에서 원장 행 (그리고 chain confirmation) 추가
    ///
    /// reference 또는 tx hash 중복이면 `StoreError::DuplicateReference`.
    async fn append_transaction(
        &self,
        tx: &TransactionRecord,
        chain_event: Option<&ChainEvent>,
    ) -> Result<(), StoreError>;

    /// 로그를 합산해서 모든 계정 잔액 계산 (시작 시 1회)
    async fn load_all_balances(&self) -> Result<HashMap<AccountId, Balance>, StoreError>;

    /// 단일 계정 잔액 (캐시 miss)
    async fn get_balance(&self, id: AccountId) -> Result<Balance, StoreError>;

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>, StoreError>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ConfirmationStore: Send + Sync {
    async fn pending_confirmations(&self, chain_id: u64) -> Result<Vec<ChainConfirmation>, StoreError>;

    /// pending → confirmed. 이미 확정된 행이면 false.
    async fn confirm(&self, tx_hash: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_by_wallet(&self, wallet: &WalletAddress) -> Result<Option<AccountId>, StoreError>;

    /// 처음 보는 지갑이면 normal 계정을 생성
    async fn account_for_wallet(&self, wallet: &WalletAddress) -> Result<AccountId, StoreError>;
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    async fn insert_pending_refund(&self, refund: &NewPendingRefund) -> Result<(), StoreError>;

    /// 금액이 일치하는 가장 오래된 열린 보류에 온체인 tx hash 기록 (환불 취소)
    async fn attach_withdraw_tx_hash(
        &self,
        user: AccountId,
        amount: &Balance,
        tx_hash: &TxHash,
    ) -> Result<bool, StoreError>;

    async fn expired_withdrawals(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredWithdrawal>, StoreError>;

    async fn mark_refunded(
        &self,
        refund_id: Uuid,
        reversal_transaction_id: Option<&str>,
    ) -> Result<(), StoreError>;
}

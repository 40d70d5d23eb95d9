//! Database Models
//!
//! Row types for the append-only transaction log, chain confirmations,
//! the key/value table and withdrawal holds, plus their domain conversions.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    AccountId, Balance, NewTransactionRequest, TransactionGroup, TransactionReference,
};

/// 원장 트랜잭션 (불변)
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub id: String,
    pub description: String,
    pub transaction_reference: TransactionReference,
    pub amount: Balance,
    /// 입금 계정 (To)
    pub credit: AccountId,
    /// 출금 계정 (From)
    pub debit: AccountId,
    pub group: TransactionGroup,
    pub sub_group: Option<String>,
    pub related_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// 요청으로부터 새 원장 행 생성 (id: UUIDv4)
    pub fn from_request(req: &NewTransactionRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: req.description.clone(),
            transaction_reference: req.transaction_reference.clone(),
            amount: req.amount.clone(),
            credit: req.to,
            debit: req.from,
            group: req.group,
            sub_group: req.sub_group.clone(),
            related_transaction_id: req.related_transaction_id.clone(),
            created_at: Utc::now(),
        }
    }

    /// 보상(환불) 요청 생성
    ///
    /// 원본 행은 수정하지 않고, 방향이 반대인 새 트랜잭션을 만든다.
    pub fn compensation(
        &self,
        reference: impl Into<String>,
        description: impl Into<String>,
    ) -> NewTransactionRequest {
        let mut req = NewTransactionRequest::new(
            self.credit,
            self.debit,
            self.amount.clone(),
            reference,
            TransactionGroup::Refund,
        )
        .description(description)
        .related_to(self.id.clone());
        req.sub_group = Some(self.group.as_str().to_string());
        req
    }
}

/// transactions 테이블 행
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: String,
    pub description: String,
    pub transaction_reference: String,
    pub amount: BigDecimal,
    pub credit: Uuid,
    pub debit: Uuid,
    pub group: String,
    pub sub_group: Option<String>,
    pub related_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let group = TransactionGroup::from_str(&row.group).map_err(StoreError::Corrupt)?;
        Ok(Self {
            id: row.id,
            description: row.description,
            transaction_reference: TransactionReference::new(row.transaction_reference),
            amount: Balance::from_raw(row.amount),
            credit: AccountId::from_uuid(row.credit),
            debit: AccountId::from_uuid(row.debit),
            group,
            sub_group: row.sub_group,
            related_transaction_id: row.related_transaction_id,
            created_at: row.created_at,
        })
    }
}

/// 계정별 잔액 합계 (log replay 결과)
#[derive(Debug, Clone, FromRow)]
pub struct BalanceRow {
    pub account_id: Uuid,
    pub balance: BigDecimal,
}

/// 온체인 이벤트 확정 상태
///
/// `confirmed_at`이 None 이면 pending. 한 번 확정되면 되돌리지 않는다.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ChainConfirmation {
    pub tx: String,
    pub tx_id: String,
    pub block: i64,
    pub chain_id: i64,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChainConfirmation {
    pub fn is_pending(&self) -> bool {
        self.confirmed_at.is_none() && self.deleted_at.is_none()
    }

    pub fn block_number(&self) -> u64 {
        self.block.max(0) as u64
    }
}

/// kv 테이블 행
#[derive(Debug, Clone, FromRow)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

/// 출금 보류 생성 파라미터
#[derive(Debug, Clone)]
pub struct NewPendingRefund {
    pub id: Uuid,
    pub user_id: AccountId,
    pub amount: Balance,
    pub transaction_reference: TransactionReference,
    pub withdraw_transaction_id: String,
    pub refund_at: DateTime<Utc>,
}

/// pending_refunds 테이블 행
#[derive(Debug, Clone, FromRow)]
pub struct PendingRefund {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount_sups: BigDecimal,
    pub transaction_reference: String,
    pub withdraw_transaction_id: Option<String>,
    pub refund_at: DateTime<Utc>,
    pub tx_hash: String,
    pub is_refunded: bool,
    pub refund_canceled_at: Option<DateTime<Utc>>,
    pub reversal_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PendingRefund {
    /// 아직 온체인 출금이 확인되지 않았고 환불도 되지 않은 상태
    pub fn is_open(&self) -> bool {
        !self.is_refunded
            && self.refund_canceled_at.is_none()
            && self.deleted_at.is_none()
            && self.tx_hash.is_empty()
    }
}

/// 만료되어 되돌려야 하는 출금 (원본 트랜잭션 정보 포함)
#[derive(Debug, Clone, FromRow)]
pub struct ExpiredWithdrawal {
    pub refund_id: Uuid,
    pub user_id: Uuid,
    pub amount_sups: BigDecimal,
    pub transaction_reference: String,
    pub description: String,
    pub withdraw_transaction_id: Option<String>,
}

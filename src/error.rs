//! Error Handling Module
//!
//! Layered error types for the ledger engine. `StoreError` is what the
//! persistence layer reports, `LedgerError` is the taxonomy `Process`
//! returns to its callers, `BridgeError` covers the data feed and chain RPC.

use thiserror::Error;

use crate::types::{AccountId, Balance};

/// Ledger Store 에러
#[derive(Debug, Error)]
pub enum StoreError {
    /// transaction_reference 또는 on-chain tx hash 중복
    #[error("Duplicate transaction reference: {0}")]
    DuplicateReference(String),

    #[error("Database error: {0}")]
    Database(String),

    /// 저장된 값 파싱 실패 (잘못된 UUID, 숫자 등)
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// INSERT 실패를 reference 정보와 함께 분류
    pub fn from_insert(err: sqlx::Error, reference: &str) -> Self {
        if is_unique_violation(&err) {
            StoreError::DuplicateReference(reference.to_string())
        } else {
            StoreError::from(err)
        }
    }
}

/// SQLx 에러를 StoreError로 변환
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            return StoreError::DuplicateReference(err.to_string());
        }
        StoreError::Database(err.to_string())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Transaction Processor 에러
///
/// # Design Decision
///
/// - `Validation`, `InsufficientFunds`, `AlreadyProcessed`: 호출자에게 그대로 반환
/// - `Store`, `Timeout`, `Canceled`: 재시도 가능, 부분 적용 없음
/// - `AlreadyProcessed`는 재시도 시 성공적인 no-op 으로 취급
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient funds in account {account}: balance {balance}, required {required}")]
    InsufficientFunds {
        account: AccountId,
        balance: Balance,
        required: Balance,
    },

    #[error("Transaction already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Canceled")]
    Canceled,
}

impl LedgerError {
    pub fn is_already_processed(&self) -> bool {
        matches!(self, LedgerError::AlreadyProcessed(_))
    }

    /// 호출자가 같은 요청을 다시 보내도 되는지
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Store(_) | LedgerError::Timeout(_) | LedgerError::Canceled
        )
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateReference(reference) => LedgerError::AlreadyProcessed(reference),
            other => LedgerError::Store(other),
        }
    }
}

/// 브릿지 (data feed, chain RPC) 에러
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Data feed request failed: {0}")]
    Feed(String),

    #[error("Invalid feed record: {0}")]
    Decode(String),

    #[error("Chain RPC error: {0}")]
    Rpc(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BridgeError::Decode(err.to_string())
        } else {
            BridgeError::Feed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_maps_to_already_processed() {
        let err: LedgerError = StoreError::DuplicateReference("tx-1".to_string()).into();
        assert!(err.is_already_processed());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_database_error_is_retryable() {
        let err: LedgerError = StoreError::Database("connection reset".to_string()).into();
        assert!(matches!(err, LedgerError::Store(_)));
        assert!(err.is_retryable());
        assert!(LedgerError::Timeout("waiting for account locks").is_retryable());
    }

    #[test]
    fn test_non_database_sqlx_error() {
        let err = StoreError::from_insert(sqlx::Error::RowNotFound, "tx-1");
        assert!(matches!(err, StoreError::Database(_)));
    }
}

//! Database Module
//!
//! PostgreSQL persistence for the ledger.
//!
//! - `transactions`: append-only log, balances are derived from it
//! - `chain_confirmations`: pending on-chain events written with their transaction
//! - `kv`: cursors, exchange rates, operational flags
//! - `pending_refunds`: withdrawal holds
//!
//! 모든 쿼리는 runtime `sqlx::query` 사용 (빌드 시 DB 불필요).

mod models;
mod repository;

pub use models::*;
pub use repository::*;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{AccountId, Balance, ChainEvent, TxHash, WalletAddress};

/// 데이터베이스 연결 및 쿼리 담당
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 데이터베이스 연결
    ///
    /// # Connection Pool Settings
    ///
    /// - max_connections: 10
    /// - min_connections: 1
    /// - acquire_timeout: 3초
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// 마이그레이션 실행
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============ Ledger ============

#[async_trait]
impl LedgerStore for Database {
    async fn append_transaction(
        &self,
        tx: &TransactionRecord,
        chain_event: Option<&ChainEvent>,
    ) -> Result<(), StoreError> {
        let reference = tx.transaction_reference.as_str();
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, description, transaction_reference, amount,
                credit, debit, "group", sub_group, related_transaction_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#
        )
        .bind(&tx.id)
        .bind(&tx.description)
        .bind(reference)
        .bind(tx.amount.as_raw())
        .bind(tx.credit.as_uuid())
        .bind(tx.debit.as_uuid())
        .bind(tx.group.as_str())
        .bind(&tx.sub_group)
        .bind(&tx.related_transaction_id)
        .bind(tx.created_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| StoreError::from_insert(e, reference))?;

        if let Some(event) = chain_event {
            sqlx::query(
                r#"
                INSERT INTO chain_confirmations (tx, tx_id, block, chain_id)
                VALUES ($1, $2, $3, $4)
                "#
            )
            .bind(event.tx_hash.as_str())
            .bind(&tx.id)
            .bind(event.block as i64)
            .bind(event.chain_id as i64)
            .execute(&mut *db_tx)
            .await
            .map_err(|e| StoreError::from_insert(e, event.tx_hash.as_str()))?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn load_all_balances(&self) -> Result<HashMap<AccountId, Balance>, StoreError> {
        let rows = sqlx::query_as::<_, BalanceRow>(
            r#"
            SELECT account_id, SUM(delta)::NUMERIC(78, 0) AS balance
            FROM (
                SELECT credit AS account_id, amount AS delta FROM transactions
                UNION ALL
                SELECT debit AS account_id, -amount AS delta FROM transactions
            ) entries
            GROUP BY account_id
            "#
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (AccountId::from_uuid(row.account_id), Balance::from_raw(row.balance)))
            .collect())
    }

    async fn get_balance(&self, id: AccountId) -> Result<Balance, StoreError> {
        let balance: BigDecimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(CASE WHEN credit = $1 THEN amount ELSE -amount END), 0)::NUMERIC(78, 0)
            FROM transactions
            WHERE credit = $1 OR debit = $1
            "#
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(Balance::from_raw(balance))
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, description, transaction_reference, amount,
                   credit, debit, "group", sub_group, related_transaction_id, created_at
            FROM transactions
            WHERE id = $1
            "#
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRecord::try_from).transpose()
    }
}

// ============ KV ============

#[async_trait]
impl KvStore for Database {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entry = sqlx::query_as::<_, KvEntry>("SELECT key, value FROM kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry.map(|e| e.value))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value
            "#
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============ Chain Confirmations ============

#[async_trait]
impl ConfirmationStore for Database {
    async fn pending_confirmations(&self, chain_id: u64) -> Result<Vec<ChainConfirmation>, StoreError> {
        let rows = sqlx::query_as::<_, ChainConfirmation>(
            r#"
            SELECT tx, tx_id, block, chain_id, confirmed_at, created_at, deleted_at
            FROM chain_confirmations
            WHERE chain_id = $1 AND confirmed_at IS NULL AND deleted_at IS NULL
            ORDER BY block ASC
            "#
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn confirm(&self, tx_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE chain_confirmations
            SET confirmed_at = NOW()
            WHERE tx = $1 AND confirmed_at IS NULL
            "#
        )
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============ Accounts ============

#[async_trait]
impl AccountDirectory for Database {
    async fn find_by_wallet(&self, wallet: &WalletAddress) -> Result<Option<AccountId>, StoreError> {
        let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM accounts WHERE public_address = $1")
            .bind(wallet.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(AccountId::from_uuid))
    }

    async fn account_for_wallet(&self, wallet: &WalletAddress) -> Result<AccountId, StoreError> {
        // 동시 생성 시에도 같은 id 반환
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO accounts (id, public_address, kind)
            VALUES ($1, $2, 'normal')
            ON CONFLICT (public_address)
            DO UPDATE SET public_address = EXCLUDED.public_address
            RETURNING id
            "#
        )
        .bind(Uuid::new_v4())
        .bind(wallet.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(AccountId::from_uuid(id))
    }
}

// ============ Withdrawal Holds ============

#[async_trait]
impl RefundStore for Database {
    async fn insert_pending_refund(&self, refund: &NewPendingRefund) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pending_refunds (
                id, user_id, amount_sups, transaction_reference, withdraw_transaction_id, refund_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#
        )
        .bind(refund.id)
        .bind(refund.user_id.as_uuid())
        .bind(refund.amount.as_raw())
        .bind(refund.transaction_reference.as_str())
        .bind(&refund.withdraw_transaction_id)
        .bind(refund.refund_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attach_withdraw_tx_hash(
        &self,
        user: AccountId,
        amount: &Balance,
        tx_hash: &TxHash,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_refunds
            SET tx_hash = $3, refund_canceled_at = NOW()
            WHERE id = (
                SELECT id FROM pending_refunds
                WHERE user_id = $1
                  AND amount_sups = $2
                  AND tx_hash = ''
                  AND is_refunded = FALSE
                  AND refund_canceled_at IS NULL
                  AND deleted_at IS NULL
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND NOT EXISTS (SELECT 1 FROM pending_refunds WHERE tx_hash = $3)
            "#
        )
        .bind(user.as_uuid())
        .bind(amount.as_raw())
        .bind(tx_hash.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired_withdrawals(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredWithdrawal>, StoreError> {
        let rows = sqlx::query_as::<_, ExpiredWithdrawal>(
            r#"
            SELECT pr.id AS refund_id,
                   pr.user_id,
                   pr.amount_sups,
                   pr.transaction_reference,
                   COALESCE(t.description, '') AS description,
                   pr.withdraw_transaction_id
            FROM pending_refunds pr
            LEFT JOIN transactions t ON t.id = pr.withdraw_transaction_id
            WHERE pr.refund_at < $1
              AND pr.tx_hash = ''
              AND pr.is_refunded = FALSE
              AND pr.refund_canceled_at IS NULL
              AND pr.deleted_at IS NULL
            ORDER BY pr.refund_at ASC
            "#
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_refunded(
        &self,
        refund_id: Uuid,
        reversal_transaction_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE pending_refunds
            SET is_refunded = TRUE, reversal_transaction_id = $2
            WHERE id = $1
            "#
        )
        .bind(refund_id)
        .bind(reversal_transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

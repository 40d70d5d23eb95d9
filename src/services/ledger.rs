//! Transaction Processor
//!
//! The single choke point for balance mutation.
//!
//! # Process
//!
//! ```text
//! validate ─▶ lock(from, to) ─▶ read balances ─▶ funds check
//!                                                   │
//!     unlock ◀─ publish ◀─ update cache ◀─ append + commit
//! ```
//!
//! - 락 대기와 DB 커밋은 모두 deadline / cancellation 으로 제한된다
//! - 커밋 이전의 모든 실패는 로그와 캐시를 건드리지 않는다
//! - append 는 계정 락과 함께 별도 태스크에서 끝까지 수행된다. 호출자가 deadline 으로
//!   먼저 돌아가도 스토어가 응답할 때까지 락을 놓지 않으므로, 늦게 도착한 커밋을
//!   모른 채 같은 잔액을 다시 쓰는 일이 없다
//! - reference 중복은 `AlreadyProcessed` (재시도 시 성공적인 no-op)
//!
//! Refund 는 별도 모드가 아니라 방향이 반대인 두 번째 `process` 호출이다.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::balance_cache::{AccountLocks, BalanceCache};
use super::events::{BalanceEvent, BalancePublisher};
use crate::db::{LedgerStore, TransactionRecord};
use crate::error::{LedgerError, StoreError};
use crate::types::{AccountId, AccountKind, Balance, ChainEvent, NewTransactionRequest};

/// `process` 결과
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedTransaction {
    pub transaction_id: String,
    pub from_balance: Balance,
    pub to_balance: Balance,
}

/// 호출자가 전달하는 deadline / 취소 토큰
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 원장 서비스
///
/// 소비자(브릿지, 출금, API 핸들러)는 이 trait 에만 의존한다.
#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn process(
        &self,
        req: NewTransactionRequest,
        ctx: &CallContext,
    ) -> Result<ProcessedTransaction, LedgerError>;
}

pub struct TransactionProcessor {
    store: Arc<dyn LedgerStore>,
    cache: Arc<BalanceCache>,
    publisher: Arc<dyn BalancePublisher>,
    /// ctx 에 deadline 이 없을 때 사용
    default_timeout: Duration,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Arc<BalanceCache>,
        publisher: Arc<dyn BalancePublisher>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            default_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<BalanceCache> {
        &self.cache
    }

    /// 기존 트랜잭션의 보상 트랜잭션 실행
    ///
    /// 원본 행은 그대로 두고 `refund` 그룹의 새 행을 추가한다.
    pub async fn refund(
        &self,
        original_id: &str,
        reference: impl Into<String>,
        description: impl Into<String>,
        ctx: &CallContext,
    ) -> Result<ProcessedTransaction, LedgerError> {
        let original = self
            .store
            .get_transaction(original_id)
            .await?
            .ok_or_else(|| LedgerError::Validation(format!("unknown transaction {original_id}")))?;

        self.process(original.compensation(reference, description), ctx)
            .await
    }

    /// 취소 또는 deadline 이 먼저 오면 future 를 drop 한다
    async fn bounded<F: Future>(
        ctx: &CallContext,
        deadline: Instant,
        stage: &'static str,
        fut: F,
    ) -> Result<F::Output, LedgerError> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(LedgerError::Canceled),
            res = tokio::time::timeout_at(deadline, fut) => res.map_err(|_| LedgerError::Timeout(stage)),
        }
    }
}

/// 계정 락을 쥔 채로 append 를 끝까지 수행하는 작업
///
/// 결과가 나온 뒤에만 캐시를 갱신(또는 무효화)하고 이벤트를 발행한 다음 락을 놓는다.
struct CommitJob {
    store: Arc<dyn LedgerStore>,
    cache: Arc<BalanceCache>,
    publisher: Arc<dyn BalancePublisher>,
    locks: AccountLocks,
    record: TransactionRecord,
    chain_event: Option<ChainEvent>,
    from_balance: Balance,
    to_balance: Balance,
}

impl CommitJob {
    async fn run(self) -> Result<(Balance, Balance), LedgerError> {
        let record = &self.record;
        match self
            .store
            .append_transaction(record, self.chain_event.as_ref())
            .await
        {
            Ok(()) => {}
            Err(StoreError::DuplicateReference(reference)) => {
                debug!(reference = %reference, "Transaction already processed");
                return Err(LedgerError::AlreadyProcessed(reference));
            }
            Err(e) => {
                // 커밋 여부를 알 수 없으므로 다음 접근 시 로그에서 재계산
                self.cache.invalidate(&self.locks).await;
                error!(
                    from = %record.debit,
                    to = %record.credit,
                    reference = %record.transaction_reference,
                    error = %e,
                    "Failed to append transaction"
                );
                return Err(LedgerError::Store(e));
            }
        }

        let from_balance = self.from_balance.checked_sub(&record.amount);
        let to_balance = self.to_balance.checked_add(&record.amount);
        self.cache
            .commit_balances(
                &self.locks,
                &[
                    (record.debit, from_balance.clone()),
                    (record.credit, to_balance.clone()),
                ],
            )
            .await;

        debug!(
            id = %record.id,
            from = %record.debit,
            to = %record.credit,
            amount = %record.amount,
            reference = %record.transaction_reference,
            "Transaction processed"
        );

        // 락을 쥔 상태에서 발행해야 계정별 이벤트 순서가 커밋 순서와 같다
        self.publish(record.debit, from_balance.clone());
        self.publish(record.credit, to_balance.clone());
        Ok((from_balance, to_balance))
    }

    fn publish(&self, account_id: AccountId, balance: Balance) {
        if let Err(e) = self.publisher.publish(BalanceEvent::new(account_id, balance)) {
            warn!(account = %account_id, error = %e, "Failed to publish balance event");
        }
    }
}

#[async_trait]
impl LedgerService for TransactionProcessor {
    async fn process(
        &self,
        req: NewTransactionRequest,
        ctx: &CallContext,
    ) -> Result<ProcessedTransaction, LedgerError> {
        req.validate().map_err(LedgerError::Validation)?;
        if ctx.is_canceled() {
            return Err(LedgerError::Canceled);
        }

        let deadline = ctx
            .deadline
            .unwrap_or_else(|| Instant::now() + self.default_timeout);

        let locks = Self::bounded(
            ctx,
            deadline,
            "waiting for account locks",
            self.cache.lock_accounts(&[req.from, req.to]),
        )
        .await?;

        let from_balance = Self::bounded(
            ctx,
            deadline,
            "loading balances",
            self.cache.balance_locked(&locks, req.from),
        )
        .await??;
        let to_balance = Self::bounded(
            ctx,
            deadline,
            "loading balances",
            self.cache.balance_locked(&locks, req.to),
        )
        .await??;

        if req.from.kind() == AccountKind::Normal && from_balance < req.amount {
            return Err(LedgerError::InsufficientFunds {
                account: req.from,
                balance: from_balance,
                required: req.amount,
            });
        }

        let record = TransactionRecord::from_request(&req);
        let transaction_id = record.id.clone();
        let commit = tokio::spawn(
            CommitJob {
                store: self.store.clone(),
                cache: self.cache.clone(),
                publisher: self.publisher.clone(),
                locks,
                record,
                chain_event: req.chain_event.clone(),
                from_balance,
                to_balance,
            }
            .run(),
        );

        match Self::bounded(ctx, deadline, "committing transaction", commit).await {
            Ok(Ok(Ok((from_balance, to_balance)))) => Ok(ProcessedTransaction {
                transaction_id,
                from_balance,
                to_balance,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) => {
                error!(reference = %req.transaction_reference, error = %join_err, "Commit task failed");
                Err(LedgerError::Store(StoreError::Database(format!(
                    "commit task failed: {join_err}"
                ))))
            }
            Err(e) => {
                warn!(
                    from = %req.from,
                    to = %req.to,
                    reference = %req.transaction_reference,
                    error = %e,
                    "Commit outcome pending, account locks held until the store answers"
                );
                Err(e)
            }
        }
    }
}

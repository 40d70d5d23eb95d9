//! Withdrawal Holds
//!
//! A withdrawal debits the user immediately and records a hold. The hold is
//! closed either by the matching on-chain withdraw transfer, or, once it
//! expires unmatched, by a compensating refund transaction.
//!
//! # Lifecycle
//! ```text
//! request_withdrawal ─▶ hold (tx_hash = '')
//!                          ├─ on-chain transfer seen ─▶ tx_hash set, refund canceled
//!                          └─ refund_at passed       ─▶ "REFUND {reference}" (rollback flag on)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::chain_source::{sups_from_token_units, TransferRecord};
use super::ledger::{CallContext, LedgerService};
use crate::db::{AccountDirectory, ExpiredWithdrawal, NewPendingRefund, RefundStore};
use crate::error::{BridgeError, LedgerError};
use crate::types::{
    AccountId, Balance, NewTransactionRequest, TransactionGroup, TransactionReference,
    ON_CHAIN_ACCOUNT,
};

/// 생성된 출금 보류
#[derive(Debug, Clone)]
pub struct WithdrawalHold {
    pub refund_id: Uuid,
    pub transaction_id: String,
    pub transaction_reference: TransactionReference,
    pub refund_at: DateTime<Utc>,
    pub balance: Balance,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub matched: usize,
    pub skipped: usize,
    /// 스토어/파싱 오류로 판단하지 못한 기록 (재스캔 대상)
    pub failed: usize,
    pub first_failed_block: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversalReport {
    pub reversed: usize,
    pub failed: usize,
    /// 롤백 비활성화로 보류만 된 건수
    pub dry_run: usize,
}

pub struct WithdrawalService {
    ledger: Arc<dyn LedgerService>,
    refunds: Arc<dyn RefundStore>,
    accounts: Arc<dyn AccountDirectory>,
    /// 만료 이후 추가 유예 시간
    hold: ChronoDuration,
}

fn reversal_reference(reference: &str) -> String {
    format!("REFUND {reference}")
}

impl WithdrawalService {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        refunds: Arc<dyn RefundStore>,
        accounts: Arc<dyn AccountDirectory>,
        hold: ChronoDuration,
    ) -> Self {
        Self {
            ledger,
            refunds,
            accounts,
            hold,
        }
    }

    /// 출금 요청: 즉시 차감 + 보류 기록
    ///
    /// 보류 기록에 실패하면 차감을 즉시 되돌린다.
    pub async fn request_withdrawal(
        &self,
        user: AccountId,
        amount: Balance,
        expiry: DateTime<Utc>,
        ctx: &CallContext,
    ) -> Result<WithdrawalHold, LedgerError> {
        let reference = format!("{}|{}", Uuid::new_v4(), Utc::now().timestamp_subsec_nanos());
        let req = NewTransactionRequest::new(
            user,
            ON_CHAIN_ACCOUNT,
            amount.clone(),
            reference.clone(),
            TransactionGroup::Withdrawal,
        )
        .sub_group("hold")
        .description(format!("Withdraw of {} SUPS", amount.to_sups_string()));

        let processed = self.ledger.process(req, ctx).await?;

        let hold = NewPendingRefund {
            id: Uuid::new_v4(),
            user_id: user,
            amount: amount.clone(),
            transaction_reference: TransactionReference::new(reference.clone()),
            withdraw_transaction_id: processed.transaction_id.clone(),
            refund_at: expiry + self.hold,
        };

        if let Err(e) = self.refunds.insert_pending_refund(&hold).await {
            error!(user = %user, reference = %reference, error = %e, "Failed to record withdrawal hold, reversing debit");
            let reversal = NewTransactionRequest::new(
                ON_CHAIN_ACCOUNT,
                user,
                amount,
                reversal_reference(&reference),
                TransactionGroup::Refund,
            )
            .sub_group("withdrawal")
            .related_to(processed.transaction_id.clone())
            .description("REFUND withdrawal hold could not be recorded");
            if let Err(reverse_err) = self.ledger.process(reversal, ctx).await {
                error!(user = %user, reference = %reference, error = %reverse_err, "Failed to reverse withdrawal debit");
            }
            return Err(e.into());
        }

        Ok(WithdrawalHold {
            refund_id: hold.id,
            transaction_id: processed.transaction_id,
            transaction_reference: hold.transaction_reference,
            refund_at: hold.refund_at,
            balance: processed.from_balance,
        })
    }

    /// 온체인 출금 기록을 보류와 매칭 (지갑 + 정확한 금액, 가장 오래된 것부터)
    pub async fn match_onchain_withdrawals(&self, records: &[TransferRecord]) -> MatchReport {
        let mut report = MatchReport::default();

        for record in records {
            match self.match_one(record).await {
                Ok(true) => report.matched += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(tx_hash = %record.tx_hash, block = record.block_number, error = %e, "Could not match withdraw record");
                    report.failed += 1;
                    report.first_failed_block = Some(
                        report
                            .first_failed_block
                            .map_or(record.block_number, |b| b.min(record.block_number)),
                    );
                }
            }
        }

        report
    }

    async fn match_one(&self, record: &TransferRecord) -> Result<bool, BridgeError> {
        let hash = record.hash()?;
        let wallet = record.recipient()?;
        let amount = sups_from_token_units(&record.raw_value()?, record.value_decimals);

        let Some(user) = self.accounts.find_by_wallet(&wallet).await? else {
            return Ok(false);
        };
        Ok(self.refunds.attach_withdraw_tx_hash(user, &amount, &hash).await?)
    }

    /// 만료된 보류 되돌리기
    ///
    /// `enabled` 가 false 면 로그만 남긴다. reference 가 결정적이므로
    /// 이미 처리된 환불은 `AlreadyProcessed` 로 돌아오고 보류만 닫는다.
    pub async fn reverse_expired(
        &self,
        enabled: bool,
        ctx: &CallContext,
    ) -> Result<ReversalReport, BridgeError> {
        let expired = self.refunds.expired_withdrawals(Utc::now()).await?;
        let mut report = ReversalReport::default();

        for withdrawal in expired {
            if !enabled {
                info!(
                    refund_id = %withdrawal.refund_id,
                    user = %withdrawal.user_id,
                    reference = %withdrawal.transaction_reference,
                    "Withdraw rollback disabled, leaving expired hold"
                );
                report.dry_run += 1;
                continue;
            }

            match self.reverse_one(&withdrawal, ctx).await {
                Ok(()) => report.reversed += 1,
                Err(BridgeError::Ledger(LedgerError::Canceled)) => break,
                Err(e) => {
                    warn!(refund_id = %withdrawal.refund_id, error = %e, "Failed to reverse withdraw");
                    report.failed += 1;
                }
            }
        }

        if report != ReversalReport::default() {
            info!(
                reversed = report.reversed,
                failed = report.failed,
                dry_run = report.dry_run,
                "Processed expired withdraws"
            );
        }
        Ok(report)
    }

    async fn reverse_one(&self, withdrawal: &ExpiredWithdrawal, ctx: &CallContext) -> Result<(), BridgeError> {
        let mut req = NewTransactionRequest::new(
            ON_CHAIN_ACCOUNT,
            AccountId::from_uuid(withdrawal.user_id),
            Balance::from_raw(withdrawal.amount_sups.clone()),
            reversal_reference(&withdrawal.transaction_reference),
            TransactionGroup::Refund,
        )
        .sub_group("withdrawal")
        .description(format!("REFUND {}", withdrawal.description));
        if let Some(id) = &withdrawal.withdraw_transaction_id {
            req = req.related_to(id.clone());
        }

        let reversal_id = match self.ledger.process(req, ctx).await {
            Ok(processed) => Some(processed.transaction_id),
            Err(LedgerError::AlreadyProcessed(_)) => None,
            Err(e) => return Err(e.into()),
        };

        self.refunds
            .mark_refunded(withdrawal.refund_id, reversal_id.as_deref())
            .await?;
        Ok(())
    }
}

//! Chain Bridge Reconciler
//!
//! Turns on-chain transfer records into idempotent ledger transactions.
//!
//! # Tick
//! ```text
//! feed health ─▶ exchange rates ─▶ streams (purchase, deposit, withdraw)
//!                                      │
//!              withdraw rollback ◀─ finality
//! ```
//!
//! # Per stream
//! 1. 커서(마지막 스캔 블록) 읽기
//! 2. 커서 이후 기록 조회, 블록 순 정렬
//! 3. 기록마다 `process` 호출 (tx hash 가 reference 이므로 중복은 `AlreadyProcessed`)
//! 4. 한 기록의 실패는 배치를 중단하지 않는다
//! 5. 처리한 가장 높은 블록으로 커서 전진
//!
//! 취소되면 그때까지 처리한 기록까지만 커서를 전진한다. 피드는 `since_block` 블록을
//! 다시 돌려주므로 같은 블록의 나머지 기록은 다음 tick 에서 처리된다.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::types::BigDecimal;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chain_source::{
    purchase_sups, sups_from_token_units, BridgeStream, Chain, ChainSource, StreamKind,
    TransferRecord,
};
use super::events::{EventHub, ExchangeRatesUpdate};
use super::finality::ConfirmationTracker;
use super::kv::{ExchangeRates, KvCache, KvKey};
use super::ledger::{CallContext, LedgerService};
use super::withdrawals::WithdrawalService;
use crate::db::AccountDirectory;
use crate::error::{BridgeError, LedgerError};
use crate::types::{
    ten_pow, ChainEvent, NewTransactionRequest, TransactionGroup, WalletAddress, ON_CHAIN_ACCOUNT,
    SALE_ACCOUNT,
};

/// 연속 실패가 이 값을 넘으면 출금 롤백 중지
const FEED_FAILURE_LIMIT: u64 = 5;
/// 연속 성공이 이 값을 넘으면 출금 롤백 재개
const FEED_RECOVERY_THRESHOLD: u64 = 10;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// SUPS 판매 컨트랙트 (여기서 나온 전송은 입금이 아님)
    pub purchase_contract: WalletAddress,
    pub eth_chain_id: u64,
    pub bsc_chain_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cursor: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub streams: Vec<(BridgeStream, StreamReport)>,
    pub confirmed: usize,
    pub reversed: usize,
}

enum RecordOutcome {
    Stored,
    Duplicate,
    Skipped,
}

pub struct BridgeReconciler {
    ledger: Arc<dyn LedgerService>,
    source: Arc<dyn ChainSource>,
    kv: Arc<KvCache>,
    accounts: Arc<dyn AccountDirectory>,
    withdrawals: Arc<WithdrawalService>,
    confirmations: Arc<ConfirmationTracker>,
    events: Arc<EventHub>,
    settings: ReconcilerSettings,
}

impl BridgeReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        source: Arc<dyn ChainSource>,
        kv: Arc<KvCache>,
        accounts: Arc<dyn AccountDirectory>,
        withdrawals: Arc<WithdrawalService>,
        confirmations: Arc<ConfirmationTracker>,
        events: Arc<EventHub>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            ledger,
            source,
            kv,
            accounts,
            withdrawals,
            confirmations,
            events,
            settings,
        }
    }

    /// 한 번의 전체 동기화
    ///
    /// 각 단계의 실패는 로그만 남기고 다음 단계로 진행한다.
    pub async fn run_once(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        if let Err(e) = self.check_feed_health().await {
            warn!(error = %e, "Feed health bookkeeping failed");
        }

        let rates = match self.refresh_exchange_rates().await {
            Ok(rates) => rates,
            Err(e) => {
                warn!(error = %e, "Exchange rate refresh failed, using stored rates");
                match self.kv.exchange_rates().await {
                    Ok(rates) => rates,
                    Err(e) => {
                        error!(error = %e, "Could not read stored exchange rates");
                        return report;
                    }
                }
            }
        };

        for stream in BridgeStream::ALL {
            if cancel.is_cancelled() {
                return report;
            }
            match self.kv.get_bool(stream.enable_flag(), false).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(stream = stream.path(), error = %e, "Could not read sync flag");
                    continue;
                }
            }
            match self.sync_stream(stream, &rates, cancel).await {
                Ok(stream_report) => report.streams.push((stream, stream_report)),
                Err(e) => error!(stream = stream.path(), error = %e, "Stream sync failed"),
            }
        }

        match self.confirmations.promote().await {
            Ok(confirmed) => report.confirmed = confirmed.confirmed,
            Err(e) => warn!(error = %e, "Confirmation promotion failed"),
        }

        if cancel.is_cancelled() {
            return report;
        }
        match self.reverse_failed_withdraws(cancel).await {
            Ok(reversed) => report.reversed = reversed,
            Err(e) => error!(error = %e, "Withdraw rollback failed"),
        }

        report
    }

    /// 한 스트림 동기화
    pub async fn sync_stream(
        &self,
        stream: BridgeStream,
        rates: &ExchangeRates,
        cancel: &CancellationToken,
    ) -> Result<StreamReport, BridgeError> {
        let cursor_key = stream.cursor_key();
        let since_block = self.kv.get_u64(cursor_key, 0).await?;

        let mut records = self.source.transfers(stream, since_block).await?;
        records.sort_by_key(|r| r.block_number);

        let mut report = StreamReport {
            cursor: since_block,
            ..Default::default()
        };

        if stream.kind() == StreamKind::Withdraw {
            let matched = self.withdrawals.match_onchain_withdrawals(&records).await;
            report.stored = matched.matched;
            report.skipped = matched.skipped;
            report.failed = matched.failed;
            report.cursor = records
                .iter()
                .map(|r| r.block_number)
                .fold(since_block, u64::max);
            // 매칭에 실패한 블록부터 다시 스캔 (since_block 포함)
            if let Some(block) = matched.first_failed_block {
                report.cursor = report.cursor.min(block).max(since_block);
            }
        } else {
            let ctx = CallContext::new().with_cancellation(cancel.clone());
            for record in &records {
                if cancel.is_cancelled() {
                    break;
                }
                match self.apply(stream, record, rates, &ctx).await {
                    Ok(RecordOutcome::Stored) => report.stored += 1,
                    Ok(RecordOutcome::Duplicate) => report.duplicates += 1,
                    Ok(RecordOutcome::Skipped) => report.skipped += 1,
                    Err(BridgeError::Ledger(LedgerError::Canceled)) => break,
                    Err(e) => {
                        error!(
                            stream = stream.path(),
                            tx_hash = %record.tx_hash,
                            block = record.block_number,
                            error = %e,
                            "Failed to apply transfer record"
                        );
                        report.failed += 1;
                    }
                }
                report.cursor = report.cursor.max(record.block_number);
            }
        }

        if report.cursor > since_block {
            self.kv.put_u64(cursor_key, report.cursor).await?;
        }

        info!(
            stream = stream.path(),
            since_block,
            cursor = report.cursor,
            stored = report.stored,
            duplicates = report.duplicates,
            skipped = report.skipped,
            failed = report.failed,
            "Synced bridge stream"
        );
        Ok(report)
    }

    async fn apply(
        &self,
        stream: BridgeStream,
        record: &TransferRecord,
        rates: &ExchangeRates,
        ctx: &CallContext,
    ) -> Result<RecordOutcome, BridgeError> {
        let hash = record.hash()?;
        let sender = record.sender()?;
        let chain_id = match stream.chain() {
            Chain::Ethereum => self.settings.eth_chain_id,
            Chain::Bsc => self.settings.bsc_chain_id,
        };

        let req = match stream.kind() {
            StreamKind::Purchase => {
                let amount = purchase_sups(record, rates)?;
                if !amount.is_positive() {
                    return Ok(RecordOutcome::Skipped);
                }
                let paid = (record.raw_value()? / ten_pow(record.value_decimals)).with_scale(4);
                let user = self.accounts.account_for_wallet(&sender).await?;
                NewTransactionRequest::new(SALE_ACCOUNT, user, amount.clone(), hash.as_str(), TransactionGroup::Store)
                    .sub_group("purchase")
                    .description(format!(
                        "purchased {} SUPS for {} [{}]",
                        amount.to_sups_string(),
                        paid,
                        record.symbol.to_uppercase()
                    ))
            }
            StreamKind::Deposit => {
                if sender == self.settings.purchase_contract {
                    return Ok(RecordOutcome::Skipped);
                }
                let amount = sups_from_token_units(&record.raw_value()?, record.value_decimals);
                if !amount.is_positive() {
                    return Ok(RecordOutcome::Skipped);
                }
                let user = self.accounts.account_for_wallet(&sender).await?;
                NewTransactionRequest::new(ON_CHAIN_ACCOUNT, user, amount.clone(), hash.as_str(), TransactionGroup::Bridge)
                    .sub_group("deposit")
                    .description(format!("deposited {} SUPS", amount.to_sups_string()))
            }
            StreamKind::Withdraw => return Ok(RecordOutcome::Skipped),
        };

        let req = req.chain_event(ChainEvent {
            tx_hash: hash,
            block: record.block_number,
            chain_id,
        });

        match self.ledger.process(req, ctx).await {
            Ok(processed) => {
                debug!(tx_hash = %record.tx_hash, id = %processed.transaction_id, "Stored bridge transaction");
                Ok(RecordOutcome::Stored)
            }
            Err(LedgerError::AlreadyProcessed(_)) => Ok(RecordOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    /// 피드에서 SUPS/ETH/BNB 가격을 받아 KV 에 저장하고 발행
    ///
    /// SUPS 는 multiplier 를 곱하고 floor 이하로 내려가지 않는다.
    /// 조회 실패 시 저장된 값을 사용하며, 0 이하 가격은 에러다.
    pub async fn refresh_exchange_rates(&self) -> Result<ExchangeRates, BridgeError> {
        let zero = BigDecimal::from(0);
        let stored = self.kv.exchange_rates().await?;
        let floor = self.kv.get_decimal(KvKey::PurchaseSupsFloorPrice, zero.clone()).await?;
        let multiplier = self
            .kv
            .get_decimal(KvKey::PurchaseSupsMarketPriceMultiplier, BigDecimal::from(1))
            .await?;

        let sups_to_usd = match self.source.usd_price("sups").await {
            Ok(market) => {
                let price = market * &multiplier;
                if price < floor {
                    floor
                } else {
                    price
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not fetch sups price");
                stored.sups_to_usd
            }
        };
        let eth_to_usd = self.price_or_stored("eth", stored.eth_to_usd).await;
        let bnb_to_usd = self.price_or_stored("bnb", stored.bnb_to_usd).await;

        for (symbol, price) in [("sups", &sups_to_usd), ("eth", &eth_to_usd), ("bnb", &bnb_to_usd)] {
            if *price <= zero {
                return Err(BridgeError::Decode(format!("non-positive {symbol} price {price}")));
            }
        }

        let rates = ExchangeRates {
            sups_to_usd,
            eth_to_usd,
            bnb_to_usd,
        };
        self.kv.store_exchange_rates(&rates).await?;
        self.events.publish_exchange_rates(ExchangeRatesUpdate {
            sups_to_usd: rates.sups_to_usd.to_string(),
            eth_to_usd: rates.eth_to_usd.to_string(),
            bnb_to_usd: rates.bnb_to_usd.to_string(),
            timestamp: Utc::now().timestamp(),
        });
        Ok(rates)
    }

    async fn price_or_stored(&self, symbol: &str, stored: BigDecimal) -> BigDecimal {
        match self.source.usd_price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol, error = %e, "Could not fetch price, using stored rate");
                stored
            }
        }
    }

    /// 피드 상태 카운터 갱신 및 출금 롤백 플래그 토글
    pub async fn check_feed_health(&self) -> Result<(), BridgeError> {
        let failures = self.kv.get_u64(KvKey::FeedFailureCount, 0).await?;
        let successes = self.kv.get_u64(KvKey::FeedSuccessCount, 0).await?;
        let rollback_enabled = self.kv.get_bool(KvKey::EnableWithdrawRollback, false).await?;

        if failures > FEED_FAILURE_LIMIT {
            if rollback_enabled {
                error!(failure_count = failures, "Data feed failing, stopping automatic withdraw rollbacks");
            }
            self.kv.put_bool(KvKey::EnableWithdrawRollback, false).await?;
        } else if !rollback_enabled && successes > FEED_RECOVERY_THRESHOLD {
            info!(failure_count = failures, "Data feed restored, resuming automatic withdraw rollbacks");
            self.kv.put_bool(KvKey::EnableWithdrawRollback, true).await?;
        }

        match self.source.ping().await {
            Ok(()) => {
                self.kv.put_u64(KvKey::FeedSuccessCount, successes + 1).await?;
                self.kv.put_u64(KvKey::FeedFailureCount, 0).await?;
            }
            Err(e) => {
                warn!(failure_count = failures + 1, error = %e, "Data feed ping failed");
                self.kv.put_u64(KvKey::FeedFailureCount, failures + 1).await?;
                self.kv.put_u64(KvKey::FeedSuccessCount, 0).await?;
            }
        }
        Ok(())
    }

    /// 출금 동기화가 켜져 있을 때만 만료된 출금을 되돌린다
    async fn reverse_failed_withdraws(&self, cancel: &CancellationToken) -> Result<usize, BridgeError> {
        if !self.kv.get_bool(KvKey::EnableSyncWithdraw, false).await? {
            return Ok(0);
        }
        let rollback = self.kv.get_bool(KvKey::EnableWithdrawRollback, false).await?;
        let ctx = CallContext::new().with_cancellation(cancel.clone());
        let report = self.withdrawals.reverse_expired(rollback, &ctx).await?;
        Ok(report.reversed)
    }

    /// 주기 실행 시작
    ///
    /// `run_once` 가 true 면 한 번만 실행하고 종료한다.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        run_once: bool,
        shutdown: &CancellationToken,
    ) -> ReconcilerHandle {
        let cancel = shutdown.child_token();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let report = self.run_once(&token).await;
                debug!(
                    streams = report.streams.len(),
                    confirmed = report.confirmed,
                    reversed = report.reversed,
                    "Bridge tick complete"
                );

                if run_once {
                    break;
                }
            }
            info!("Bridge reconciler stopped");
        });

        ReconcilerHandle { cancel, task }
    }
}

/// 실행 중인 reconciler. `stop` 으로 취소 후 종료를 기다린다.
pub struct ReconcilerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Bridge reconciler task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::db::mock::MemoryStore;
    use crate::db::KvStore;
    use crate::services::balance_cache::BalanceCache;
    use crate::services::chain_source::mock::ScriptedSource;
    use crate::services::events::mock::RecordingPublisher;
    use crate::services::events::{EventMessage, EXCHANGE_RATES_TOPIC};
    use crate::services::finality::mock::FixedHead;
    use crate::services::finality::FinalityChecker;
    use crate::services::ledger::mock::RecordingLedger;
    use crate::services::ledger::TransactionProcessor;
    use crate::types::{AccountId, Balance};

    const USER_WALLET: &str = "0x00000000000000000000000000000000000000aa";
    const CONTRACT: &str = "0x52b38626D3167e5357FE7348624352B7062fE271";

    struct Harness {
        store: Arc<MemoryStore>,
        source: Arc<ScriptedSource>,
        events: Arc<EventHub>,
        processor: Arc<TransactionProcessor>,
        reconciler: Arc<BridgeReconciler>,
    }

    fn settings() -> ReconcilerSettings {
        ReconcilerSettings {
            purchase_contract: WalletAddress::new(CONTRACT).unwrap(),
            eth_chain_id: 1,
            bsc_chain_id: 56,
        }
    }

    fn build(
        store: &Arc<MemoryStore>,
        source: &Arc<ScriptedSource>,
        ledger: Arc<dyn LedgerService>,
        events: &Arc<EventHub>,
    ) -> Arc<BridgeReconciler> {
        let kv = Arc::new(KvCache::new(store.clone(), Duration::from_secs(30)));
        let withdrawals = Arc::new(WithdrawalService::new(
            ledger.clone(),
            store.clone(),
            store.clone(),
            chrono::Duration::minutes(10),
        ));
        let checkers: Vec<Arc<dyn FinalityChecker>> =
            vec![Arc::new(FixedHead::new(56, 6, 1_000)), Arc::new(FixedHead::new(1, 6, 1_000))];
        let confirmations = Arc::new(ConfirmationTracker::new(store.clone(), checkers));
        Arc::new(BridgeReconciler::new(
            ledger,
            source.clone(),
            kv,
            store.clone(),
            withdrawals,
            confirmations,
            events.clone(),
            settings(),
        ))
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(ScriptedSource::new());
        let events = Arc::new(EventHub::new());
        let cache = Arc::new(BalanceCache::initialise(store.clone()).await.unwrap());
        let processor = Arc::new(TransactionProcessor::new(
            store.clone(),
            cache,
            Arc::new(RecordingPublisher::new()),
            Duration::from_secs(5),
        ));
        let reconciler = build(&store, &source, processor.clone(), &events);
        Harness {
            store,
            source,
            events,
            processor,
            reconciler,
        }
    }

    fn hash(n: u8) -> String {
        format!("0x{}{:02x}", "cd".repeat(31), n)
    }

    fn deposit(n: u8, block: u64, from: &str, sups: i64) -> TransferRecord {
        TransferRecord {
            tx_hash: hash(n),
            block_number: block,
            chain: 56,
            confirmations: 0,
            from_address: from.to_string(),
            to_address: CONTRACT.to_string(),
            value_int: Balance::sups(sups).to_string(),
            value_decimals: 18,
            symbol: String::new(),
            sups: String::new(),
        }
    }

    fn rates() -> ExchangeRates {
        ExchangeRates {
            sups_to_usd: "0.5".parse().unwrap(),
            eth_to_usd: "2000".parse().unwrap(),
            bnb_to_usd: "300".parse().unwrap(),
        }
    }

    async fn user_balance(h: &Harness) -> Balance {
        let wallet = WalletAddress::new(USER_WALLET).unwrap();
        let user: AccountId = h.store.find_by_wallet(&wallet).await.unwrap().unwrap();
        h.processor.cache().get(user).await.unwrap()
    }

    #[tokio::test]
    async fn test_deposits_are_credited_once_and_cursor_advances() {
        let h = harness().await;
        h.source.push(BridgeStream::BscDeposit, deposit(2, 120, USER_WALLET, 5));
        h.source.push(BridgeStream::BscDeposit, deposit(1, 110, USER_WALLET, 10));

        let cancel = CancellationToken::new();
        let report = h
            .reconciler
            .sync_stream(BridgeStream::BscDeposit, &rates(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.stored, 2);
        assert_eq!(report.cursor, 120);
        assert_eq!(h.store.kv_value("latest_deposit_block").as_deref(), Some("120"));
        assert_eq!(user_balance(&h).await, Balance::sups(15));

        // 커서 블록은 다시 조회되므로 중복으로 집계
        let report = h
            .reconciler
            .sync_stream(BridgeStream::BscDeposit, &rates(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.stored, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(user_balance(&h).await, Balance::sups(15));
        assert_eq!(h.source.requests().last(), Some(&(BridgeStream::BscDeposit, 120)));

        // 각 입금은 pending chain confirmation 을 가진다
        let confirmations = h.store.confirmations();
        assert_eq!(confirmations.len(), 2);
        assert!(confirmations.iter().all(|c| c.chain_id == 56 && c.is_pending()));
    }

    #[tokio::test]
    async fn test_deposits_from_sale_contract_and_zero_values_are_skipped() {
        let h = harness().await;
        h.source.push(BridgeStream::EthDeposit, deposit(1, 10, CONTRACT, 10));
        h.source.push(BridgeStream::EthDeposit, deposit(2, 11, USER_WALLET, 0));

        let report = h
            .reconciler
            .sync_stream(BridgeStream::EthDeposit, &rates(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.cursor, 11);
        assert!(h.store.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_batch() {
        let h = harness().await;
        let mut broken = deposit(1, 100, USER_WALLET, 3);
        broken.tx_hash = "0xnothex".to_string();
        h.source.push(BridgeStream::BscDeposit, broken);
        h.source.push(BridgeStream::BscDeposit, deposit(2, 101, USER_WALLET, 4));

        let report = h
            .reconciler
            .sync_stream(BridgeStream::BscDeposit, &rates(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.stored, 1);
        assert_eq!(report.cursor, 101);
        assert_eq!(user_balance(&h).await, Balance::sups(4));
    }

    #[tokio::test]
    async fn test_ledger_failure_is_counted_and_batch_continues() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(ScriptedSource::new());
        let events = Arc::new(EventHub::new());
        let ledger = Arc::new(RecordingLedger::new());
        ledger.fail_reference(&hash(1));
        let reconciler = build(&store, &source, ledger.clone(), &events);

        source.push(BridgeStream::BscDeposit, deposit(1, 5, USER_WALLET, 1));
        source.push(BridgeStream::BscDeposit, deposit(2, 6, USER_WALLET, 1));

        let report = reconciler
            .sync_stream(BridgeStream::BscDeposit, &rates(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.stored, 1);
        assert_eq!(ledger.requests().len(), 1);
        assert_eq!(ledger.requests()[0].group, TransactionGroup::Bridge);
        assert_eq!(ledger.requests()[0].sub_group.as_deref(), Some("deposit"));
    }

    #[tokio::test]
    async fn test_failed_withdraw_match_holds_cursor() {
        let h = harness().await;
        let wallet = WalletAddress::new(USER_WALLET).unwrap();
        let user = AccountId::new_random();
        h.store.bind_wallet(&wallet, user);
        h.processor
            .process(
                NewTransactionRequest::new(ON_CHAIN_ACCOUNT, user, Balance::sups(50), "seed", TransactionGroup::Bridge),
                &CallContext::new(),
            )
            .await
            .unwrap();
        let withdrawals = WithdrawalService::new(
            h.processor.clone(),
            h.store.clone(),
            h.store.clone(),
            chrono::Duration::minutes(10),
        );
        withdrawals
            .request_withdrawal(user, Balance::sups(10), Utc::now(), &CallContext::new())
            .await
            .unwrap();

        let withdraw = |n: u8, block: u64, sups: i64| TransferRecord {
            from_address: CONTRACT.to_string(),
            to_address: USER_WALLET.to_string(),
            ..deposit(n, block, USER_WALLET, sups)
        };
        h.source.push(BridgeStream::BscWithdraw, withdraw(7, 100, 10));
        h.source.push(BridgeStream::BscWithdraw, withdraw(8, 120, 3));

        h.store.set_fail_refund_writes(true);
        let cancel = CancellationToken::new();
        let report = h
            .reconciler
            .sync_stream(BridgeStream::BscWithdraw, &rates(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.cursor, 100);
        assert_eq!(h.store.kv_value("latest_withdraw_block").as_deref(), Some("100"));
        assert!(h.store.refunds()[0].is_open());

        // 장애가 풀리면 실패한 블록부터 다시 매칭
        h.store.set_fail_refund_writes(false);
        let report = h
            .reconciler
            .sync_stream(BridgeStream::BscWithdraw, &rates(), &cancel)
            .await
            .unwrap();
        assert_eq!(h.source.requests().last(), Some(&(BridgeStream::BscWithdraw, 100)));
        assert_eq!(report.stored, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.cursor, 120);
        assert_eq!(h.store.refunds()[0].tx_hash, hash(7));
    }

    #[tokio::test]
    async fn test_canceled_scan_keeps_cursor() {
        let h = harness().await;
        h.source.push(BridgeStream::BscDeposit, deposit(1, 300, USER_WALLET, 1));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h
            .reconciler
            .sync_stream(BridgeStream::BscDeposit, &rates(), &cancel)
            .await
            .unwrap();
        assert_eq!(report.cursor, 0);
        assert!(h.store.kv_value("latest_deposit_block").is_none());
        assert!(h.store.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_purchase_credits_from_sale_account() {
        let h = harness().await;
        let purchase = TransferRecord {
            symbol: "eth".to_string(),
            value_int: "10000000000000000".to_string(),
            ..deposit(7, 42, USER_WALLET, 0)
        };
        h.source.push(BridgeStream::EthPurchase, purchase);

        let report = h
            .reconciler
            .sync_stream(BridgeStream::EthPurchase, &rates(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(user_balance(&h).await, Balance::sups(40));

        let row = &h.store.transactions()[0];
        assert_eq!(row.debit, SALE_ACCOUNT);
        assert_eq!(row.group, TransactionGroup::Store);
        assert_eq!(row.sub_group.as_deref(), Some("purchase"));
        assert_eq!(row.transaction_reference.as_str(), hash(7));
        assert_eq!(row.description, "purchased 40.0000 SUPS for 0.0100 [ETH]");
        assert_eq!(h.store.confirmations()[0].chain_id, 1);
    }

    #[tokio::test]
    async fn test_exchange_rates_apply_multiplier_and_floor() {
        let h = harness().await;
        h.store.put("purchase_sups_market_price_multiplier", "1.1").await.unwrap();
        h.store.put("purchase_sups_floor_price", "0.2").await.unwrap();
        h.source.set_price("sups", "0.1");
        h.source.set_price("eth", "2000");
        h.source.set_price("bnb", "300");
        let mut rx = h.events.subscribe(EXCHANGE_RATES_TOPIC);

        let rates = h.reconciler.refresh_exchange_rates().await.unwrap();
        assert_eq!(rates.sups_to_usd, "0.2".parse::<BigDecimal>().unwrap());
        assert_eq!(h.store.kv_value("eth_to_usd").as_deref(), Some("2000"));
        assert!(matches!(rx.try_recv(), Ok(EventMessage::ExchangeRates(_))));

        h.source.set_price("sups", "0.5");
        let rates = h.reconciler.refresh_exchange_rates().await.unwrap();
        assert_eq!(rates.sups_to_usd, "0.55".parse::<BigDecimal>().unwrap());
    }

    #[tokio::test]
    async fn test_exchange_rates_fall_back_to_stored() {
        let h = harness().await;
        h.source.set_down(true);
        assert!(h.reconciler.refresh_exchange_rates().await.is_err());

        h.store.put("sups_to_usd", "0.3").await.unwrap();
        h.store.put("eth_to_usd", "1800").await.unwrap();
        h.store.put("bnb_to_usd", "250").await.unwrap();
        let kv_reloaded = build(&h.store, &h.source, h.processor.clone(), &h.events);
        let rates = kv_reloaded.refresh_exchange_rates().await.unwrap();
        assert_eq!(rates.eth_to_usd, BigDecimal::from(1800));
    }

    #[tokio::test]
    async fn test_feed_health_toggles_rollback() {
        let h = harness().await;
        h.store.put("enable_withdraw_rollback", "true").await.unwrap();
        h.source.set_down(true);

        for _ in 0..7 {
            h.reconciler.check_feed_health().await.unwrap();
        }
        assert_eq!(h.store.kv_value("avant_failure_count").as_deref(), Some("7"));
        assert_eq!(h.store.kv_value("enable_withdraw_rollback").as_deref(), Some("false"));

        h.source.set_down(false);
        for _ in 0..13 {
            h.reconciler.check_feed_health().await.unwrap();
        }
        assert_eq!(h.store.kv_value("avant_failure_count").as_deref(), Some("0"));
        assert_eq!(h.store.kv_value("enable_withdraw_rollback").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_run_once_respects_sync_flags() {
        let h = harness().await;
        h.source.set_price("sups", "0.5");
        h.source.set_price("eth", "2000");
        h.source.set_price("bnb", "300");
        h.source.push(BridgeStream::BscDeposit, deposit(1, 10, USER_WALLET, 2));

        let report = h.reconciler.run_once(&CancellationToken::new()).await;
        assert!(report.streams.is_empty());
        assert!(h.store.transactions().is_empty());

        h.store.put("enable_sync_deposits", "true").await.unwrap();
        let reconciler = build(&h.store, &h.source, h.processor.clone(), &h.events);
        let report = reconciler.run_once(&CancellationToken::new()).await;
        assert_eq!(report.streams.len(), 2);
        // FixedHead(56) head 1000 >= 10 + 6
        assert_eq!(report.confirmed, 1);
        assert_eq!(user_balance(&h).await, Balance::sups(2));
    }

    #[tokio::test]
    async fn test_spawned_reconciler_stops() {
        let h = harness().await;
        let shutdown = CancellationToken::new();
        let handle = h
            .reconciler
            .clone()
            .spawn(Duration::from_millis(10), false, &shutdown);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap();
        assert!(h.store.kv_value("avant_success_count").is_some());
    }

    #[tokio::test]
    async fn test_run_once_mode_exits_by_itself() {
        let h = harness().await;
        let handle = h
            .reconciler
            .clone()
            .spawn(Duration::from_secs(20), true, &CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.store.kv_value("avant_success_count").is_some());
    }
}

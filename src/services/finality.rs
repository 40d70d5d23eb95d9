//! Finality Checking
//!
//! Promotes pending chain confirmations once the backing block is buried
//! under the required number of blocks.
//!
//! pending → confirmed 는 한 방향 전이이며 다시 열리지 않는다.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use tracing::{debug, info, warn};

use crate::db::ConfirmationStore;
use crate::error::BridgeError;

/// 체인별 finality 판단
#[async_trait]
pub trait FinalityChecker: Send + Sync + Debug {
    async fn latest_block(&self) -> Result<u64, BridgeError>;

    /// 확정에 필요한 블록 수
    fn confirmation_blocks(&self) -> u64;

    /// chain_confirmations.chain_id 값
    fn chain_id(&self) -> u64;

    fn chain_name(&self) -> &str;
}

/// block + depth <= head
pub fn is_buried(block_number: u64, latest_block: u64, depth: u64) -> bool {
    block_number.saturating_add(depth) <= latest_block
}

/// JSON-RPC 의 최신 블록 기준 block counting
#[derive(Debug)]
pub struct BlockCountingFinality {
    provider: Provider<Http>,
    name: String,
    chain_id: u64,
    confirmation_blocks: u64,
}

impl BlockCountingFinality {
    pub fn new(
        name: &str,
        rpc_url: &str,
        chain_id: u64,
        confirmation_blocks: u64,
    ) -> Result<Self, BridgeError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| BridgeError::Rpc(format!("invalid rpc url {rpc_url}: {e}")))?;

        Ok(Self {
            provider,
            name: name.to_string(),
            chain_id,
            confirmation_blocks,
        })
    }
}

#[async_trait]
impl FinalityChecker for BlockCountingFinality {
    async fn latest_block(&self) -> Result<u64, BridgeError> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| BridgeError::Rpc(format!("{}: {e}", self.name)))?;
        Ok(block.as_u64())
    }

    fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn chain_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationReport {
    pub checked: usize,
    pub confirmed: usize,
}

/// pending chain confirmation 승격
pub struct ConfirmationTracker {
    store: Arc<dyn ConfirmationStore>,
    checkers: Vec<Arc<dyn FinalityChecker>>,
}

impl ConfirmationTracker {
    pub fn new(store: Arc<dyn ConfirmationStore>, checkers: Vec<Arc<dyn FinalityChecker>>) -> Self {
        Self { store, checkers }
    }

    /// 모든 체인의 pending 행을 검사해서 충분히 묻힌 것을 확정
    ///
    /// 한 체인의 RPC 실패는 다른 체인 처리를 막지 않고, 마지막 에러를 반환한다.
    pub async fn promote(&self) -> Result<ConfirmationReport, BridgeError> {
        let mut report = ConfirmationReport::default();
        let mut last_error = None;

        for checker in &self.checkers {
            match self.promote_chain(checker.as_ref()).await {
                Ok(chain_report) => {
                    report.checked += chain_report.checked;
                    report.confirmed += chain_report.confirmed;
                }
                Err(e) => {
                    warn!(chain = checker.chain_name(), error = %e, "Finality check failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if report.checked == 0 => Err(e),
            _ => Ok(report),
        }
    }

    async fn promote_chain(&self, checker: &dyn FinalityChecker) -> Result<ConfirmationReport, BridgeError> {
        let pending = self.store.pending_confirmations(checker.chain_id()).await?;
        if pending.is_empty() {
            return Ok(ConfirmationReport::default());
        }

        // 체인 head 는 한 번만 조회
        let head = checker.latest_block().await?;
        let depth = checker.confirmation_blocks();
        let mut report = ConfirmationReport {
            checked: pending.len(),
            confirmed: 0,
        };

        for row in pending {
            if !is_buried(row.block_number(), head, depth) {
                continue;
            }
            if self.store.confirm(&row.tx).await? {
                debug!(tx = %row.tx, block = row.block, head, "Chain confirmation finalized");
                report.confirmed += 1;
            }
        }

        if report.confirmed > 0 {
            info!(
                chain = checker.chain_name(),
                head,
                confirmed = report.confirmed,
                pending = report.checked - report.confirmed,
                "Promoted chain confirmations"
            );
        }
        Ok(report)
    }
}

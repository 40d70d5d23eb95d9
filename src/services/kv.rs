//! Cursor / Flag Store
//!
//! Typed keys and a read-through TTL cache over the `kv` table.
//!
//! 파싱할 수 없는 값은 경고 후 기본값을 사용한다 (운영자가 직접 수정하는 테이블).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::types::BigDecimal;
use tokio::sync::RwLock;
use tracing::warn;

use crate::db::KvStore;
use crate::error::StoreError;

/// kv 테이블 키
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvKey {
    // 스캔 커서
    LatestEthBlock,
    LatestBnbBlock,
    LatestUsdcBlock,
    LatestBusdBlock,
    LatestDepositBlock,
    LatestDepositBlockEth,
    LatestWithdrawBlock,
    LatestWithdrawBlockEth,

    // 운영 플래그
    EnableWithdrawRollback,
    EnableSyncPayments,
    EnableSyncDeposits,
    EnableSyncWithdraw,

    // 데이터 피드 상태
    FeedFailureCount,
    FeedSuccessCount,

    // 환율
    SupsToUsd,
    EthToUsd,
    BnbToUsd,
    PurchaseSupsFloorPrice,
    PurchaseSupsMarketPriceMultiplier,
}

impl KvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvKey::LatestEthBlock => "latest_eth_block",
            KvKey::LatestBnbBlock => "latest_bnb_block",
            KvKey::LatestUsdcBlock => "latest_usdc_block",
            KvKey::LatestBusdBlock => "latest_busd_block",
            KvKey::LatestDepositBlock => "latest_deposit_block",
            KvKey::LatestDepositBlockEth => "latest_deposit_block_eth",
            KvKey::LatestWithdrawBlock => "latest_withdraw_block",
            KvKey::LatestWithdrawBlockEth => "latest_withdraw_block_eth",
            KvKey::EnableWithdrawRollback => "enable_withdraw_rollback",
            KvKey::EnableSyncPayments => "enable_sync_payments",
            KvKey::EnableSyncDeposits => "enable_sync_deposits",
            KvKey::EnableSyncWithdraw => "enable_sync_withdraw",
            KvKey::FeedFailureCount => "avant_failure_count",
            KvKey::FeedSuccessCount => "avant_success_count",
            KvKey::SupsToUsd => "sups_to_usd",
            KvKey::EthToUsd => "eth_to_usd",
            KvKey::BnbToUsd => "bnb_to_usd",
            KvKey::PurchaseSupsFloorPrice => "purchase_sups_floor_price",
            KvKey::PurchaseSupsMarketPriceMultiplier => "purchase_sups_market_price_multiplier",
        }
    }
}

struct CachedValue {
    value: Option<String>,
    cached_at: Instant,
}

/// Read-through KV cache
///
/// 쓰기는 스토어에 먼저 기록한 뒤 캐시를 갱신한다 (write-through).
pub struct KvCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    entries: RwLock<HashMap<KvKey, CachedValue>>,
}

impl KvCache {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_str(&self, key: KvKey) -> Result<Option<String>, StoreError> {
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&key) {
                if cached.cached_at.elapsed() < self.ttl {
                    return Ok(cached.value.clone());
                }
            }
        }

        let value = self.store.get(key.as_str()).await?;
        self.entries.write().await.insert(
            key,
            CachedValue {
                value: value.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(value)
    }

    pub async fn put_str(&self, key: KvKey, value: &str) -> Result<(), StoreError> {
        self.store.put(key.as_str(), value).await?;
        self.entries.write().await.insert(
            key,
            CachedValue {
                value: Some(value.to_string()),
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// 다음 조회 시 스토어에서 다시 읽도록 캐시 항목 제거
    pub async fn invalidate(&self, key: KvKey) {
        self.entries.write().await.remove(&key);
    }

    async fn get_parsed<T: FromStr>(&self, key: KvKey, default: T) -> Result<T, StoreError> {
        match self.get_str(key).await? {
            None => Ok(default),
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(value) => Ok(value),
                Err(_) => {
                    warn!(key = key.as_str(), value = %raw, "Unparsable kv value, using default");
                    Ok(default)
                }
            },
        }
    }

    pub async fn get_u64(&self, key: KvKey, default: u64) -> Result<u64, StoreError> {
        self.get_parsed(key, default).await
    }

    pub async fn put_u64(&self, key: KvKey, value: u64) -> Result<(), StoreError> {
        self.put_str(key, &value.to_string()).await
    }

    pub async fn get_bool(&self, key: KvKey, default: bool) -> Result<bool, StoreError> {
        self.get_parsed(key, default).await
    }

    pub async fn put_bool(&self, key: KvKey, value: bool) -> Result<(), StoreError> {
        self.put_str(key, if value { "true" } else { "false" }).await
    }

    pub async fn get_decimal(&self, key: KvKey, default: BigDecimal) -> Result<BigDecimal, StoreError> {
        self.get_parsed(key, default).await
    }

    pub async fn put_decimal(&self, key: KvKey, value: &BigDecimal) -> Result<(), StoreError> {
        self.put_str(key, &value.to_string()).await
    }

    /// 저장된 환율
    pub async fn exchange_rates(&self) -> Result<ExchangeRates, StoreError> {
        let zero = BigDecimal::from(0);
        Ok(ExchangeRates {
            sups_to_usd: self.get_decimal(KvKey::SupsToUsd, zero.clone()).await?,
            eth_to_usd: self.get_decimal(KvKey::EthToUsd, zero.clone()).await?,
            bnb_to_usd: self.get_decimal(KvKey::BnbToUsd, zero).await?,
        })
    }

    pub async fn store_exchange_rates(&self, rates: &ExchangeRates) -> Result<(), StoreError> {
        self.put_decimal(KvKey::SupsToUsd, &rates.sups_to_usd).await?;
        self.put_decimal(KvKey::EthToUsd, &rates.eth_to_usd).await?;
        self.put_decimal(KvKey::BnbToUsd, &rates.bnb_to_usd).await
    }
}

/// USD 환율 (1 토큰 당 USD)
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRates {
    pub sups_to_usd: BigDecimal,
    pub eth_to_usd: BigDecimal,
    pub bnb_to_usd: BigDecimal,
}

impl ExchangeRates {
    /// 결제 토큰의 USD 가격. 스테이블코인은 1 USD.
    pub fn usd_rate(&self, symbol: &str) -> Option<BigDecimal> {
        match symbol.to_lowercase().as_str() {
            "eth" | "weth" => Some(self.eth_to_usd.clone()),
            "bnb" | "wbnb" => Some(self.bnb_to_usd.clone()),
            "usdc" | "busd" => Some(BigDecimal::from(1)),
            _ => None,
        }
    }
}

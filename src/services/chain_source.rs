//! On-chain Data Source
//!
//! HTTP client for the transfer/price feed that indexes the sale contract,
//! the SUPS token and the bridge on Ethereum and BSC.
//!
//! # Endpoints
//! - `GET {base}/api/{stream}?since_block=N[&is_testnet=true]` → `[TransferRecord]`
//! - `GET {base}/api/{symbol}_price` → `{ "time": .., "usd": ".." }`
//! - `GET {base}/ping`

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use tracing::debug;

use super::kv::{ExchangeRates, KvKey};
use crate::error::BridgeError;
use crate::types::{ten_pow, Balance, TxHash, WalletAddress, SUPS_DECIMALS};

/// 스트림 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// ETH/BNB/USDC/BUSD 로 SUPS 구매
    Purchase,
    /// SUPS 토큰 입금 (온체인 → 원장)
    Deposit,
    /// SUPS 토큰 출금 확인 (원장 → 온체인)
    Withdraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Ethereum,
    Bsc,
}

/// 체인 + 토큰 스트림
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStream {
    EthPurchase,
    BnbPurchase,
    UsdcPurchase,
    BusdPurchase,
    BscDeposit,
    EthDeposit,
    BscWithdraw,
    EthWithdraw,
}

impl BridgeStream {
    pub const ALL: [BridgeStream; 8] = [
        BridgeStream::EthPurchase,
        BridgeStream::BnbPurchase,
        BridgeStream::UsdcPurchase,
        BridgeStream::BusdPurchase,
        BridgeStream::BscDeposit,
        BridgeStream::EthDeposit,
        BridgeStream::BscWithdraw,
        BridgeStream::EthWithdraw,
    ];

    /// 피드 API 경로
    pub fn path(&self) -> &'static str {
        match self {
            BridgeStream::EthPurchase => "eth_txs",
            BridgeStream::BnbPurchase => "bnb_txs",
            BridgeStream::UsdcPurchase => "usdc_txs",
            BridgeStream::BusdPurchase => "busd_txs",
            BridgeStream::BscDeposit => "sups_deposit_txs",
            BridgeStream::EthDeposit => "sups_eth_deposit_txs",
            BridgeStream::BscWithdraw => "sups_withdraw_txs",
            BridgeStream::EthWithdraw => "sups_eth_withdraw_txs",
        }
    }

    pub fn cursor_key(&self) -> KvKey {
        match self {
            BridgeStream::EthPurchase => KvKey::LatestEthBlock,
            BridgeStream::BnbPurchase => KvKey::LatestBnbBlock,
            BridgeStream::UsdcPurchase => KvKey::LatestUsdcBlock,
            BridgeStream::BusdPurchase => KvKey::LatestBusdBlock,
            BridgeStream::BscDeposit => KvKey::LatestDepositBlock,
            BridgeStream::EthDeposit => KvKey::LatestDepositBlockEth,
            BridgeStream::BscWithdraw => KvKey::LatestWithdrawBlock,
            BridgeStream::EthWithdraw => KvKey::LatestWithdrawBlockEth,
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            BridgeStream::EthPurchase
            | BridgeStream::BnbPurchase
            | BridgeStream::UsdcPurchase
            | BridgeStream::BusdPurchase => StreamKind::Purchase,
            BridgeStream::BscDeposit | BridgeStream::EthDeposit => StreamKind::Deposit,
            BridgeStream::BscWithdraw | BridgeStream::EthWithdraw => StreamKind::Withdraw,
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            BridgeStream::EthPurchase
            | BridgeStream::UsdcPurchase
            | BridgeStream::EthDeposit
            | BridgeStream::EthWithdraw => Chain::Ethereum,
            BridgeStream::BnbPurchase
            | BridgeStream::BusdPurchase
            | BridgeStream::BscDeposit
            | BridgeStream::BscWithdraw => Chain::Bsc,
        }
    }

    /// 스트림 활성화 플래그
    pub fn enable_flag(&self) -> KvKey {
        match self.kind() {
            StreamKind::Purchase => KvKey::EnableSyncPayments,
            StreamKind::Deposit => KvKey::EnableSyncDeposits,
            StreamKind::Withdraw => KvKey::EnableSyncWithdraw,
        }
    }
}

/// 피드가 반환하는 전송 기록
///
/// 구매 스트림은 `symbol`/`sups` 를, SUPS 전송 스트림은 `value_int` 만 채운다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub tx_hash: String,
    pub block_number: u64,
    #[serde(default)]
    pub chain: u64,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
    #[serde(default)]
    pub value_int: String,
    #[serde(default)]
    pub value_decimals: u32,
    #[serde(default)]
    pub symbol: String,
    /// 피드가 계산한 SUPS 수량 (소수)
    #[serde(default)]
    pub sups: String,
}

impl TransferRecord {
    pub fn hash(&self) -> Result<TxHash, BridgeError> {
        TxHash::new(&self.tx_hash).map_err(BridgeError::Decode)
    }

    pub fn sender(&self) -> Result<WalletAddress, BridgeError> {
        WalletAddress::new(&self.from_address).map_err(BridgeError::Decode)
    }

    pub fn recipient(&self) -> Result<WalletAddress, BridgeError> {
        WalletAddress::new(&self.to_address).map_err(BridgeError::Decode)
    }

    /// 토큰 최소 단위 정수
    pub fn raw_value(&self) -> Result<BigDecimal, BridgeError> {
        let value = BigDecimal::from_str(self.value_int.trim())
            .map_err(|e| BridgeError::Decode(format!("value_int {:?}: {e}", self.value_int)))?;
        if value < BigDecimal::from(0) {
            return Err(BridgeError::Decode(format!("negative value_int {}", self.value_int)));
        }
        Ok(value)
    }
}

/// `{symbol}_price` 응답
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub time: i64,
    pub usd: String,
}

// ============ Amount Conversion ============

/// SUPS 토큰 전송량을 원장 단위로 변환 (decimals 가 18 이 아니면 보정)
pub fn sups_from_token_units(value: &BigDecimal, decimals: u32) -> Balance {
    let decimals = if decimals == 0 { SUPS_DECIMALS } else { decimals };
    let scaled = if decimals >= SUPS_DECIMALS {
        value / &ten_pow(decimals - SUPS_DECIMALS)
    } else {
        value * &ten_pow(SUPS_DECIMALS - decimals)
    };
    Balance::from_raw(scaled)
}

/// 구매 기록의 SUPS 수량
///
/// 피드가 `sups` 를 계산해 주면 그 값을, 아니면 저장된 환율로
/// `value / 10^decimals * token_usd / sups_usd` 를 계산한다. 소수점 이하는 버림.
pub fn purchase_sups(record: &TransferRecord, rates: &ExchangeRates) -> Result<Balance, BridgeError> {
    if !record.sups.trim().is_empty() {
        let sups = BigDecimal::from_str(record.sups.trim())
            .map_err(|e| BridgeError::Decode(format!("sups {:?}: {e}", record.sups)))?;
        return Ok(Balance::from_raw(sups * ten_pow(SUPS_DECIMALS)));
    }

    let token_usd = rates
        .usd_rate(&record.symbol)
        .ok_or_else(|| BridgeError::Decode(format!("unknown payment symbol {:?}", record.symbol)))?;
    if rates.sups_to_usd <= BigDecimal::from(0) {
        return Err(BridgeError::Decode("no SUPS exchange rate available".to_string()));
    }

    let tokens = record.raw_value()? / ten_pow(record.value_decimals);
    let sups = tokens * token_usd / &rates.sups_to_usd;
    Ok(Balance::from_raw(sups * ten_pow(SUPS_DECIMALS)))
}

// ============ Source ============

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// `since_block` 이후의 전송 기록
    async fn transfers(
        &self,
        stream: BridgeStream,
        since_block: u64,
    ) -> Result<Vec<TransferRecord>, BridgeError>;

    /// 1 토큰 당 USD (sups, eth, bnb)
    async fn usd_price(&self, symbol: &str) -> Result<BigDecimal, BridgeError>;

    async fn ping(&self) -> Result<(), BridgeError>;
}

pub struct HttpChainSource {
    client: reqwest::Client,
    base_url: String,
    testnet: bool,
}

impl HttpChainSource {
    pub fn new(base_url: &str, testnet: bool) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            testnet,
        })
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), BridgeError> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BridgeError::Feed(format!(
                "non 200 response for {}: {}",
                resp.url(),
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl ChainSource for HttpChainSource {
    async fn transfers(
        &self,
        stream: BridgeStream,
        since_block: u64,
    ) -> Result<Vec<TransferRecord>, BridgeError> {
        let url = format!("{}/api/{}", self.base_url, stream.path());
        let mut query = vec![("since_block", since_block.to_string())];
        if self.testnet {
            query.push(("is_testnet", "true".to_string()));
        }

        let resp = self.client.get(&url).query(&query).send().await?;
        Self::check_status(&resp)?;
        let records: Vec<TransferRecord> = resp.json().await?;

        debug!(stream = stream.path(), since_block, records = records.len(), "Fetched transfer records");
        Ok(records)
    }

    async fn usd_price(&self, symbol: &str) -> Result<BigDecimal, BridgeError> {
        let url = format!("{}/api/{}_price", self.base_url, symbol.to_lowercase());
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        Self::check_status(&resp)?;
        let quote: PriceQuote = resp.json().await?;

        BigDecimal::from_str(quote.usd.trim())
            .map_err(|e| BridgeError::Decode(format!("{symbol} price {:?}: {e}", quote.usd)))
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        let resp = self.client.get(format!("{}/ping", self.base_url)).send().await?;
        Self::check_status(&resp)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// 스트림별로 미리 정한 기록을 돌려주는 피드
    ///
    /// `since_block` 보다 작은 블록은 걸러낸다 (같은 블록은 다시 반환).
    #[derive(Default)]
    pub struct ScriptedSource {
        records: Mutex<HashMap<&'static str, Vec<TransferRecord>>>,
        prices: Mutex<HashMap<String, BigDecimal>>,
        down: AtomicBool,
        requests: Mutex<Vec<(BridgeStream, u64)>>,
    }

    impl ScriptedSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, stream: BridgeStream, record: TransferRecord) {
            self.records
                .lock()
                .unwrap()
                .entry(stream.path())
                .or_default()
                .push(record);
        }

        pub fn set_price(&self, symbol: &str, usd: &str) {
            self.prices
                .lock()
                .unwrap()
                .insert(symbol.to_string(), usd.parse().unwrap());
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        pub fn requests(&self) -> Vec<(BridgeStream, u64)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChainSource for ScriptedSource {
        async fn transfers(
            &self,
            stream: BridgeStream,
            since_block: u64,
        ) -> Result<Vec<TransferRecord>, BridgeError> {
            self.requests.lock().unwrap().push((stream, since_block));
            if self.down.load(Ordering::SeqCst) {
                return Err(BridgeError::Feed("feed unavailable".to_string()));
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(stream.path())
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| r.block_number >= since_block)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn usd_price(&self, symbol: &str) -> Result<BigDecimal, BridgeError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BridgeError::Feed("feed unavailable".to_string()));
            }
            self.prices
                .lock()
                .unwrap()
                .get(symbol)
                .cloned()
                .ok_or_else(|| BridgeError::Feed(format!("no price for {symbol}")))
        }

        async fn ping(&self) -> Result<(), BridgeError> {
            if self.down.load(Ordering::SeqCst) {
                Err(BridgeError::Feed("feed unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> TransferRecord {
        serde_json::from_str(json).unwrap()
    }

    fn rates() -> ExchangeRates {
        ExchangeRates {
            sups_to_usd: "0.5".parse().unwrap(),
            eth_to_usd: "2000".parse().unwrap(),
            bnb_to_usd: "300".parse().unwrap(),
        }
    }

    #[test]
    fn test_decode_feed_record() {
        let r = record(
            r#"{
                "chain": 56,
                "block_number": 19000000,
                "confirmations": 12,
                "from_address": "0x52b38626D3167e5357FE7348624352B7062fE271",
                "to_address": "0x0000000000000000000000000000000000000001",
                "value_int": "1000000000000000000",
                "value_decimals": 18,
                "tx_hash": "0xabcdef0000000000000000000000000000000000000000000000000000000001"
            }"#,
        );
        assert_eq!(r.block_number, 19_000_000);
        assert!(r.sups.is_empty());
        assert!(r.hash().is_ok());
        assert_eq!(
            r.sender().unwrap().as_str(),
            "0x52b38626d3167e5357fe7348624352b7062fe271"
        );
    }

    #[test]
    fn test_purchase_uses_feed_amount_when_present() {
        let r = record(
            r#"{"tx_hash":"0x01","block_number":1,"symbol":"ETH","value_int":"1","value_decimals":18,"sups":"12.5"}"#,
        );
        let amount = purchase_sups(&r, &rates()).unwrap();
        assert_eq!(amount.to_string(), "12500000000000000000");
    }

    #[test]
    fn test_purchase_converts_with_rates() {
        // 0.01 ETH * 2000 USD / 0.5 USD = 40 SUPS
        let r = record(
            r#"{"tx_hash":"0x01","block_number":1,"symbol":"eth","value_int":"10000000000000000","value_decimals":18}"#,
        );
        assert_eq!(purchase_sups(&r, &rates()).unwrap(), Balance::sups(40));

        // 3 USDC (6 decimals) / 0.5 USD = 6 SUPS
        let usdc = record(
            r#"{"tx_hash":"0x02","block_number":1,"symbol":"USDC","value_int":"3000000","value_decimals":6}"#,
        );
        assert_eq!(purchase_sups(&usdc, &rates()).unwrap(), Balance::sups(6));
    }

    #[test]
    fn test_purchase_requires_known_symbol_and_rate() {
        let r = record(r#"{"tx_hash":"0x01","block_number":1,"symbol":"DOGE","value_int":"1"}"#);
        assert!(matches!(purchase_sups(&r, &rates()), Err(BridgeError::Decode(_))));

        let mut no_rate = rates();
        no_rate.sups_to_usd = BigDecimal::from(0);
        let eth = record(r#"{"tx_hash":"0x01","block_number":1,"symbol":"eth","value_int":"1"}"#);
        assert!(purchase_sups(&eth, &no_rate).is_err());
    }

    #[test]
    fn test_token_unit_scaling() {
        let one = BigDecimal::from(1_000_000);
        assert_eq!(sups_from_token_units(&one, 6), Balance::sups(1));
        let raw = BigDecimal::from(5);
        assert_eq!(sups_from_token_units(&raw, 18), Balance::from_units(5));
    }

    #[test]
    fn test_stream_catalogue() {
        assert_eq!(BridgeStream::BscDeposit.cursor_key().as_str(), "latest_deposit_block");
        assert_eq!(BridgeStream::EthWithdraw.path(), "sups_eth_withdraw_txs");
        assert_eq!(BridgeStream::BusdPurchase.chain(), Chain::Bsc);
        assert_eq!(BridgeStream::UsdcPurchase.enable_flag(), KvKey::EnableSyncPayments);
        assert_eq!(
            BridgeStream::ALL
                .iter()
                .filter(|s| s.kind() == StreamKind::Deposit)
                .count(),
            2
        );
    }
}

//! Common Types Module
//!
//! 원장 전반에서 사용되는 공통 타입 정의

use std::fmt;
use std::str::FromStr;

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use uuid::Uuid;

/// SUPS 소수점 자리수 (온체인 ERC-20과 동일)
pub const SUPS_DECIMALS: u32 = 18;

// ============ Accounts ============

/// 계정 식별자 (UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn kind(&self) -> AccountKind {
        if SYSTEM_ACCOUNTS.contains(self) {
            AccountKind::System
        } else {
            AccountKind::Normal
        }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 계정 종류
///
/// - `Normal`: 일반 사용자, 잔액이 음수가 될 수 없음
/// - `System`: 외부/무제한 상대방 (treasury, on-chain mint source 등)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Normal,
    System,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Normal => "normal",
            AccountKind::System => "system",
        }
    }
}

pub const TREASURY_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0xebf30ca0_875b_4e84_9a78_0b3fa36a1f87));
pub const GAME_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0x4fae8fdf_584f_46bb_9cb9_bb32ae20177e));
pub const BATTLE_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0x87c60803_b051_4abb_aa60_487104946bd7));
pub const SUP_POOL_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0xc579bb47_7efb_4286_a5cc_e5edbb54626d));
pub const ZAIBATSU_POOL_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0x1a657a32_778e_4612_8cc1_14e360665f2b));
pub const RED_MOUNTAIN_POOL_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0x305da475_53dc_4973_8d78_a30d390d3de5));
pub const BOSTON_CYBERNETICS_POOL_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0x15f29ee9_e834_4f76_aff8_31e39faabe2d));
/// 온체인 입출금의 상대방 (mint source)
pub const ON_CHAIN_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0x2fa1a63e_a4fa_4618_921f_4b4d28132069));
/// SUPS 판매 풀 (ETH/BNB/USDC/BUSD 구매 대금의 상대방)
pub const SALE_ACCOUNT: AccountId =
    AccountId::from_uuid(Uuid::from_u128(0x1429a004_84a1_11ec_a8a3_0242ac120002));

pub const SYSTEM_ACCOUNTS: [AccountId; 9] = [
    TREASURY_ACCOUNT,
    GAME_ACCOUNT,
    BATTLE_ACCOUNT,
    SUP_POOL_ACCOUNT,
    ZAIBATSU_POOL_ACCOUNT,
    RED_MOUNTAIN_POOL_ACCOUNT,
    BOSTON_CYBERNETICS_POOL_ACCOUNT,
    ON_CHAIN_ACCOUNT,
    SALE_ACCOUNT,
];

// ============ Balances ============

/// 18 decimals 정수 잔액 (임의 정밀도)
///
/// 항상 scale 0 으로 정규화해서 보관한다. `1 SUPS == 10^18`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Balance(BigDecimal);

impl Balance {
    pub fn zero() -> Self {
        Self(BigDecimal::from(0))
    }

    pub fn from_raw(value: BigDecimal) -> Self {
        Self(value.with_scale(0))
    }

    /// 정수 SUPS 단위에서 생성 (`Balance::sups(30)` == 30 * 10^18)
    pub fn sups(whole: i64) -> Self {
        Self(BigDecimal::from(whole) * ten_pow(SUPS_DECIMALS))
    }

    pub fn from_units(units: i64) -> Self {
        Self(BigDecimal::from(units))
    }

    pub fn as_raw(&self) -> &BigDecimal {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigDecimal::from(0)
    }

    pub fn is_positive(&self) -> bool {
        self.0 > BigDecimal::from(0)
    }

    pub fn is_negative(&self) -> bool {
        self.0 < BigDecimal::from(0)
    }

    pub fn checked_add(&self, other: &Balance) -> Balance {
        Balance(&self.0 + &other.0)
    }

    pub fn checked_sub(&self, other: &Balance) -> Balance {
        Balance(&self.0 - &other.0)
    }

    /// 사람이 읽기 쉬운 형태 (소수점 4자리, 버림)
    pub fn to_sups_string(&self) -> String {
        let whole = (&self.0 / &ten_pow(SUPS_DECIMALS)).with_scale(4);
        whole.to_string()
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.with_scale(0))
    }
}

impl FromStr for Balance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = BigDecimal::from_str(s.trim()).map_err(|e| format!("invalid amount {s:?}: {e}"))?;
        if value.with_scale(0) != value {
            return Err(format!("amount {s:?} is not an integer number of units"));
        }
        Ok(Self::from_raw(value))
    }
}

impl std::iter::Sum for Balance {
    fn sum<I: Iterator<Item = Balance>>(iter: I) -> Self {
        iter.fold(Balance::zero(), |acc, b| acc.checked_add(&b))
    }
}

/// 10^exp
pub fn ten_pow(exp: u32) -> BigDecimal {
    let mut digits = String::with_capacity(exp as usize + 1);
    digits.push('1');
    digits.extend(std::iter::repeat('0').take(exp as usize));
    // 숫자 문자열이므로 파싱 실패 불가
    BigDecimal::from_str(&digits).unwrap_or_else(|_| BigDecimal::from(1))
}

// ============ Transactions ============

/// 멱등성 키 (전역 유일)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionReference(String);

impl TransactionReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TransactionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 트랜잭션 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionGroup {
    Store,
    Bridge,
    Withdrawal,
    Refund,
    Battle,
    Supremacy,
    AssetManagement,
    Testing,
}

impl TransactionGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionGroup::Store => "store",
            TransactionGroup::Bridge => "bridge",
            TransactionGroup::Withdrawal => "withdrawal",
            TransactionGroup::Refund => "refund",
            TransactionGroup::Battle => "battle",
            TransactionGroup::Supremacy => "supremacy",
            TransactionGroup::AssetManagement => "asset_management",
            TransactionGroup::Testing => "testing",
        }
    }
}

impl FromStr for TransactionGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "store" => Ok(TransactionGroup::Store),
            "bridge" => Ok(TransactionGroup::Bridge),
            "withdrawal" => Ok(TransactionGroup::Withdrawal),
            "refund" => Ok(TransactionGroup::Refund),
            "battle" => Ok(TransactionGroup::Battle),
            "supremacy" => Ok(TransactionGroup::Supremacy),
            "asset_management" => Ok(TransactionGroup::AssetManagement),
            "testing" => Ok(TransactionGroup::Testing),
            other => Err(format!("unknown transaction group: {other}")),
        }
    }
}

/// 브릿지 트랜잭션을 뒷받침하는 온체인 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub tx_hash: TxHash,
    pub block: u64,
    pub chain_id: u64,
}

/// Transaction Processor 입력
#[derive(Debug, Clone)]
pub struct NewTransactionRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Balance,
    pub transaction_reference: TransactionReference,
    pub description: String,
    pub group: TransactionGroup,
    pub sub_group: Option<String>,
    pub related_transaction_id: Option<String>,
    /// 브릿지 입금이면 pending chain confirmation 을 같은 DB 트랜잭션에 기록
    pub chain_event: Option<ChainEvent>,
}

impl NewTransactionRequest {
    pub fn new(
        from: AccountId,
        to: AccountId,
        amount: Balance,
        reference: impl Into<String>,
        group: TransactionGroup,
    ) -> Self {
        Self {
            from,
            to,
            amount,
            transaction_reference: TransactionReference::new(reference),
            description: String::new(),
            group,
            sub_group: None,
            related_transaction_id: None,
            chain_event: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn sub_group(mut self, sub_group: impl Into<String>) -> Self {
        self.sub_group = Some(sub_group.into());
        self
    }

    pub fn related_to(mut self, transaction_id: impl Into<String>) -> Self {
        self.related_transaction_id = Some(transaction_id.into());
        self
    }

    pub fn chain_event(mut self, event: ChainEvent) -> Self {
        self.chain_event = Some(event);
        self
    }

    /// 락/DB 작업 전에 수행하는 형식 검증
    pub fn validate(&self) -> Result<(), String> {
        if !self.amount.is_positive() {
            return Err(format!("amount must be positive, got {}", self.amount));
        }
        if self.from == self.to {
            return Err(format!("from and to must differ, both are {}", self.from));
        }
        if self.transaction_reference.is_empty() {
            return Err("transaction reference must not be empty".to_string());
        }
        Ok(())
    }
}

// ============ Chain ============

/// Ethereum/BSC 지갑 주소 (lowercase, 0x 포함)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn new(addr: &str) -> Result<Self, String> {
        let parsed = Address::from_str(addr.trim())
            .map_err(|e| format!("Invalid wallet address {addr:?}: {e}"))?;
        Ok(Self(format!("{parsed:?}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 온체인 트랜잭션 해시 (lowercase, 32 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(String);

impl TxHash {
    pub fn new(hash: &str) -> Result<Self, String> {
        let normalized = hash.trim().to_lowercase();
        let body = normalized.strip_prefix("0x").unwrap_or(&normalized);
        let bytes = hex::decode(body).map_err(|e| format!("Invalid tx hash {hash:?}: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("Invalid tx hash {hash:?}: expected 32 bytes, got {}", bytes.len()));
        }
        Ok(Self(format!("0x{body}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_accounts_are_system() {
        for id in SYSTEM_ACCOUNTS {
            assert_eq!(id.kind(), AccountKind::System);
        }
        assert_eq!(AccountId::new_random().kind(), AccountKind::Normal);
        assert_eq!(
            ON_CHAIN_ACCOUNT.to_string(),
            "2fa1a63e-a4fa-4618-921f-4b4d28132069"
        );
    }

    #[test]
    fn test_balance_units() {
        let thirty = Balance::sups(30);
        assert_eq!(thirty.to_string(), "30000000000000000000");
        assert_eq!(thirty.to_sups_string(), "30.0000");

        let seventy = Balance::sups(100).checked_sub(&thirty);
        assert_eq!(seventy, Balance::sups(70));
        assert!(Balance::sups(1).checked_sub(&Balance::sups(2)).is_negative());
    }

    #[test]
    fn test_balance_parse() {
        let b: Balance = "1500000000000000000".parse().unwrap();
        assert_eq!(b.to_sups_string(), "1.5000");
        assert!("1.5".parse::<Balance>().is_err());
        assert!("abc".parse::<Balance>().is_err());
    }

    #[test]
    fn test_request_validation() {
        let a = AccountId::new_random();
        let b = AccountId::new_random();

        let ok = NewTransactionRequest::new(a, b, Balance::sups(1), "ref-1", TransactionGroup::Store);
        assert!(ok.validate().is_ok());

        let zero = NewTransactionRequest::new(a, b, Balance::zero(), "ref-1", TransactionGroup::Store);
        assert!(zero.validate().is_err());

        let negative =
            NewTransactionRequest::new(a, b, Balance::from_units(-5), "ref-1", TransactionGroup::Store);
        assert!(negative.validate().is_err());

        let same = NewTransactionRequest::new(a, a, Balance::sups(1), "ref-1", TransactionGroup::Store);
        assert!(same.validate().is_err());

        let blank = NewTransactionRequest::new(a, b, Balance::sups(1), "  ", TransactionGroup::Store);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_wallet_address() {
        let addr = WalletAddress::new("0x52b38626D3167e5357FE7348624352B7062fE271").unwrap();
        assert_eq!(addr.as_str(), "0x52b38626d3167e5357fe7348624352b7062fe271");
        assert!(WalletAddress::new("invalid").is_err());
    }

    #[test]
    fn test_tx_hash() {
        let raw = "0xABCDEF0000000000000000000000000000000000000000000000000000000001";
        let hash = TxHash::new(raw).unwrap();
        assert_eq!(hash.as_str(), raw.to_lowercase());
        assert!(TxHash::new("0x1234").is_err());
    }

    #[test]
    fn test_group_roundtrip_names() {
        assert_eq!("REFUND".parse::<TransactionGroup>().unwrap(), TransactionGroup::Refund);
        assert_eq!(TransactionGroup::AssetManagement.as_str(), "asset_management");
    }
}

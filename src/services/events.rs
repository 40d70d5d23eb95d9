//! Event Publisher
//!
//! Fan-out of committed balance changes and exchange-rate refreshes.
//!
//! # Topics
//! - `account/{id}/balance`: new balance (decimal string) after every committed transaction
//! - `exchange_rates`: SUPS/ETH/BNB USD rates after each reconciler refresh
//!
//! 토픽별 tokio broadcast 채널. 구독자가 없으면 메시지는 버려진다.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{AccountId, Balance};

pub const EXCHANGE_RATES_TOPIC: &str = "exchange_rates";

/// 토픽당 버퍼 크기
const TOPIC_CAPACITY: usize = 256;

pub fn balance_topic(account_id: AccountId) -> String {
    format!("account/{account_id}/balance")
}

/// 구독 가능한 토픽인지 확인
pub fn is_known_topic(topic: &str) -> bool {
    if topic == EXCHANGE_RATES_TOPIC {
        return true;
    }
    topic
        .strip_prefix("account/")
        .and_then(|rest| rest.strip_suffix("/balance"))
        .map(|id| id.parse::<AccountId>().is_ok())
        .unwrap_or(false)
}

// ============ Messages ============

/// 트랜잭션 커밋 후 계정별로 한 번씩 발행
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEvent {
    pub account_id: AccountId,
    pub balance: Balance,
}

impl BalanceEvent {
    pub fn new(account_id: AccountId, balance: Balance) -> Self {
        Self { account_id, balance }
    }

    pub fn topic(&self) -> String {
        balance_topic(self.account_id)
    }
}

/// 서버 → 클라이언트 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventMessage {
    Balance(BalanceUpdate),
    ExchangeRates(ExchangeRatesUpdate),
    Subscribed(SubscriptionConfirm),
    Error(WsError),
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub topic: String,
    /// 18 decimals 정수 문자열
    pub balance: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRatesUpdate {
    pub sups_to_usd: String,
    pub eth_to_usd: String,
    pub bnb_to_usd: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfirm {
    pub topic: String,
    pub subscribed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

impl From<&BalanceEvent> for EventMessage {
    fn from(event: &BalanceEvent) -> Self {
        EventMessage::Balance(BalanceUpdate {
            topic: event.topic(),
            balance: event.balance.to_string(),
        })
    }
}

// ============ Publisher ============

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publisher closed")]
    Closed,
}

/// 원장이 의존하는 발행 경계
///
/// 동기 호출이며, 실패해도 트랜잭션은 이미 커밋된 상태다.
pub trait BalancePublisher: Send + Sync {
    fn publish(&self, event: BalanceEvent) -> Result<(), PublishError>;
}

/// 토픽별 broadcast hub
pub struct EventHub {
    topics: RwLock<HashMap<String, broadcast::Sender<EventMessage>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// 토픽 구독 (채널이 없으면 생성)
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<EventMessage> {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// 수신자가 없는 토픽 채널 정리
    pub fn prune(&self, topic: &str) {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        if topics.get(topic).map(|tx| tx.receiver_count() == 0).unwrap_or(false) {
            topics.remove(topic);
        }
    }

    pub fn active_topics(&self) -> usize {
        self.topics.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn send(&self, topic: &str, message: EventMessage) {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = topics.get(topic) {
            // 수신자가 모두 떠난 경우만 실패
            let _ = tx.send(message);
        }
    }

    pub fn publish_exchange_rates(&self, update: ExchangeRatesUpdate) {
        self.send(EXCHANGE_RATES_TOPIC, EventMessage::ExchangeRates(update));
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancePublisher for EventHub {
    fn publish(&self, event: BalanceEvent) -> Result<(), PublishError> {
        self.send(&event.topic(), EventMessage::from(&event));
        Ok(())
    }
}

// ============ Client Protocol ============

/// 클라이언트 → 서버 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
}

pub fn parse_client_message(data: &str) -> Result<ClientMessage> {
    serde_json::from_str(data).map_err(Into::into)
}

pub fn serialize_message(msg: &EventMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(Into::into)
}

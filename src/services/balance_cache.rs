//! Balance Cache
//!
//! In-process projection of every account balance.
//!
//! # Consistency
//!
//! - 시작 시 `initialise`로 로그 전체를 합산해서 로드 (실패하면 서비스 불가)
//! - 읽기는 read lock 만 사용, 쓰기는 계정 락을 잡은 Transaction Processor 만 수행
//! - 캐시는 커밋 이후에만 갱신되므로 DB보다 앞서는 일이 없다
//!
//! # Lock Ordering
//!
//! 두 계정을 동시에 잠글 때 항상 AccountId 오름차순으로 획득한다.
//! A→B 와 B→A 가 동시에 들어와도 교착 상태가 생기지 않는다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::info;

use crate::db::LedgerStore;
use crate::error::StoreError;
use crate::types::{AccountId, Balance};

/// 계정 락 묶음. drop 시 모두 해제된다.
pub struct AccountLocks {
    ids: Vec<AccountId>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl AccountLocks {
    pub fn holds(&self, id: AccountId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub fn accounts(&self) -> &[AccountId] {
        &self.ids
    }
}

pub struct BalanceCache {
    store: Arc<dyn LedgerStore>,
    balances: RwLock<HashMap<AccountId, Balance>>,
    /// 계정별 직렬화 락
    locks: StdMutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl BalanceCache {
    /// 로그에서 모든 잔액을 재계산해서 캐시 생성
    ///
    /// 에러는 호출자(main)에서 치명적 오류로 처리한다.
    pub async fn initialise(store: Arc<dyn LedgerStore>) -> Result<Self, StoreError> {
        let balances = store.load_all_balances().await?;
        info!(accounts = balances.len(), "Balance cache initialised");

        Ok(Self {
            store,
            balances: RwLock::new(balances),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// 현재 잔액 조회
    ///
    /// 캐시에 없으면 스토어에서 읽어 채운다. 이미 다른 값이 들어와 있으면
    /// (그 사이 커밋된 트랜잭션) 그 값을 우선한다.
    pub async fn get(&self, id: AccountId) -> Result<Balance, StoreError> {
        if let Some(balance) = self.balances.read().await.get(&id) {
            return Ok(balance.clone());
        }

        let loaded = self.store.get_balance(id).await?;
        let mut balances = self.balances.write().await;
        Ok(balances.entry(id).or_insert(loaded).clone())
    }

    /// 계정 락 획득 (정렬 + 중복 제거)
    pub async fn lock_accounts(&self, ids: &[AccountId]) -> AccountLocks {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mutexes: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            ids.iter()
                .map(|id| locks.entry(*id).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }

        AccountLocks { ids, _guards: guards }
    }

    /// 락을 잡은 상태에서 잔액 조회
    pub async fn balance_locked(
        &self,
        locks: &AccountLocks,
        id: AccountId,
    ) -> Result<Balance, StoreError> {
        debug_assert!(locks.holds(id), "account {id} is not locked");
        self.get(id).await
    }

    /// 커밋 이후 새 잔액 반영
    pub async fn commit_balances(&self, locks: &AccountLocks, updates: &[(AccountId, Balance)]) {
        let mut balances = self.balances.write().await;
        for (id, balance) in updates {
            debug_assert!(locks.holds(*id), "account {id} is not locked");
            balances.insert(*id, balance.clone());
        }
    }

    /// 커밋 결과가 불확실할 때 캐시 항목 제거 (다음 조회 시 스토어에서 재계산)
    pub async fn invalidate(&self, locks: &AccountLocks) {
        let mut balances = self.balances.write().await;
        for id in locks.accounts() {
            balances.remove(id);
        }
    }

    pub async fn snapshot(&self) -> HashMap<AccountId, Balance> {
        self.balances.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.balances.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::db::mock::MemoryStore;
    use crate::db::TransactionRecord;
    use crate::types::{NewTransactionRequest, TransactionGroup, ON_CHAIN_ACCOUNT};

    async fn seeded_store(account: AccountId, sups: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let req = NewTransactionRequest::new(
            ON_CHAIN_ACCOUNT,
            account,
            Balance::sups(sups),
            format!("seed-{account}"),
            TransactionGroup::Testing,
        );
        store
            .append_transaction(&TransactionRecord::from_request(&req), None)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_initialise_sums_log() {
        let user = AccountId::new_random();
        let store = seeded_store(user, 100).await;

        let cache = BalanceCache::initialise(store).await.unwrap();
        assert_eq!(cache.get(user).await.unwrap(), Balance::sups(100));
        assert_eq!(cache.get(ON_CHAIN_ACCOUNT).await.unwrap(), Balance::sups(-100));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_miss_loads_zero_for_unknown_account() {
        let cache = BalanceCache::initialise(Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let unknown = AccountId::new_random();
        assert_eq!(cache.get(unknown).await.unwrap(), Balance::zero());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_locks_are_sorted_and_deduplicated() {
        let cache = BalanceCache::initialise(Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let a = AccountId::new_random();
        let b = AccountId::new_random();

        let locks = cache.lock_accounts(&[b, a, b]).await;
        assert_eq!(locks.accounts().len(), 2);
        assert!(locks.accounts()[0] < locks.accounts()[1]);
        assert!(locks.holds(a) && locks.holds(b));
    }

    #[tokio::test]
    async fn test_lock_blocks_until_released() {
        let cache = Arc::new(
            BalanceCache::initialise(Arc::new(MemoryStore::new()))
                .await
                .unwrap(),
        );
        let a = AccountId::new_random();
        let b = AccountId::new_random();

        let held = cache.lock_accounts(&[a, b]).await;

        // 역순으로 요청해도 같은 순서로 대기
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lock_accounts(&[b, a]).await.accounts().len() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let user = AccountId::new_random();
        let store = seeded_store(user, 10).await;
        let cache = BalanceCache::initialise(store).await.unwrap();

        let locks = cache.lock_accounts(&[user]).await;
        cache.commit_balances(&locks, &[(user, Balance::sups(999))]).await;
        assert_eq!(cache.balance_locked(&locks, user).await.unwrap(), Balance::sups(999));

        cache.invalidate(&locks).await;
        assert_eq!(cache.balance_locked(&locks, user).await.unwrap(), Balance::sups(10));
    }
}

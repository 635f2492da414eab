use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::domain::error::PlaybackError;

/// 参照結果の種別（メトリクス用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// キャッシュ済み
    Hit,
    /// 他の呼び出しの取得完了を待った
    Joined,
    /// 自分で取得した
    Fetched,
}

/// 同一キーへの同時ミスを1回の取得にまとめるキャッシュ。
///
/// 取得は独立したタスクで走るので、待機側がキャンセルされても取得は続き、
/// 結果は他の待機者に配られてキャッシュされる。失敗はキャッシュしない。
pub struct InflightCache<K, V> {
    slots: Arc<Mutex<Slots<K, V>>>,
}

type Outcome<V> = Result<V, PlaybackError>;

struct Slots<K, V> {
    ready: HashMap<K, V>,
    pending: HashMap<K, Pending<V>>,
    /// clear() ごとに進む。古い世代の取得結果は格納しない。
    epoch: u64,
}

struct Pending<V> {
    tx: broadcast::Sender<Outcome<V>>,
    epoch: u64,
}

impl<K, V> Clone for InflightCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K, V> InflightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                ready: HashMap::new(),
                pending: HashMap::new(),
                epoch: 0,
            })),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.slots.lock().ready.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.lock().ready.contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.slots.lock().ready.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.slots.lock().pending.len()
    }

    /// 全エントリを破棄する。取得中のものは完了しても格納されない。
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.ready.clear();
        slots.pending.clear();
        slots.epoch = slots.epoch.wrapping_add(1);
    }
}

impl<K, V> InflightCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// キャッシュにあれば返し、無ければ `fetch` で取得して格納する。
    ///
    /// 同じキーで取得中の呼び出しがあれば、その結果を共有する。
    /// tokio ランタイム上で呼ぶこと。
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<(V, Lookup), PlaybackError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<V>> + Send + 'static,
    {
        let mut fetch = Some(fetch);
        loop {
            let (mut rx, lookup, leader) = {
                let mut slots = self.slots.lock();
                if let Some(value) = slots.ready.get(&key) {
                    return Ok((value.clone(), Lookup::Hit));
                }
                match slots.pending.get(&key) {
                    Some(pending) => (pending.tx.subscribe(), Lookup::Joined, None),
                    None => {
                        let (tx, rx) = broadcast::channel(1);
                        let epoch = slots.epoch;
                        slots.pending.insert(
                            key.clone(),
                            Pending {
                                tx: tx.clone(),
                                epoch,
                            },
                        );
                        (rx, Lookup::Fetched, Some((tx, epoch)))
                    }
                }
            };

            if let Some((tx, epoch)) = leader {
                let guard = PendingGuard {
                    slots: self.slots.clone(),
                    key: key.clone(),
                    epoch,
                    armed: true,
                };
                let Some(fetch) = fetch.take() else {
                    return Err(PlaybackError::invalid_state("fetch already consumed"));
                };
                tokio::spawn(run_fetch(guard, tx, fetch()));
            }

            match rx.recv().await {
                Ok(result) => return result.map(|v| (v, lookup)),
                // 取得タスクが結果を配らずに消えた
                Err(_) if lookup == Lookup::Joined => continue,
                Err(_) => return Err(PlaybackError::fetch("fetch task ended without a result")),
            }
        }
    }
}

async fn run_fetch<K, V, Fut>(mut guard: PendingGuard<K, V>, tx: broadcast::Sender<Outcome<V>>, fut: Fut)
where
    K: Eq + Hash + Clone,
    V: Clone,
    Fut: Future<Output = Outcome<V>>,
{
    let result = fut.await;
    guard.armed = false;

    {
        let mut slots = guard.slots.lock();
        if slots.epoch == guard.epoch {
            slots.pending.remove(&guard.key);
            if let Ok(value) = &result {
                slots.ready.insert(guard.key.clone(), value.clone());
            }
        }
    }
    // 待機者がいなくてもよい
    let _ = tx.send(result);
}

impl<K, V> Default for InflightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// 取得タスクが途中で終わったとき、自分の世代の pending エントリだけを外す
struct PendingGuard<K: Eq + Hash, V> {
    slots: Arc<Mutex<Slots<K, V>>>,
    key: K,
    epoch: u64,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for PendingGuard<K, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock();
        if slots.pending.get(&self.key).is_some_and(|p| p.epoch == self.epoch) {
            slots.pending.remove(&self.key);
        }
    }
}

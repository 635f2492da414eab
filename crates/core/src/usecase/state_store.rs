use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::domain::state::{PlaybackState, PlayerEvent};

/// 観測可能な再生状態の唯一の書き込み口。
///
/// 再生ランごとに番号を振り、古いランからの書き込みは捨てる。
/// スナップショットとイベントはロック内で配信するので順序が入れ替わらない。
pub struct StateStore {
    inner: Mutex<StoreInner>,
    state_tx: watch::Sender<PlaybackState>,
    events_tx: broadcast::Sender<PlayerEvent>,
}

struct StoreInner {
    state: PlaybackState,
    run: u64,
}

impl StateStore {
    pub fn new(event_capacity: usize) -> Self {
        let (state_tx, _rx) = watch::channel(PlaybackState::default());
        let (events_tx, _rx) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Mutex::new(StoreInner {
                state: PlaybackState::default(),
                run: 0,
            }),
            state_tx,
            events_tx,
        }
    }

    pub fn snapshot(&self) -> PlaybackState {
        self.inner.lock().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events_tx.subscribe()
    }

    pub fn current_run(&self) -> u64 {
        self.inner.lock().run
    }

    /// 新しいラン番号を発行する。それまでのランの書き込みは以後無視される。
    pub fn next_run(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.run += 1;
        inner.run
    }

    /// コマンドからの更新（ラン番号を問わない）
    pub fn apply<F>(&self, f: F)
    where
        F: FnOnce(&mut PlaybackState, &mut Vec<PlayerEvent>),
    {
        let mut inner = self.inner.lock();
        self.publish(&mut inner, f);
    }

    /// 再生ランからの更新。`run` が最新でなければ何もせず false を返す。
    pub fn apply_for_run<F>(&self, run: u64, f: F) -> bool
    where
        F: FnOnce(&mut PlaybackState, &mut Vec<PlayerEvent>),
    {
        let mut inner = self.inner.lock();
        if inner.run != run {
            return false;
        }
        self.publish(&mut inner, f);
        true
    }

    fn publish<F>(&self, inner: &mut StoreInner, f: F)
    where
        F: FnOnce(&mut PlaybackState, &mut Vec<PlayerEvent>),
    {
        let mut events = Vec::new();
        f(&mut inner.state, &mut events);
        self.state_tx.send_replace(inner.state.clone());
        for event in events {
            // 受信者がいなくてもよい
            let _ = self.events_tx.send(event);
        }
    }
}

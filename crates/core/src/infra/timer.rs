use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::state::Progress;

/// 一時停止フラグ。Sequencer が書き、タイマーとメディア再生が読む。
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_paused(&self, paused: bool) {
        self.tx.send_replace(paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// 再開されるまで待つ。キャンセルされたら false。
    pub async fn wait_resumed(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            let paused = *rx.borrow_and_update();
            if !paused {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    Completed,
    Cancelled,
}

/// 一時停止できるタイマー（Wait ステップと文間ギャップ用）。
///
/// 一時停止中は経過時間が進まず、tick も発火しない。
/// キャンセルはポーリングごとに確認し、最後の tick を出さずに戻る。
pub struct PausableTimer {
    poll: Duration,
}

impl PausableTimer {
    pub fn new(poll: Duration) -> Self {
        Self {
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    /// `total_ms` に達するまで待つ。`already_elapsed_ms` から数え始める。
    pub async fn wait<F>(
        &self,
        total_ms: u64,
        already_elapsed_ms: u64,
        mut on_tick: F,
        gate: &PauseGate,
        cancel: &CancellationToken,
    ) -> TimerOutcome
    where
        F: FnMut(Progress),
    {
        let mut elapsed = already_elapsed_ms.min(total_ms);
        loop {
            if cancel.is_cancelled() {
                return TimerOutcome::Cancelled;
            }
            if elapsed >= total_ms {
                return TimerOutcome::Completed;
            }
            if gate.is_paused() {
                if !gate.wait_resumed(cancel).await {
                    return TimerOutcome::Cancelled;
                }
                continue;
            }

            let step = self.poll.min(Duration::from_millis(total_ms - elapsed));
            let started = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => return TimerOutcome::Cancelled,
                _ = tokio::time::sleep(step) => {}
            }
            if cancel.is_cancelled() {
                return TimerOutcome::Cancelled;
            }
            // スリープ中に一時停止された分は加算しない
            if gate.is_paused() {
                continue;
            }

            let delta = started.elapsed().as_millis() as u64;
            elapsed = (elapsed + delta).min(total_ms);
            on_tick(Progress::new(elapsed, total_ms));
        }
    }
}

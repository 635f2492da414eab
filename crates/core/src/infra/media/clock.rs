use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::domain::error::PlaybackError;
use crate::domain::media::{AudioPayload, MediaControl, MediaEvent, MediaPlayer, MediaSession};
use crate::domain::settings::PlayerSettings;

use super::wav::wav_duration_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockCommand {
    Idle,
    Running,
    Paused,
    Stopped,
}

struct ClockControl {
    tx: watch::Sender<ClockCommand>,
}

impl ClockControl {
    fn transition(&self, from: ClockCommand, to: ClockCommand) {
        self.tx.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        });
    }
}

impl MediaControl for ClockControl {
    fn start(&self) {
        self.transition(ClockCommand::Idle, ClockCommand::Running);
    }

    fn pause(&self) {
        self.transition(ClockCommand::Running, ClockCommand::Paused);
    }

    fn resume(&self) {
        self.transition(ClockCommand::Paused, ClockCommand::Running);
    }

    fn stop(&self) {
        self.tx.send_replace(ClockCommand::Stopped);
    }
}

/// 音を出さず、デコードした長さだけ tokio の時計で再生を模擬するプレイヤー。
///
/// ヘッドレス環境とテストで使う。
pub struct ClockMediaPlayer {
    interval: Duration,
}

impl ClockMediaPlayer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_settings(settings: &PlayerSettings) -> Self {
        Self::new(settings.time_update_interval())
    }
}

#[async_trait::async_trait]
impl MediaPlayer for ClockMediaPlayer {
    async fn open(&self, payload: &AudioPayload) -> Result<MediaSession, PlaybackError> {
        let duration_ms = wav_duration_ms(payload.bytes())?;
        let (cmd_tx, cmd_rx) = watch::channel(ClockCommand::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        log::debug!(
            "Clock media opened: {} ({}ms)",
            payload.audio_id(),
            duration_ms
        );
        tokio::spawn(run_clock(duration_ms, self.interval, cmd_rx, event_tx));

        Ok(MediaSession {
            control: Arc::new(ClockControl { tx: cmd_tx }),
            events: event_rx,
        })
    }

    fn measure_duration(&self, payload: &AudioPayload) -> Result<u64, PlaybackError> {
        wav_duration_ms(payload.bytes())
    }

    fn name(&self) -> &str {
        "clock"
    }
}

async fn run_clock(
    duration_ms: u64,
    interval: Duration,
    mut cmd: watch::Receiver<ClockCommand>,
    events: mpsc::UnboundedSender<MediaEvent>,
) {
    let mut position = 0u64;
    loop {
        let state = *cmd.borrow_and_update();
        match state {
            ClockCommand::Stopped => return,
            ClockCommand::Idle | ClockCommand::Paused => {
                if cmd.changed().await.is_err() {
                    return;
                }
                continue;
            }
            ClockCommand::Running => {}
        }

        if position >= duration_ms {
            let _ = events.send(MediaEvent::Ended);
            return;
        }

        let step = interval.min(Duration::from_millis(duration_ms - position));
        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(step) => {
                position = (position + started.elapsed().as_millis() as u64).min(duration_ms);
                if events.send(MediaEvent::TimeUpdate(position)).is_err() {
                    return;
                }
            }
            changed = cmd.changed() => {
                if changed.is_err() {
                    return;
                }
                // 途中で止められた分の位置は保持する
                position = (position + started.elapsed().as_millis() as u64).min(duration_ms);
            }
        }
    }
}

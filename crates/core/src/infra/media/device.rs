use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{mpsc, oneshot};

use crate::domain::error::PlaybackError;
use crate::domain::media::{AudioPayload, MediaControl, MediaEvent, MediaPlayer, MediaSession};
use crate::domain::settings::PlayerSettings;

use super::wav::{decode_samples, wav_duration_ms, DecodedAudio};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_PAUSED: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// 出力スレッドとコールバックで共有する状態
struct Shared {
    state: AtomicU8,
    /// 再生済みのソースフレーム数
    frames_played: AtomicU64,
}

struct DeviceControl {
    shared: Arc<Shared>,
}

impl DeviceControl {
    fn transition(&self, from: u8, to: u8) {
        let _ = self
            .shared
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl MediaControl for DeviceControl {
    fn start(&self) {
        self.transition(STATE_IDLE, STATE_RUNNING);
    }

    fn pause(&self) {
        self.transition(STATE_RUNNING, STATE_PAUSED);
    }

    fn resume(&self) {
        self.transition(STATE_PAUSED, STATE_RUNNING);
    }

    fn stop(&self) {
        self.shared.state.store(STATE_STOPPED, Ordering::Release);
    }
}

/// デフォルト出力デバイスで WAV を鳴らすプレイヤー
///
/// **注意**: cpal::Stream は Send ではないため、stream は専用スレッドが保持する。
pub struct DeviceMediaPlayer {
    interval: Duration,
}

impl DeviceMediaPlayer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_settings(settings: &PlayerSettings) -> Self {
        Self::new(settings.time_update_interval())
    }
}

#[async_trait::async_trait]
impl MediaPlayer for DeviceMediaPlayer {
    async fn open(&self, payload: &AudioPayload) -> Result<MediaSession, PlaybackError> {
        let decoded = decode_samples(payload.bytes())?;
        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_IDLE),
            frames_played: AtomicU64::new(0),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_shared = shared.clone();
        let interval = self.interval;
        let audio_id = payload.audio_id().to_string();
        std::thread::Builder::new()
            .name("dictation-output".to_string())
            .spawn(move || output_thread(decoded, thread_shared, event_tx, ready_tx, interval))
            .map_err(|e| PlaybackError::decode(format!("failed to spawn output thread: {e}")))?;

        // ストリームが開くまでランタイムのスレッドを塞がずに待つ
        ready_rx
            .await
            .map_err(|_| PlaybackError::decode("output thread exited before the stream opened"))??;
        log::debug!("Device media opened: {audio_id}");

        Ok(MediaSession {
            control: Arc::new(DeviceControl { shared }),
            events: event_rx,
        })
    }

    fn measure_duration(&self, payload: &AudioPayload) -> Result<u64, PlaybackError> {
        wav_duration_ms(payload.bytes())
    }

    fn name(&self) -> &str {
        "device"
    }
}

fn output_thread(
    decoded: DecodedAudio,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<MediaEvent>,
    ready: oneshot::Sender<Result<(), PlaybackError>>,
    interval: Duration,
) {
    let sample_rate = decoded.sample_rate;
    let total_frames = (decoded.samples.len() / decoded.channels.max(1) as usize) as u64;

    let stream = match build_stream(decoded, shared.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(PlaybackError::decode(format!("output stream error: {e}"))));
        return;
    }
    let _ = ready.send(Ok(()));

    loop {
        std::thread::sleep(interval);
        match shared.state.load(Ordering::Acquire) {
            STATE_STOPPED => break,
            STATE_RUNNING => {
                let frames = shared.frames_played.load(Ordering::Relaxed);
                let position_ms = frames * 1000 / sample_rate.max(1) as u64;
                if events.send(MediaEvent::TimeUpdate(position_ms)).is_err() {
                    break;
                }
                if frames >= total_frames {
                    let _ = events.send(MediaEvent::Ended);
                    break;
                }
            }
            _ => {
                if events.is_closed() {
                    break;
                }
            }
        }
    }
    drop(stream);
}

fn build_stream(decoded: DecodedAudio, shared: Arc<Shared>) -> Result<cpal::Stream, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::decode("No audio output device found"))?;
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::decode(format!("Audio device config error: {e}")))?;

    if supported.sample_format() != cpal::SampleFormat::F32 {
        return Err(PlaybackError::decode(format!(
            "Unsupported output sample format: {:?}",
            supported.sample_format()
        )));
    }

    let out_channels = supported.channels() as usize;
    let device_rate = supported.sample_rate().0;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let src_channels = decoded.channels.max(1) as usize;
    let total_frames = decoded.samples.len() / src_channels;
    let ratio = decoded.sample_rate as f64 / device_rate.max(1) as f64;
    let samples = decoded.samples;
    let mut cursor = 0f64;

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                if shared.state.load(Ordering::Acquire) != STATE_RUNNING {
                    data.fill(0.0);
                    return;
                }
                for frame in data.chunks_mut(out_channels) {
                    let idx = cursor as usize;
                    if idx >= total_frames {
                        frame.fill(0.0);
                        continue;
                    }
                    for (c, out) in frame.iter_mut().enumerate() {
                        *out = samples[idx * src_channels + c.min(src_channels - 1)];
                    }
                    cursor += ratio;
                }
                shared
                    .frames_played
                    .store((cursor as u64).min(total_frames as u64), Ordering::Relaxed);
            },
            |err| {
                log::error!("Audio output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| PlaybackError::decode(format!("Audio stream error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::media::wav::encode_silence;

    #[test]
    fn test_measure_duration_needs_no_device() {
        let player = DeviceMediaPlayer::new(Duration::from_millis(100));
        let payload = AudioPayload::new("a", encode_silence(700, 8000).unwrap());
        assert_eq!(player.measure_duration(&payload).unwrap(), 700);
    }

    #[tokio::test]
    async fn test_open_rejects_undecodable_payload() {
        let player = DeviceMediaPlayer::new(Duration::from_millis(100));
        let err = player
            .open(&AudioPayload::new("bad", b"nope".to_vec()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PlaybackError::Decode(_)));
    }
}

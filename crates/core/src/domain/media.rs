use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::PlaybackError;

// ==================== Locators ====================

/// 音声の所在。`url` が無い場合は `audio_id` から解決する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioLocator {
    pub audio_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl AudioLocator {
    pub fn new(audio_id: impl Into<String>) -> Self {
        Self {
            audio_id: audio_id.into(),
            url: None,
        }
    }

    pub fn with_url(audio_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            audio_id: audio_id.into(),
            url: Some(url.into()),
        }
    }
}

/// 全文ディクテーション用の音声メタデータ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub locator: AudioLocator,
    /// 読み上げテキスト（バックエンドが返す場合）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// 文ごと再生の1単位
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub index: usize,
    pub locator: AudioLocator,
}

// ==================== Payload ====================

/// 再生可能な音声バイト列。キャッシュ間で共有するため clone は安価。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    audio_id: String,
    bytes: Arc<Vec<u8>>,
}

impl AudioPayload {
    pub fn new(audio_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            audio_id: audio_id.into(),
            bytes: Arc::new(bytes),
        }
    }

    pub fn audio_id(&self) -> &str {
        &self.audio_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// バイト列を取得済みのチャンク
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChunk {
    pub chunk: AudioChunk,
    pub payload: AudioPayload,
}

// ==================== AudioSource trait ====================

/// ストーリー音声を提供する外部コラボレータ。
#[async_trait::async_trait]
pub trait AudioSource: Send + Sync {
    /// 指定速度の全文音声の所在を返す。
    async fn fetch_audio_metadata(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<AudioMetadata, PlaybackError>;

    /// 文ごとの音声の所在を再生順に返す。
    async fn fetch_sentence_metadata(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<Vec<AudioLocator>, PlaybackError>;

    /// 所在から音声バイト列を取得する。
    async fn fetch_audio_bytes(&self, locator: &AudioLocator) -> Result<Vec<u8>, PlaybackError>;

    fn name(&self) -> &str;
}

// ==================== MediaPlayer trait ====================

/// メディア要素から届くイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// 再生位置 (ミリ秒)
    TimeUpdate(u64),
    /// 末尾まで再生した
    Ended,
    /// 再生できなかった
    Error(String),
}

/// 再生中メディアの操作ハンドル。pause/resume は別タスクから呼ばれる。
pub trait MediaControl: Send + Sync {
    fn start(&self);
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
}

/// `MediaPlayer::open` が返す1回分の再生
pub struct MediaSession {
    pub control: Arc<dyn MediaControl>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

/// メディア再生プリミティブ
#[async_trait::async_trait]
pub trait MediaPlayer: Send + Sync {
    /// ペイロードを読み込んで停止状態のセッションを作る。`start` で再生が始まる。
    async fn open(&self, payload: &AudioPayload) -> Result<MediaSession, PlaybackError>;

    /// 再生せずに長さ (ミリ秒) を読む。
    fn measure_duration(&self, payload: &AudioPayload) -> Result<u64, PlaybackError>;

    fn name(&self) -> &str;
}

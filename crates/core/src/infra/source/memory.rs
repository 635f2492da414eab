use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::error::PlaybackError;
use crate::domain::media::{AudioLocator, AudioMetadata, AudioSource};
use crate::infra::media::wav::encode_silence;

const FIXTURE_SAMPLE_RATE: u32 = 8000;

/// メモリ上の音声ソース。テストとオフラインデモ用。
///
/// 取得回数を数えるので、キャッシュの重複排除を検証できる。
#[derive(Default)]
pub struct StaticAudioSource {
    full: RwLock<HashMap<(String, u32), AudioMetadata>>,
    sentences: RwLock<HashMap<(String, u32), Vec<AudioLocator>>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    failing: RwLock<HashSet<String>>,
    latency: Option<Duration>,
    metadata_fetches: AtomicUsize,
    sentence_fetches: AtomicUsize,
    byte_fetches: AtomicUsize,
}

impl StaticAudioSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全ての取得に人工的な遅延を入れる
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn insert_full(&self, story_id: &str, speed_percent: u32, audio_id: &str, bytes: Vec<u8>) {
        self.full.write().insert(
            (story_id.to_string(), speed_percent),
            AudioMetadata {
                locator: AudioLocator::new(audio_id),
                text: None,
            },
        );
        self.blobs.write().insert(audio_id.to_string(), bytes);
    }

    pub fn insert_sentences(&self, story_id: &str, speed_percent: u32, chunks: Vec<(String, Vec<u8>)>) {
        let mut blobs = self.blobs.write();
        let locators = chunks
            .into_iter()
            .map(|(audio_id, bytes)| {
                blobs.insert(audio_id.clone(), bytes);
                AudioLocator::new(audio_id)
            })
            .collect();
        self.sentences
            .write()
            .insert((story_id.to_string(), speed_percent), locators);
    }

    /// 指定長の無音 WAV を全文音声として登録する
    pub fn insert_silent_full(
        &self,
        story_id: &str,
        speed_percent: u32,
        duration_ms: u64,
    ) -> Result<String, PlaybackError> {
        let audio_id = format!("{story_id}-full-{speed_percent}");
        let bytes = encode_silence(duration_ms, FIXTURE_SAMPLE_RATE)?;
        self.insert_full(story_id, speed_percent, &audio_id, bytes);
        Ok(audio_id)
    }

    /// 指定長の無音 WAV を文ごと音声として登録する
    pub fn insert_silent_sentences(
        &self,
        story_id: &str,
        speed_percent: u32,
        durations_ms: &[u64],
    ) -> Result<Vec<String>, PlaybackError> {
        let mut chunks = Vec::with_capacity(durations_ms.len());
        for (i, ms) in durations_ms.iter().enumerate() {
            let audio_id = format!("{story_id}-sentence-{speed_percent}-{i}");
            chunks.push((audio_id, encode_silence(*ms, FIXTURE_SAMPLE_RATE)?));
        }
        let ids = chunks.iter().map(|(id, _)| id.clone()).collect();
        self.insert_sentences(story_id, speed_percent, chunks);
        Ok(ids)
    }

    /// 以後この音声の取得を失敗させる
    pub fn fail_audio(&self, audio_id: &str) {
        self.failing.write().insert(audio_id.to_string());
    }

    pub fn heal_audio(&self, audio_id: &str) {
        self.failing.write().remove(audio_id);
    }

    pub fn metadata_fetches(&self) -> usize {
        self.metadata_fetches.load(Ordering::SeqCst)
    }

    pub fn sentence_fetches(&self) -> usize {
        self.sentence_fetches.load(Ordering::SeqCst)
    }

    pub fn byte_fetches(&self) -> usize {
        self.byte_fetches.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl AudioSource for StaticAudioSource {
    async fn fetch_audio_metadata(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<AudioMetadata, PlaybackError> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.full
            .read()
            .get(&(story_id.to_string(), speed_percent))
            .cloned()
            .ok_or_else(|| {
                PlaybackError::fetch(format!("no audio for story={story_id}, speed={speed_percent}"))
            })
    }

    async fn fetch_sentence_metadata(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<Vec<AudioLocator>, PlaybackError> {
        self.sentence_fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.sentences
            .read()
            .get(&(story_id.to_string(), speed_percent))
            .cloned()
            .ok_or_else(|| {
                PlaybackError::fetch(format!(
                    "no sentence audio for story={story_id}, speed={speed_percent}"
                ))
            })
    }

    async fn fetch_audio_bytes(&self, locator: &AudioLocator) -> Result<Vec<u8>, PlaybackError> {
        self.byte_fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.failing.read().contains(&locator.audio_id) {
            return Err(PlaybackError::fetch(format!(
                "audio {} is unavailable",
                locator.audio_id
            )));
        }
        self.blobs
            .read()
            .get(&locator.audio_id)
            .cloned()
            .ok_or_else(|| PlaybackError::fetch(format!("audio {} not found", locator.audio_id)))
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::media::wav::wav_duration_ms;

    #[tokio::test]
    async fn test_full_lookup() {
        let source = StaticAudioSource::new();
        let id = source.insert_silent_full("s1", 100, 1200).unwrap();

        let meta = source.fetch_audio_metadata("s1", 100).await.unwrap();
        assert_eq!(meta.locator.audio_id, id);
        let bytes = source.fetch_audio_bytes(&meta.locator).await.unwrap();
        assert_eq!(wav_duration_ms(&bytes).unwrap(), 1200);
        assert_eq!(source.metadata_fetches(), 1);
        assert_eq!(source.byte_fetches(), 1);
    }

    #[tokio::test]
    async fn test_unknown_speed_is_fetch_error() {
        let source = StaticAudioSource::new();
        source.insert_silent_full("s1", 100, 100).unwrap();
        let err = source.fetch_audio_metadata("s1", 90).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_sentences_in_order() {
        let source = StaticAudioSource::new();
        let ids = source.insert_silent_sentences("s1", 80, &[100, 200, 300]).unwrap();
        let locators = source.fetch_sentence_metadata("s1", 80).await.unwrap();
        let got: Vec<String> = locators.into_iter().map(|l| l.audio_id).collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn test_fail_and_heal() {
        let source = StaticAudioSource::new();
        let id = source.insert_silent_full("s1", 100, 100).unwrap();
        source.fail_audio(&id);
        assert!(source.fetch_audio_bytes(&AudioLocator::new(&id)).await.is_err());
        source.heal_audio(&id);
        assert!(source.fetch_audio_bytes(&AudioLocator::new(&id)).await.is_ok());
    }
}

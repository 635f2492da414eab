use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::error::PlaybackError;
use crate::domain::media::{AudioChunk, AudioLocator, AudioPayload, AudioSource, LoadedChunk};
use crate::infra::metrics::Metrics;

use super::inflight::InflightCache;

/// (story_id, speed_percent)
type StoryKey = (String, u32);

/// セッション単位の音声キャッシュ。ストーリーが変わったら `clear` する。
///
/// clone は同じキャッシュを共有する。
#[derive(Clone)]
pub struct MediaCache {
    source: Arc<dyn AudioSource>,
    audio: InflightCache<String, AudioPayload>,
    full: InflightCache<StoryKey, AudioLocator>,
    chunks: InflightCache<StoryKey, Arc<Vec<LoadedChunk>>>,
    metrics: Arc<Metrics>,
    timeout: Option<Duration>,
}

impl MediaCache {
    pub fn new(source: Arc<dyn AudioSource>, metrics: Arc<Metrics>, timeout: Option<Duration>) -> Self {
        Self {
            source,
            audio: InflightCache::new(),
            full: InflightCache::new(),
            chunks: InflightCache::new(),
            metrics,
            timeout,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    async fn bounded<T, Fut>(&self, what: &str, fut: Fut) -> Result<T, PlaybackError>
    where
        Fut: Future<Output = Result<T, PlaybackError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| PlaybackError::timeout(format!("{what} exceeded {}ms", limit.as_millis())))?,
            None => fut.await,
        }
    }

    /// 音声バイト列を返す。未取得なら1回だけ取得する。
    pub async fn get_or_fetch_audio(&self, locator: &AudioLocator) -> Result<AudioPayload, PlaybackError> {
        let this = self.clone();
        let target = locator.clone();
        let (payload, lookup) = self
            .audio
            .get_or_fetch(locator.audio_id.clone(), move || async move {
                this.metrics.inc_fetches();
                let started = Instant::now();
                let bytes = this
                    .bounded(
                        &format!("fetch audio {}", target.audio_id),
                        this.source.fetch_audio_bytes(&target),
                    )
                    .await?;
                this.metrics
                    .record_latency("audio", started.elapsed().as_millis() as u64);
                Ok(AudioPayload::new(target.audio_id, bytes))
            })
            .await
            .inspect_err(|e| log::error!("Audio fetch failed for {}: {}", locator.audio_id, e))?;

        self.metrics.record_lookup(lookup);
        log::debug!("Audio {} resolved ({:?})", locator.audio_id, lookup);
        Ok(payload)
    }

    /// 指定速度の全文音声を解決する（メタデータ → バイト列）
    pub async fn resolve_full_audio(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<AudioPayload, PlaybackError> {
        let this = self.clone();
        let story = story_id.to_string();
        let (locator, lookup) = self
            .full
            .get_or_fetch((story_id.to_string(), speed_percent), move || async move {
                this.metrics.inc_fetches();
                let meta = this
                    .bounded(
                        "fetch audio metadata",
                        this.source.fetch_audio_metadata(&story, speed_percent),
                    )
                    .await?;
                Ok(meta.locator)
            })
            .await
            .inspect_err(|e| {
                log::error!(
                    "Audio metadata fetch failed for story={}, speed={}: {}",
                    story_id,
                    speed_percent,
                    e
                )
            })?;
        self.metrics.record_lookup(lookup);

        self.get_or_fetch_audio(&locator).await
    }

    /// 文ごとのチャンク一覧をバイト列込みで返す。
    ///
    /// 同じ (story, speed) への同時要求は1つの取得を共有する。
    pub async fn get_or_fetch_chunks(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<Arc<Vec<LoadedChunk>>, PlaybackError> {
        let this = self.clone();
        let story = story_id.to_string();
        let (chunks, lookup) = self
            .chunks
            .get_or_fetch((story_id.to_string(), speed_percent), move || async move {
                this.metrics.inc_fetches();
                let locators = this
                    .bounded(
                        "fetch sentence metadata",
                        this.source.fetch_sentence_metadata(&story, speed_percent),
                    )
                    .await?;

                let mut loaded = Vec::with_capacity(locators.len());
                for (index, locator) in locators.into_iter().enumerate() {
                    let payload = this.get_or_fetch_audio(&locator).await?;
                    loaded.push(LoadedChunk {
                        chunk: AudioChunk { index, locator },
                        payload,
                    });
                }
                Ok(Arc::new(loaded))
            })
            .await
            .inspect_err(|e| {
                log::error!(
                    "Sentence audio fetch failed for story={}, speed={}: {}",
                    story_id,
                    speed_percent,
                    e
                )
            })?;

        self.metrics.record_lookup(lookup);
        log::debug!(
            "Sentence chunks for story={}, speed={} resolved: {} chunks ({:?})",
            story_id,
            speed_percent,
            chunks.len(),
            lookup
        );
        Ok(chunks)
    }

    /// 全エントリを破棄する
    pub fn clear(&self) {
        self.audio.clear();
        self.full.clear();
        self.chunks.clear();
        log::info!("Media cache cleared");
    }

    pub fn audio_len(&self) -> usize {
        self.audio.len()
    }

    pub fn chunk_lists_len(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::source::StaticAudioSource;

    fn cache_with(source: Arc<StaticAudioSource>) -> (MediaCache, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (MediaCache::new(source, metrics.clone(), None), metrics)
    }

    #[tokio::test]
    async fn test_full_audio_cached() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_full("s1", 100, 500).unwrap();
        let (cache, metrics) = cache_with(source.clone());

        let a = cache.resolve_full_audio("s1", 100).await.unwrap();
        let b = cache.resolve_full_audio("s1", 100).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(source.metadata_fetches(), 1);
        assert_eq!(source.byte_fetches(), 1);
        assert_eq!(metrics.summary().cache_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_audio_requests_fetch_once() {
        let source = Arc::new(StaticAudioSource::with_latency(Duration::from_millis(200)));
        let id = source.insert_silent_full("s1", 100, 500).unwrap();
        let (cache, metrics) = cache_with(source.clone());
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let locator = AudioLocator::new(&id);
            handles.push(tokio::spawn(async move {
                cache.get_or_fetch_audio(&locator).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(source.byte_fetches(), 1);
        assert_eq!(metrics.summary().cache_joins, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_chunk_requests_fetch_once() {
        let source = Arc::new(StaticAudioSource::with_latency(Duration::from_millis(100)));
        source.insert_silent_sentences("s1", 90, &[300, 400]).unwrap();
        let (cache, _) = cache_with(source.clone());
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_fetch_chunks("s1", 90).await
            }));
        }
        for h in handles {
            let chunks = h.await.unwrap().unwrap();
            assert_eq!(chunks.len(), 2);
            assert_eq!(chunks[1].chunk.index, 1);
        }
        assert_eq!(source.sentence_fetches(), 1);
        assert_eq!(source.byte_fetches(), 2);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let source = Arc::new(StaticAudioSource::new());
        let id = source.insert_silent_full("s1", 100, 500).unwrap();
        source.fail_audio(&id);
        let (cache, _) = cache_with(source.clone());

        let err = cache.resolve_full_audio("s1", 100).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Fetch(_)));
        assert_eq!(cache.audio_len(), 0);

        source.heal_audio(&id);
        assert!(cache.resolve_full_audio("s1", 100).await.is_ok());
        assert_eq!(source.byte_fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let source = Arc::new(StaticAudioSource::with_latency(Duration::from_secs(10)));
        source.insert_silent_full("s1", 100, 500).unwrap();
        let metrics = Arc::new(Metrics::new());
        let cache = MediaCache::new(source, metrics, Some(Duration::from_secs(1)));

        let err = cache.resolve_full_audio("s1", 100).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Timeout(_)));
        assert!(err.recoverable());
    }

    #[tokio::test]
    async fn test_clear_forces_refetch() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_silent_sentences("s1", 100, &[100]).unwrap();
        let (cache, _) = cache_with(source.clone());

        cache.get_or_fetch_chunks("s1", 100).await.unwrap();
        assert_eq!(cache.chunk_lists_len(), 1);
        cache.clear();
        assert_eq!(cache.chunk_lists_len(), 0);
        assert_eq!(cache.audio_len(), 0);

        cache.get_or_fetch_chunks("s1", 100).await.unwrap();
        assert_eq!(source.sentence_fetches(), 2);
    }

    #[tokio::test]
    async fn test_empty_chunk_list() {
        let source = Arc::new(StaticAudioSource::new());
        source.insert_sentences("s1", 100, Vec::new());
        let (cache, _) = cache_with(source);
        let chunks = cache.get_or_fetch_chunks("s1", 100).await.unwrap();
        assert!(chunks.is_empty());
    }
}

use std::future::Future;
use std::sync::Arc;

use crate::domain::error::PlaybackError;
use crate::domain::key::SelectionKey;
use crate::infra::metrics::Metrics;

use super::inflight::InflightCache;

/// 選択要素の長さ (ms) を解決・保持する
pub struct DurationResolver {
    cache: InflightCache<SelectionKey, u64>,
    metrics: Arc<Metrics>,
}

impl DurationResolver {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            cache: InflightCache::new(),
            metrics,
        }
    }

    /// キャッシュ済みならそれを返し、無ければ `producer` を1回だけ呼ぶ
    pub async fn resolve<F, Fut>(&self, key: SelectionKey, producer: F) -> Result<u64, PlaybackError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, PlaybackError>> + Send + 'static,
    {
        let label = key.to_string();
        let (duration_ms, lookup) = self.cache.get_or_fetch(key, producer).await?;
        self.metrics.record_lookup(lookup);
        log::debug!("Duration {} = {}ms ({:?})", label, duration_ms, lookup);
        Ok(duration_ms)
    }

    pub fn cached(&self, key: &SelectionKey) -> Option<u64> {
        self.cache.get(key)
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step::{RawStep, Step};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(index: usize) -> SelectionKey {
        SelectionKey::step("s1", index, &Step::from_raw(&RawStep::wait(2.0)))
    }

    #[tokio::test]
    async fn test_second_call_uses_cache() {
        let resolver = DurationResolver::new(Arc::new(Metrics::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let ms = resolver
                .resolve(key(0), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(2000)
                })
                .await
                .unwrap();
            assert_eq!(ms, 2000);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached(&key(0)), Some(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_producers_collapse() {
        let resolver = Arc::new(DurationResolver::new(Arc::new(Metrics::new())));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let resolver = resolver.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(key(1), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(750)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 750);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys() {
        let resolver = DurationResolver::new(Arc::new(Metrics::new()));
        resolver.resolve(key(0), || async { Ok(1) }).await.unwrap();
        resolver.resolve(key(1), || async { Ok(2) }).await.unwrap();
        assert_eq!(resolver.len(), 2);
        resolver.clear();
        assert!(resolver.is_empty());
    }
}

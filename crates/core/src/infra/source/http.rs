use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::error::PlaybackError;
use crate::domain::media::{AudioLocator, AudioMetadata, AudioSource};
use crate::domain::settings::PlayerSettings;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// ディクテーション API から音声を取得するソース
pub struct HttpAudioSource {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct MetadataResponse {
    audio_url: String,
    #[serde(default)]
    audio_text: Option<String>,
}

impl HttpAudioSource {
    pub fn new(settings: &PlayerSettings) -> Result<Self, PlaybackError> {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout().unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| PlaybackError::fetch(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            auth_token: settings.auth_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 相対 URL はベース URL に連結する（署名付き URL などの絶対 URL はそのまま）
    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            self.endpoint(url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn audio_url(&self, locator: &AudioLocator) -> String {
        match &locator.url {
            Some(url) => self.resolve_url(url),
            None => self.endpoint(&format!("/api/audio/{}", locator.audio_id)),
        }
    }

    fn to_locator(&self, url: String) -> AudioLocator {
        AudioLocator::with_url(audio_id_from_url(&url), url)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, PlaybackError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.auth_token {
            request = request.header("authorization", token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PlaybackError::timeout(format!("GET {url}"))
            } else {
                PlaybackError::fetch(format!("HTTP request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PlaybackError::fetch(format!("GET {url}: {status} - {body}")));
        }
        Ok(response)
    }

    fn story_query(story_id: &str, speed_percent: u32) -> [(&'static str, String); 2] {
        [
            ("story_id", story_id.to_string()),
            ("speed", speed_percent.to_string()),
        ]
    }
}

/// URL の最後のパス要素を音声 ID とみなす
fn audio_id_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(path)
        .to_string()
}

#[async_trait]
impl AudioSource for HttpAudioSource {
    async fn fetch_audio_metadata(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<AudioMetadata, PlaybackError> {
        let url = self.endpoint("/api/audio/metadata");
        let response = self
            .get(&url, &Self::story_query(story_id, speed_percent))
            .await?;
        let meta: MetadataResponse = response
            .json()
            .await
            .map_err(|e| PlaybackError::fetch(format!("Response parse error: {e}")))?;

        Ok(AudioMetadata {
            locator: self.to_locator(meta.audio_url),
            text: meta.audio_text,
        })
    }

    async fn fetch_sentence_metadata(
        &self,
        story_id: &str,
        speed_percent: u32,
    ) -> Result<Vec<AudioLocator>, PlaybackError> {
        let url = self.endpoint("/api/audio/metadata/sentence");
        let response = self
            .get(&url, &Self::story_query(story_id, speed_percent))
            .await?;
        let metas: Vec<MetadataResponse> = response
            .json()
            .await
            .map_err(|e| PlaybackError::fetch(format!("Response parse error: {e}")))?;

        Ok(metas
            .into_iter()
            .map(|m| self.to_locator(m.audio_url))
            .collect())
    }

    async fn fetch_audio_bytes(&self, locator: &AudioLocator) -> Result<Vec<u8>, PlaybackError> {
        let url = self.audio_url(locator);
        let response = self.get(&url, &[]).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PlaybackError::fetch(format!("failed to read audio body: {e}")))?;
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &str {
        "http"
    }
}

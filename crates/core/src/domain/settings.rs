use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::PlaybackError;

/// プレイヤー設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    /// Wait/ギャップ用タイマーのポーリング間隔 (ms)
    pub poll_interval_ms: u64,
    /// ClockMediaPlayer の time-update 間隔 (ms)
    pub time_update_interval_ms: u64,
    /// 速度が0に丸められたステップで使う速度 (%)
    pub default_speed_percent: u32,
    /// 取得処理のタイムアウト秒数（None = 無制限）
    pub fetch_timeout_secs: Option<u64>,
    /// wait も speed も無いステップを読み込み時に拒否する
    pub strict_steps: bool,
    /// イベント broadcast チャネルの容量
    pub event_capacity: usize,
    /// HTTP バックエンドのベース URL
    pub api_base_url: String,
    /// `authorization` ヘッダにそのまま載せるトークン
    pub auth_token: Option<String>,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            time_update_interval_ms: 250,
            default_speed_percent: 100,
            fetch_timeout_secs: None,
            strict_steps: false,
            event_capacity: 1024,
            api_base_url: "http://localhost:8000".to_string(),
            auth_token: None,
        }
    }
}

impl PlayerSettings {
    /// JSON から読み込む。欠けているキーはデフォルト値。
    pub fn from_json(json: &str) -> Result<Self, PlaybackError> {
        serde_json::from_str(json)
            .map_err(|e| PlaybackError::invalid_state(format!("invalid player settings: {e}")))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn time_update_interval(&self) -> Duration {
        Duration::from_millis(self.time_update_interval_ms.max(1))
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_secs.map(Duration::from_secs)
    }

    /// 取得に使う速度。0% は再生できないので既定値に置き換える。
    pub fn effective_speed(&self, speed_percent: u32) -> u32 {
        if speed_percent == 0 {
            self.default_speed_percent
        } else {
            speed_percent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = PlayerSettings::default();
        assert_eq!(s.poll_interval(), Duration::from_millis(50));
        assert_eq!(s.fetch_timeout(), None);
        assert!(!s.strict_steps);
    }

    #[test]
    fn test_partial_json() {
        let s = PlayerSettings::from_json(r#"{"poll_interval_ms": 20, "strict_steps": true}"#).unwrap();
        assert_eq!(s.poll_interval_ms, 20);
        assert!(s.strict_steps);
        assert_eq!(s.default_speed_percent, 100);
    }

    #[test]
    fn test_invalid_json() {
        let err = PlayerSettings::from_json("{not json").unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidState(_)));
    }

    #[test]
    fn test_effective_speed() {
        let s = PlayerSettings::default();
        assert_eq!(s.effective_speed(0), 100);
        assert_eq!(s.effective_speed(65), 65);
    }
}

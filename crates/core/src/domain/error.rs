use serde::Serialize;

/// 再生エンジン共通エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "E_FETCH")]
    Fetch,
    #[serde(rename = "E_DECODE")]
    Decode,
    #[serde(rename = "E_INVALID_STEP")]
    InvalidStep,
    #[serde(rename = "E_INVALID_STATE")]
    InvalidState,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_CANCELLED")]
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "E_FETCH",
            Self::Decode => "E_DECODE",
            Self::InvalidStep => "E_INVALID_STEP",
            Self::InvalidState => "E_INVALID_STATE",
            Self::Timeout => "E_TIMEOUT",
            Self::Cancelled => "E_CANCELLED",
        }
    }
}

/// 再生エラー。
///
/// in-flight の結果を複数の待機者に配るため `Clone` を実装する。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("Fetch failed: {0}")]
    Fetch(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Invalid step at index {index}: {reason}")]
    InvalidStep { index: usize, reason: String },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Playback cancelled")]
    Cancelled,
}

impl PlaybackError {
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_step(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidStep {
            index,
            reason: reason.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Fetch(_) => ErrorCode::Fetch,
            Self::Decode(_) => ErrorCode::Decode,
            Self::InvalidStep { .. } => ErrorCode::InvalidStep,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// リトライ（再生の再開）で回復できるかどうか
    pub fn recoverable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Decode(_) | Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// UI へ公開するペイロードに変換する
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
            recoverable: self.recoverable(),
        }
    }
}

/// エラーペイロード（`PlaybackState.last_error` とイベントで共用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

//! ディクテーション再生エンジン。
//!
//! - `domain`: ステップ・状態・エラー・設定などの型と、外部コラボレータの trait
//! - `infra`: キャッシュ、タイマー、メディア/音声ソースのアダプタ、メトリクス
//! - `usecase`: 状態ストアと再生シーケンサ

pub mod domain;
pub mod infra;
pub mod usecase;

pub use domain::error::{ErrorCode, ErrorInfo, PlaybackError};
pub use domain::media::{AudioLocator, AudioPayload, AudioSource, MediaEvent, MediaPlayer};
pub use domain::settings::PlayerSettings;
pub use domain::state::{PlaybackState, PlayerEvent, PlayerStatus, Progress, SubElement, SubElementKind};
pub use domain::step::{ElementKind, RawStep, Sequence, Step};
pub use usecase::{SessionChange, Sequencer};

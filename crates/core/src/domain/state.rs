use serde::{Deserialize, Serialize};

use super::error::{ErrorInfo, PlaybackError};
use super::media::AudioChunk;
use super::step::ElementKind;

/// 再生状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Idle,
    Playing,
    Paused,
    /// シーケンスを最後まで再生し終えた（カーソルは0に戻る）
    Stopped,
}

impl PlayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    /// 再生ループが生きている状態か
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

/// 進捗 (ミリ秒)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(current: u64, total: u64) -> Self {
        Self {
            current: current.min(total),
            total,
        }
    }

    pub fn start(total: u64) -> Self {
        Self::new(0, total)
    }

    pub fn percentage(&self) -> f64 {
        if self.total > 0 {
            self.current as f64 / self.total as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// 文ごと再生ステップ内のサブ要素種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubElementKind {
    Audio,
    Gap,
}

impl SubElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Gap => "gap",
        }
    }
}

/// 文ごと再生ステップ内のカーソル。
///
/// `cycle` は1始まり。ギャップの場合は直前に再生したサイクルを指す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubElement {
    pub kind: SubElementKind,
    pub chunk_index: usize,
    pub cycle: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

impl SubElement {
    pub fn audio(chunk_index: usize, cycle: u32) -> Self {
        Self {
            kind: SubElementKind::Audio,
            chunk_index,
            cycle,
            progress: None,
        }
    }

    pub fn gap(chunk_index: usize, cycle: u32) -> Self {
        Self {
            kind: SubElementKind::Gap,
            chunk_index,
            cycle,
            progress: None,
        }
    }

    /// 同じ位置を指しているか（進捗は無視）
    pub fn same_position(&self, other: &SubElement) -> bool {
        self.kind == other.kind && self.chunk_index == other.chunk_index && self.cycle == other.cycle
    }
}

/// 観測可能な再生状態。書き込むのは Sequencer だけ。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackState {
    pub session_id: Option<String>,
    pub story_id: Option<String>,
    pub status: PlayerStatus,
    pub is_playing: bool,
    pub is_paused: bool,
    pub active_step_index: usize,
    pub active_sub_element: Option<SubElement>,
    pub progress: Option<Progress>,
    pub last_error: Option<ErrorInfo>,
    /// 選択中の要素の長さ（プレビュー）
    pub selected_duration_ms: Option<u64>,
    /// アクティブな文ごと再生ステップのチャンク一覧
    pub chunks: Vec<AudioChunk>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            session_id: None,
            story_id: None,
            status: PlayerStatus::Idle,
            is_playing: false,
            is_paused: false,
            active_step_index: 0,
            active_sub_element: None,
            progress: None,
            last_error: None,
            selected_duration_ms: None,
            chunks: Vec::new(),
        }
    }
}

impl PlaybackState {
    /// 新しいセッション用の初期状態
    pub fn for_session(session_id: String, story_id: String) -> Self {
        Self {
            session_id: Some(session_id),
            story_id: Some(story_id),
            ..Default::default()
        }
    }

    fn set_status(&mut self, status: PlayerStatus) -> StateTransition {
        let prev = self.status;
        self.status = status;
        self.is_playing = status.is_running();
        self.is_paused = status == PlayerStatus::Paused;
        StateTransition { prev, next: status }
    }

    fn clear_cursor(&mut self) {
        self.active_sub_element = None;
        self.progress = None;
    }

    /// select: 任意の状態 → Idle
    pub fn select(&mut self, index: usize) -> StateTransition {
        self.active_step_index = index;
        self.clear_cursor();
        self.selected_duration_ms = None;
        self.chunks.clear();
        self.set_status(PlayerStatus::Idle)
    }

    /// play: Idle/Stopped → Playing
    pub fn start(&mut self, from_index: usize) -> Result<StateTransition, PlaybackError> {
        match self.status {
            PlayerStatus::Idle | PlayerStatus::Stopped => {
                self.active_step_index = from_index;
                self.last_error = None;
                self.progress = None;
                Ok(self.set_status(PlayerStatus::Playing))
            }
            other => Err(PlaybackError::invalid_state(format!(
                "play is not allowed while {}",
                other.as_str()
            ))),
        }
    }

    /// pause: Playing → Paused
    pub fn pause(&mut self) -> Result<StateTransition, PlaybackError> {
        match self.status {
            PlayerStatus::Playing => Ok(self.set_status(PlayerStatus::Paused)),
            other => Err(PlaybackError::invalid_state(format!(
                "pause is not allowed while {}",
                other.as_str()
            ))),
        }
    }

    /// resume: Paused → Playing
    pub fn resume(&mut self) -> Result<StateTransition, PlaybackError> {
        match self.status {
            PlayerStatus::Paused => Ok(self.set_status(PlayerStatus::Playing)),
            other => Err(PlaybackError::invalid_state(format!(
                "resume is not allowed while {}",
                other.as_str()
            ))),
        }
    }

    /// stop: → Idle（カーソルは0）
    pub fn stop(&mut self) -> StateTransition {
        self.active_step_index = 0;
        self.clear_cursor();
        self.selected_duration_ms = None;
        self.chunks.clear();
        self.set_status(PlayerStatus::Idle)
    }

    /// シーケンス最後まで再生完了: Playing/Paused → Stopped（カーソルは0）
    pub fn finish(&mut self) -> StateTransition {
        self.active_step_index = 0;
        self.clear_cursor();
        self.chunks.clear();
        self.set_status(PlayerStatus::Stopped)
    }

    /// 取得/デコード失敗。カーソルは失敗したステップに残す。
    pub fn fail(&mut self, index: usize, error: &PlaybackError) -> StateTransition {
        self.active_step_index = index;
        self.clear_cursor();
        self.last_error = Some(error.to_info());
        self.set_status(PlayerStatus::Idle)
    }

    /// ステップ開始
    pub fn enter_step(&mut self, index: usize) {
        self.active_step_index = index;
        self.clear_cursor();
        self.chunks.clear();
    }
}

/// 状態遷移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub prev: PlayerStatus,
    pub next: PlayerStatus,
}

/// プレゼンテーション層へ配信するイベント。`run` は発行した再生ランの番号。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    StateChanged {
        transition: StateTransition,
    },
    StepStarted {
        run: u64,
        index: usize,
        kind: ElementKind,
    },
    SubElementChanged {
        run: u64,
        index: usize,
        sub_element: Option<SubElement>,
    },
    Progress {
        run: u64,
        index: usize,
        progress: Progress,
    },
    SelectionResolved {
        index: usize,
        duration_ms: Option<u64>,
    },
    Finished {
        run: u64,
    },
    /// stop() で打ち切られた
    Stopped {
        run: u64,
    },
    Failed {
        run: u64,
        index: usize,
        error: ErrorInfo,
    },
}

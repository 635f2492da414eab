use serde::{Deserialize, Serialize};

use super::error::PlaybackError;

// ==================== RawStep ====================

/// 設定エディタから渡されるステップ（フィールドの有無で種別が決まる）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStep {
    /// 待機秒数 / 文ごとのギャップ秒数
    #[serde(default, alias = "waitSeconds", skip_serializing_if = "Option::is_none")]
    pub wait: Option<f64>,
    /// 再生速度 (%)
    #[serde(default, alias = "speedPercent", skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// 文ごとの繰り返し回数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
}

impl RawStep {
    pub fn wait(seconds: f64) -> Self {
        Self {
            wait: Some(seconds),
            ..Default::default()
        }
    }

    pub fn full(speed_percent: f64) -> Self {
        Self {
            speed: Some(speed_percent),
            ..Default::default()
        }
    }

    pub fn sentence(gap_seconds: f64, speed_percent: f64, repeat: u32) -> Self {
        Self {
            wait: Some(gap_seconds),
            speed: Some(speed_percent),
            repeat: Some(repeat),
        }
    }
}

// ==================== Classification ====================

/// ステップ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementKind {
    Wait,
    FullDictation,
    SentenceBySentence,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::FullDictation => "full-dictation",
            Self::SentenceBySentence => "sentence-by-sentence",
        }
    }
}

/// `classify` の結果。パラメータは正規化済み（負値は0、repeat は1以上）。
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub kind: ElementKind,
    pub speed_percent: Option<u32>,
    pub wait_seconds: Option<f64>,
    pub repeat: Option<u32>,
    /// wait も speed も無い不正な形（ゼロ秒の Wait に縮退）
    pub malformed: bool,
}

/// ステップの種別を判定する。副作用なし。
pub fn classify(raw: &RawStep) -> Classified {
    let wait = raw.wait.map(clamp_seconds);
    let speed = raw.speed.map(clamp_percent);

    match (wait, speed) {
        (Some(wait), Some(speed)) => Classified {
            kind: ElementKind::SentenceBySentence,
            speed_percent: Some(speed),
            wait_seconds: Some(wait),
            repeat: Some(raw.repeat.unwrap_or(1).max(1)),
            malformed: false,
        },
        (None, Some(speed)) => Classified {
            kind: ElementKind::FullDictation,
            speed_percent: Some(speed),
            wait_seconds: None,
            repeat: None,
            malformed: false,
        },
        (Some(wait), None) => Classified {
            kind: ElementKind::Wait,
            speed_percent: None,
            wait_seconds: Some(wait),
            repeat: None,
            malformed: false,
        },
        (None, None) => Classified {
            kind: ElementKind::Wait,
            speed_percent: None,
            wait_seconds: Some(0.0),
            repeat: None,
            malformed: true,
        },
    }
}

fn clamp_seconds(seconds: f64) -> f64 {
    // NaN.max(0.0) は 0.0
    seconds.max(0.0)
}

fn clamp_percent(percent: f64) -> u32 {
    percent.max(0.0).round() as u32
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round() as u64
}

// ==================== Step ====================

/// 境界で一度だけ構築されるタグ付きステップ。内部ロジックはこちらだけを扱う。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawStep", into = "RawStep")]
pub enum Step {
    Wait {
        wait_ms: u64,
    },
    FullDictation {
        speed_percent: u32,
    },
    SentenceBySentence {
        speed_percent: u32,
        gap_ms: u64,
        repeat: u32,
    },
}

impl Step {
    pub fn from_raw(raw: &RawStep) -> Self {
        let c = classify(raw);
        match c.kind {
            ElementKind::Wait => Self::Wait {
                wait_ms: seconds_to_ms(c.wait_seconds.unwrap_or(0.0)),
            },
            ElementKind::FullDictation => Self::FullDictation {
                speed_percent: c.speed_percent.unwrap_or(0),
            },
            ElementKind::SentenceBySentence => Self::SentenceBySentence {
                speed_percent: c.speed_percent.unwrap_or(0),
                gap_ms: seconds_to_ms(c.wait_seconds.unwrap_or(0.0)),
                repeat: c.repeat.unwrap_or(1),
            },
        }
    }

    pub fn kind(&self) -> ElementKind {
        match self {
            Self::Wait { .. } => ElementKind::Wait,
            Self::FullDictation { .. } => ElementKind::FullDictation,
            Self::SentenceBySentence { .. } => ElementKind::SentenceBySentence,
        }
    }

    pub fn has_wait(&self) -> bool {
        !matches!(self, Self::FullDictation { .. })
    }

    pub fn has_speed(&self) -> bool {
        !matches!(self, Self::Wait { .. })
    }

    /// 一覧表示用のタイトル
    pub fn title(&self) -> &'static str {
        match self {
            Self::Wait { .. } => "Wait",
            Self::FullDictation { .. } => "Full dictation",
            Self::SentenceBySentence { .. } => "Sentence-by-sentence",
        }
    }

    /// 一覧表示用のサブタイトル（例: "Speed 90% • Gap 1.5s • Repeat 2x"）
    pub fn subtitle(&self) -> String {
        match self {
            Self::Wait { wait_ms } => format_seconds(*wait_ms),
            Self::FullDictation { speed_percent } => format!("Speed {speed_percent}%"),
            Self::SentenceBySentence {
                speed_percent,
                gap_ms,
                repeat,
            } => {
                let mut s = format!("Speed {speed_percent}% • Gap {}", format_seconds(*gap_ms));
                if *repeat > 1 {
                    s.push_str(&format!(" • Repeat {repeat}x"));
                }
                s
            }
        }
    }

    /// キャッシュキーに埋め込むパラメータ表現
    pub(crate) fn key_params(&self) -> String {
        match self {
            Self::Wait { wait_ms } => format!("w{wait_ms}"),
            Self::FullDictation { speed_percent } => format!("s{speed_percent}"),
            Self::SentenceBySentence {
                speed_percent,
                gap_ms,
                repeat,
            } => format!("s{speed_percent}-w{gap_ms}-r{repeat}"),
        }
    }
}

impl From<RawStep> for Step {
    fn from(raw: RawStep) -> Self {
        Self::from_raw(&raw)
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        match step {
            Step::Wait { wait_ms } => RawStep::wait(wait_ms as f64 / 1000.0),
            Step::FullDictation { speed_percent } => RawStep::full(speed_percent as f64),
            Step::SentenceBySentence {
                speed_percent,
                gap_ms,
                repeat,
            } => RawStep::sentence(gap_ms as f64 / 1000.0, speed_percent as f64, repeat),
        }
    }
}

fn format_seconds(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}s", ms as f64 / 1000.0)
    }
}

// ==================== Sequence ====================

/// 再生順に並んだステップ列。値で比較する（参照の同一性は使わない）。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence {
    steps: Vec<Step>,
}

impl Sequence {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// 生のステップ列から構築する。
    ///
    /// `strict` の場合、wait も speed も無いステップを `InvalidStep` として拒否する。
    /// そうでなければゼロ秒の Wait として扱い、警告ログを出す。
    pub fn from_raw(raw: &[RawStep], strict: bool) -> Result<Self, PlaybackError> {
        let mut steps = Vec::with_capacity(raw.len());
        for (index, r) in raw.iter().enumerate() {
            if classify(r).malformed {
                if strict {
                    return Err(PlaybackError::invalid_step(
                        index,
                        "step has neither wait nor speed",
                    ));
                }
                log::warn!("Step {index} has neither wait nor speed, treating as a zero-length wait");
            }
            steps.push(Step::from_raw(r));
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    /// 前回の設定から変化したか（長さ・各ステップのパラメータを比較）
    pub fn has_changed(&self, previous: &Sequence) -> bool {
        self != previous
    }
}

impl From<Vec<Step>> for Sequence {
    fn from(steps: Vec<Step>) -> Self {
        Self::new(steps)
    }
}

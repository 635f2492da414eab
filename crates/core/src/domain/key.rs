use std::fmt;

use super::state::SubElementKind;
use super::step::Step;

/// 長さキャッシュの複合キー。
///
/// ステップのパラメータをキーに含むため、速度やギャップを編集すると別キーになる
/// （既存エントリを書き換えることはない）。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelectionKey {
    Step {
        story_id: String,
        index: usize,
        step: Step,
    },
    SubElement {
        story_id: String,
        index: usize,
        speed_percent: u32,
        kind: SubElementKind,
        sub_index: usize,
        /// ギャップの場合のみ。ギャップ長を編集すると別キーになる。
        gap_ms: Option<u64>,
    },
}

impl SelectionKey {
    pub fn step(story_id: &str, index: usize, step: &Step) -> Self {
        Self::Step {
            story_id: story_id.to_string(),
            index,
            step: step.clone(),
        }
    }

    /// 文ごと再生ステップ内の音声チャンク
    pub fn audio(story_id: &str, index: usize, speed_percent: u32, sub_index: usize) -> Self {
        Self::SubElement {
            story_id: story_id.to_string(),
            index,
            speed_percent,
            kind: SubElementKind::Audio,
            sub_index,
            gap_ms: None,
        }
    }

    /// 文ごと再生ステップ内のギャップ
    pub fn gap(story_id: &str, index: usize, speed_percent: u32, sub_index: usize, gap_ms: u64) -> Self {
        Self::SubElement {
            story_id: story_id.to_string(),
            index,
            speed_percent,
            kind: SubElementKind::Gap,
            sub_index,
            gap_ms: Some(gap_ms),
        }
    }

    pub fn story_id(&self) -> &str {
        match self {
            Self::Step { story_id, .. } | Self::SubElement { story_id, .. } => story_id,
        }
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step {
                story_id,
                index,
                step,
            } => write!(
                f,
                "{story_id}-{index}-{}-{}",
                step.kind().as_str(),
                step.key_params()
            ),
            Self::SubElement {
                story_id,
                index,
                speed_percent,
                kind,
                sub_index,
                gap_ms,
            } => {
                write!(
                    f,
                    "{story_id}-{index}-s{speed_percent}-{}-{sub_index}",
                    kind.as_str()
                )?;
                if let Some(gap_ms) = gap_ms {
                    write!(f, "-w{gap_ms}")?;
                }
                Ok(())
            }
        }
    }
}

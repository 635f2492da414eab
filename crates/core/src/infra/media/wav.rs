use std::io::Cursor;

use crate::domain::error::PlaybackError;

/// デコード済み PCM（インターリーブ f32）
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn duration_ms(&self) -> u64 {
        let frames = self.samples.len() as u64 / self.channels.max(1) as u64;
        frames_to_ms(frames, self.sample_rate)
    }
}

fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames * 1000 / sample_rate as u64
}

fn reader(bytes: &[u8]) -> Result<hound::WavReader<Cursor<&[u8]>>, PlaybackError> {
    hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PlaybackError::decode(format!("invalid WAV payload: {e}")))
}

/// WAV ヘッダから長さ (ms) を読む。サンプルはデコードしない。
pub fn wav_duration_ms(bytes: &[u8]) -> Result<u64, PlaybackError> {
    let reader = reader(bytes)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(PlaybackError::decode("WAV sample rate is zero"));
    }
    Ok(frames_to_ms(reader.duration() as u64, spec.sample_rate))
}

/// 全サンプルを f32 (-1.0..1.0) にデコードする
pub fn decode_samples(bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
    let mut reader = reader(bytes)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| PlaybackError::decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| PlaybackError::decode(e.to_string()))?
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// 指定長の無音 WAV (16bit mono) を生成する
pub fn encode_silence(duration_ms: u64, sample_rate: u32) -> Result<Vec<u8>, PlaybackError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = duration_ms * sample_rate as u64 / 1000;

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| PlaybackError::decode(e.to_string()))?;
        for _ in 0..frames {
            writer
                .write_sample(0_i16)
                .map_err(|e| PlaybackError::decode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| PlaybackError::decode(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

//! WAV decoding for synthesized speech files.

use crate::audio::playback::PlaybackItem;
use crate::error::{HarmonyError, Result};
use hound::{SampleFormat, WavReader};
use std::io::Read;
use std::path::Path;

/// Decode the WAV file at `path` into a playback item whose `source_id` is
/// the path as given.
///
/// # Errors
///
/// Returns [`HarmonyError::Audio`] if the file cannot be opened or is not a
/// supported WAV file.
pub fn decode_wav_file(path: &str) -> Result<PlaybackItem> {
    let reader = WavReader::open(Path::new(path))
        .map_err(|e| HarmonyError::Audio(format!("cannot open '{path}': {e}")))?;
    decode(reader, path)
}

/// Decode WAV data from any reader.
///
/// # Errors
///
/// Returns [`HarmonyError::Audio`] for malformed or unsupported data.
pub fn decode_wav<R: Read>(data: R, source_id: &str) -> Result<PlaybackItem> {
    let reader = WavReader::new(data)
        .map_err(|e| HarmonyError::Audio(format!("invalid WAV '{source_id}': {e}")))?;
    decode(reader, source_id)
}

fn decode<R: Read>(reader: WavReader<R>, source_id: &str) -> Result<PlaybackItem> {
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(HarmonyError::Audio(format!("'{source_id}' has no channels")));
    }

    let samples: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect(),
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            if bits == 0 || bits > 32 {
                return Err(HarmonyError::Audio(format!(
                    "'{source_id}' has unsupported bit depth {bits}"
                )));
            }
            let scale = 1.0 / (1u64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect()
        }
    };
    let samples =
        samples.map_err(|e| HarmonyError::Audio(format!("corrupt WAV '{source_id}': {e}")))?;

    Ok(PlaybackItem {
        source_id: source_id.to_owned(),
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::io::Cursor;

    fn wav_bytes(
        spec: hound::WavSpec,
        write: impl FnOnce(&mut hound::WavWriter<&mut Cursor<Vec<u8>>>),
    ) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            write(&mut writer);
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn int16_is_normalised() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, |w| {
            for s in [0i16, 16_384, -32_768] {
                w.write_sample(s).unwrap();
            }
        });

        let item = decode_wav(Cursor::new(bytes), "speech.wav").unwrap();
        assert_eq!(item.source_id, "speech.wav");
        assert_eq!(item.sample_rate, 22_050);
        assert_eq!(item.channels, 1);
        assert_eq!(item.samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn float_stereo_keeps_interleaving() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let bytes = wav_bytes(spec, |w| {
            for s in [0.25f32, -0.25, 0.5, -0.5] {
                w.write_sample(s).unwrap();
            }
        });

        let item = decode_wav(Cursor::new(bytes), "s.wav").unwrap();
        assert_eq!(item.channels, 2);
        assert_eq!(item.frames(), 2);
        assert_eq!(item.samples, vec![0.25, -0.25, 0.5, -0.5]);
    }

    #[test]
    fn garbage_is_an_audio_error() {
        let err = decode_wav(Cursor::new(b"not a wav".to_vec()), "x.wav").unwrap_err();
        assert!(matches!(err, HarmonyError::Audio(_)));
    }

    #[test]
    fn missing_file_is_an_audio_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.wav");
        let err = decode_wav_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, HarmonyError::Audio(_)));
    }
}

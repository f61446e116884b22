//! PCM helpers: decoding client frames, energy, WAV encoding

use crate::{Error, Result};

/// Decodes little-endian 16-bit mono PCM into `f32` samples
///
/// Client frames may split a sample across two messages; the dangling byte
/// is carried over to the next call.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    carry: Option<u8>,
}

impl PcmDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self { carry: None }
    }

    /// Decode a chunk of raw bytes, appending samples to `out`
    pub fn decode_into(&mut self, bytes: &[u8], out: &mut Vec<f32>) {
        let mut rest = bytes;

        if let Some(lo) = self.carry.take() {
            let Some((&hi, tail)) = rest.split_first() else {
                self.carry = Some(lo);
                return;
            };
            out.push(pcm_to_f32(i16::from_le_bytes([lo, hi])));
            rest = tail;
        }

        let mut pairs = rest.chunks_exact(2);
        out.extend(
            pairs
                .by_ref()
                .map(|pair| pcm_to_f32(i16::from_le_bytes([pair[0], pair[1]]))),
        );
        self.carry = pairs.remainder().first().copied();
    }

    /// Decode a chunk of raw bytes into a new buffer
    #[must_use]
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(bytes.len() / 2 + 1);
        self.decode_into(bytes, &mut out);
        out
    }
}

fn pcm_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_rms() {
        assert!(calculate_rms(&[0.0; 100]) < 0.001);
        assert!(calculate_rms(&[0.5; 100]) > 0.4);
        assert!(calculate_rms(&[]) < f32::EPSILON);
    }

    #[test]
    fn decoder_handles_split_samples() {
        let bytes = encode(&[16384, -16384, 8192]);
        let mut decoder = PcmDecoder::new();

        let mut out = decoder.decode(&bytes[..3]);
        assert_eq!(out.len(), 1);
        decoder.decode_into(&bytes[3..], &mut out);

        assert_eq!(out.len(), 3);
        assert!((out[0] - 0.5).abs() < 1e-4);
        assert!((out[1] + 0.5).abs() < 1e-4);
        assert!((out[2] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn decoder_single_byte_chunks() {
        let bytes = encode(&[1000, 2000]);
        let mut decoder = PcmDecoder::new();
        let mut out = Vec::new();
        for b in &bytes {
            decoder.decode_into(std::slice::from_ref(b), &mut out);
        }
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn wav_has_header_and_samples() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5], 16_000).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 3);
    }
}

//! PCM16 audio frames and energy helpers

use crate::{Error, Result};

/// A mono PCM16 buffer tagged with its sample rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Wrap PCM16 samples
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A frame of digital silence
    #[must_use]
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0; len], sample_rate)
    }

    /// Convert f32 samples in `[-1.0, 1.0]` to PCM16
    #[must_use]
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let samples = samples
            .iter()
            .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Decode little-endian PCM16 bytes
    ///
    /// A trailing odd byte is ignored.
    #[must_use]
    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Encode as little-endian PCM16 bytes
    #[must_use]
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Samples as f32 in `[-1.0, 1.0]`
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }

    /// Raw samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Nominal sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of the frame
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_micros(
            self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate),
        )
    }

    /// RMS energy on the PCM16 scale
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms_i16(&self.samples)
    }
}

/// RMS energy of PCM16 samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
#[must_use]
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let s = f64::from(s);
            s * s
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// RMS energy of a little-endian PCM16 byte buffer
///
/// Empty and odd-length buffers have no well-formed samples and measure 0.
#[must_use]
pub fn pcm16_rms(bytes: &[u8]) -> f32 {
    if bytes.is_empty() || bytes.len() % 2 != 0 {
        return 0.0;
    }
    AudioFrame::from_pcm_bytes(bytes, 0).rms()
}

/// Encode PCM16 samples as WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
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
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_constant_signal() {
        let frame = AudioFrame::new(vec![1000; 160], 16_000);
        assert!((frame.rms() - 1000.0).abs() < 0.01);
    }

    #[test]
    fn test_rms_degenerate_buffers() {
        assert!(pcm16_rms(&[]).abs() < f32::EPSILON);
        assert!(pcm16_rms(&[0x10, 0x27, 0x10]).abs() < f32::EPSILON);
        assert!((pcm16_rms(&[0x10, 0x27]) - 10_000.0).abs() < 0.01);
    }

    #[test]
    fn test_duration() {
        let frame = AudioFrame::silence(1600, 16_000);
        assert_eq!(frame.duration(), std::time::Duration::from_millis(100));
    }

    #[test]
    fn test_f32_conversion_clamps() {
        let frame = AudioFrame::from_f32(&[2.0, -2.0, 0.0], 16_000);
        assert_eq!(frame.samples(), &[32767, -32768, 0]);
    }
}

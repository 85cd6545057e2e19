//! Fully decoded, immutable sample buffers for loopable layers.

use std::sync::Arc;

use super::ring::RING_CHANNELS;

/// Interleaved stereo PCM at the session sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl DecodedBuffer {
    /// Wrap interleaved stereo samples. A trailing half-frame is dropped.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32) -> Self {
        samples.truncate(samples.len() / RING_CHANNELS * RING_CHANNELS);
        Self {
            samples: samples.into(),
            sample_rate: sample_rate.max(1),
        }
    }

    /// Digital silence of the given length.
    pub fn silent(duration_secs: f64, sample_rate: u32) -> Self {
        let frames = (duration_secs.max(0.0) * f64::from(sample_rate)).round() as usize;
        Self::new(vec![0.0; frames * RING_CHANNELS], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / RING_CHANNELS
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Stereo frame at `index`, or silence past the end.
    pub fn frame(&self, index: usize) -> (f32, f32) {
        let base = index * RING_CHANNELS;
        match self.samples.get(base..base + RING_CHANNELS) {
            Some([left, right]) => (*left, *right),
            _ => (0.0, 0.0),
        }
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0.0)
    }
}

/// Fold interleaved audio with any channel count into stereo.
///
/// Mono is duplicated to both sides; extra channels beyond the first two are dropped.
pub fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|s| [*s, *s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_buffer() {
        let buffer = DecodedBuffer::silent(2.0, 48000);
        assert_eq!(buffer.frames(), 96000);
        assert!((buffer.duration_secs() - 2.0).abs() < f64::EPSILON);
        assert!(buffer.is_silent());
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_frame_access() {
        let buffer = DecodedBuffer::new(vec![0.1, 0.2, 0.3, 0.4, 0.5], 44100);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.frame(1), (0.3, 0.4));
        assert_eq!(buffer.frame(2), (0.0, 0.0));
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_to_stereo() {
        assert_eq!(to_stereo(&[0.5, 0.25], 1), vec![0.5, 0.5, 0.25, 0.25]);
        assert_eq!(
            to_stereo(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3),
            vec![1.0, 2.0, 4.0, 5.0]
        );
        assert!(to_stereo(&[1.0], 0).is_empty());
    }
}

//! Sample-rate conversion to the session rate using rubato.

use murmur_core::{Error, Result};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

/// Input frames per rubato chunk.
const CHUNK_FRAMES: usize = 1024;

/// Streaming resampler for interleaved audio.
///
/// When input and output rates match it is a passthrough and no rubato state is built.
pub struct Resampler {
    inner: Option<FftFixedIn<f32>>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Deinterleaved input waiting for a full chunk.
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        let channels = channels.max(1);
        let inner = if input_rate == output_rate {
            None
        } else {
            let resampler = FftFixedIn::new(
                input_rate as usize,
                output_rate as usize,
                CHUNK_FRAMES,
                2,
                channels,
            )
            .map_err(|e| Error::AudioDecode(format!("Failed to create resampler: {e}")))?;
            debug!(
                "Resampler created: {}Hz -> {}Hz, {} channels",
                input_rate, output_rate, channels
            );
            Some(resampler)
        };

        Ok(Self {
            inner,
            input_rate,
            output_rate,
            channels,
            pending: vec![Vec::new(); channels],
        })
    }

    pub const fn needs_resampling(&self) -> bool {
        self.inner.is_some()
    }

    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Feed interleaved input; returns whatever complete chunks produced.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };

        for frame in input.chunks_exact(self.channels) {
            for (pending, sample) in self.pending.iter_mut().zip(frame) {
                pending.push(*sample);
            }
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_FRAMES).collect())
                .collect();
            let resampled = resampler
                .process(&chunk, None)
                .map_err(|e| Error::AudioDecode(format!("Resample failed: {e}")))?;
            interleave_into(&resampled, usize::MAX, &mut output);
        }
        Ok(output)
    }

    /// Drain the tail, zero-padding the last chunk and trimming the padding's output.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        let remaining = self.pending[0].len();
        if remaining == 0 {
            return Ok(Vec::new());
        }

        let chunk: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|ch| {
                let mut data = std::mem::take(ch);
                data.resize(CHUNK_FRAMES, 0.0);
                data
            })
            .collect();
        let resampled = resampler
            .process(&chunk, None)
            .map_err(|e| Error::AudioDecode(format!("Resample failed: {e}")))?;

        let frames = (remaining as f64 * f64::from(self.output_rate) / f64::from(self.input_rate))
            .round() as usize;
        let mut output = Vec::with_capacity(frames * self.channels);
        interleave_into(&resampled, frames, &mut output);
        Ok(output)
    }

    /// Drop buffered input and filter state, e.g. when a stream restarts.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.inner.as_mut() {
            resampler.reset();
        }
        self.pending.iter_mut().for_each(Vec::clear);
    }
}

fn interleave_into(planes: &[Vec<f32>], max_frames: usize, output: &mut Vec<f32>) {
    let Some(first) = planes.first() else {
        return;
    };
    let frames = first.len().min(max_frames);
    for frame in 0..frames {
        for plane in planes {
            output.push(plane[frame]);
        }
    }
}

/// Convert a complete interleaved buffer from one rate to another.
pub fn resample_all(samples: &[f32], input_rate: u32, output_rate: u32, channels: usize) -> Result<Vec<f32>> {
    let mut resampler = Resampler::new(input_rate, output_rate, channels)?;
    let mut output = resampler.process(samples)?;
    output.extend(resampler.flush()?);
    Ok(output)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;

    #[test]
    fn test_no_resampling() {
        let mut resampler = Resampler::new(48000, 48000, 2).unwrap();
        assert!(!resampler.needs_resampling());

        let input = vec![0.5f32; 2048];
        let output = resampler.process(&input).unwrap();
        assert_eq!(output.len(), input.len());
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_resampler_creation() {
        let resampler = Resampler::new(48000, 44100, 2).unwrap();
        assert!(resampler.needs_resampling());
        assert_eq!(resampler.input_rate(), 48000);
        assert_eq!(resampler.output_rate(), 44100);
        assert_eq!(resampler.channels(), 2);
    }

    #[test]
    fn test_resample_all_length() {
        // One second of stereo at 44.1k becomes roughly one second at 48k.
        let input = vec![0.1f32; 44100 * 2];
        let output = resample_all(&input, 44100, 48000, 2).unwrap();
        let frames = output.len() / 2;
        assert_eq!(output.len() % 2, 0);
        assert!((47_000..=49_000).contains(&frames), "got {frames} frames");
    }
}

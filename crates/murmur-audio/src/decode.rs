//! Audio decoding using symphonia.
//!
//! [`AudioDecoder`] yields interleaved `f32` packets one at a time, which is what the theme
//! stream worker needs. [`decode_all`] drains a decoder in one go for layer buffers.

use std::io::Cursor;

use bytes::Bytes;
use murmur_core::{Error, Result};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};

/// Packet-by-packet decoder over an in-memory asset.
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl AudioDecoder {
    /// Probe `data` and open its first audio track.
    ///
    /// `extension_hint` is a file extension such as `"mp3"`; it only speeds up probing.
    pub fn from_bytes(data: Bytes, extension_hint: Option<&str>) -> Result<Self> {
        let cursor = Cursor::new(data);
        let mss = MediaSourceStream::new(Box::new(cursor), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension_hint {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::AudioDecode(format!("Failed to probe format: {e}")))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::AudioDecode("No audio tracks found".to_string()))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::AudioDecode("Track has no sample rate".to_string()))?;
        let channels = track.codec_params.channels.map_or(2, |c| c.count());

        debug!(
            "Audio track: id={}, sample_rate={}, channels={}",
            track_id, sample_rate, channels
        );

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::AudioDecode(format!("Failed to create decoder: {e}")))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            sample_buf: None,
        })
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Decode the next packet into interleaved samples. `Ok(None)` at end of stream.
    pub fn decode_next(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Failed to read packet: {e}")));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    self.channels = spec.channels.count();
                    let needed = decoded.capacity() * self.channels;
                    if self
                        .sample_buf
                        .as_ref()
                        .is_some_and(|buf| buf.capacity() < needed)
                    {
                        self.sample_buf = None;
                    }
                    let frames = decoded.capacity() as u64;
                    let buf = self
                        .sample_buf
                        .get_or_insert_with(|| SampleBuffer::new(frames, spec));
                    buf.copy_interleaved_ref(decoded);
                    return Ok(Some(buf.samples().to_vec()));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt frames are skipped rather than ending the stream.
                    warn!("Decode error (skipping): {e}");
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Decode failed: {e}")));
                }
            }
        }
    }
}

/// Fully decoded asset in its native format.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved samples with `channels` channels.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Decode every packet of `data`.
pub fn decode_all(data: Bytes, extension_hint: Option<&str>) -> Result<DecodedAudio> {
    let mut decoder = AudioDecoder::from_bytes(data, extension_hint)?;
    let mut samples = Vec::new();
    while let Some(packet) = decoder.decode_next()? {
        samples.extend_from_slice(&packet);
    }

    if samples.is_empty() {
        return Err(Error::AudioDecode("Asset decoded to zero samples".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate: decoder.sample_rate(),
        channels: decoder.channels(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
pub(crate) mod tests {
    use super::*;

    /// Encode a WAV in memory with `hound`.
    pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Bytes {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample((s * f32::from(i16::MAX)) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        Bytes::from(cursor.into_inner())
    }

    #[test]
    fn test_decode_wav() {
        let input: Vec<f32> = (0..4800).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let decoded = decode_all(wav_bytes(&input, 48000, 2), Some("wav")).unwrap();

        assert_eq!(decoded.sample_rate, 48000);
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.samples.len(), input.len());
        assert!((decoded.samples[0] - 0.5).abs() < 1e-3);
        assert!((decoded.samples[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = decode_all(Bytes::from_static(b"definitely not audio"), None);
        assert!(matches!(result, Err(Error::AudioDecode(_))));
    }
}

//! Device output using cpal.
//!
//! The device callback pulls frames from the [`AudioSession`], which is what advances the
//! session clock in [`OutputMode::Device`](crate::config::OutputMode). `cpal::Stream` is
//! not `Send`, so the stream lives on its own thread until [`DeviceOutput::stop`].

use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, SampleFormat, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use murmur_core::{Error, Result};
use tracing::{debug, error, info};

use crate::session::AudioSession;

/// What the opened device ended up running at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputInfo {
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

/// A running output stream feeding from a session.
pub struct DeviceOutput {
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceOutput {
    /// Open the default output device and start pulling from `session`.
    ///
    /// Blocks until the stream is playing or has failed to open.
    pub fn start(session: Arc<AudioSession>) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<OutputInfo>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                // Created inside the thread because cpal::Stream is not Send.
                let (stream, info) = match open_stream(session) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(info));

                // Park until shutdown; the stream stops when dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Audio output thread exiting");
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn output thread: {e}")))?;

        let info = ready_rx
            .recv()
            .map_err(|_| Error::AudioOutput("Output thread exited during startup".to_string()))??;

        info!(
            "Audio output started: {} ({} Hz, {} channels)",
            info.device_name, info.sample_rate, info.channels
        );

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Stop the stream and join its thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("Audio output stopped");
        }
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(session: Arc<AudioSession>) -> Result<(Stream, OutputInfo)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::AudioOutput("No output device found".to_string()))?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported_config = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("Failed to get output config: {e}")))?;
    debug!("Supported output config: {:?}", supported_config);

    let sample_format = supported_config.sample_format();
    let mut config: StreamConfig = supported_config.into();
    // The session clock defines the rate; the engine probes the device rate up front.
    config.sample_rate = cpal::SampleRate(session.sample_rate());

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, session)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, session)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, session)?,
        _ => {
            return Err(Error::AudioOutput(format!(
                "Unsupported sample format: {sample_format:?}"
            )));
        }
    };

    stream
        .play()
        .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;

    Ok((
        stream,
        OutputInfo {
            device_name,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        },
    ))
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    session: Arc<AudioSession>,
) -> Result<Stream> {
    let channels = usize::from(config.channels);
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| {
        error!("Audio stream error: {err}");
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let mixed = &mut scratch[..data.len()];
                session.render(mixed, channels);

                for (out, sample) in data.iter_mut().zip(mixed.iter()) {
                    // Soft clipping for summed layers that exceed full scale
                    let limited = if sample.abs() > 0.9 { sample.tanh() } else { *sample };
                    *out = T::from_sample(limited);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {e}")))
}

/// Sample rate of the default output device, if there is one.
pub fn probe_default_rate() -> Option<u32> {
    let device = cpal::default_host().default_output_device()?;
    let config = device.default_output_config().ok()?;
    Some(config.sample_rate().0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_does_not_panic() {
        // No audio hardware on CI; only the absence of a panic is checked.
        let _ = probe_default_rate();
    }
}

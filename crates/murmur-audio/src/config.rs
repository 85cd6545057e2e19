//! Engine tuning knobs.
//!
//! All durations on the audio clock are in seconds (`f64`), matching the gain automation
//! API. Host-timer intervals use [`std::time::Duration`].

use std::time::Duration;

use murmur_core::DEFAULT_LAYER_VOLUME;
use serde::{Deserialize, Serialize};

/// Where rendered audio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Open the default output device; its callback drives the session clock.
    #[default]
    Device,
    /// No device. The host pulls frames with `AudioSession::render_frames`.
    Offline,
}

/// Configuration for the mix engine and its components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session sample rate used when no device rate is available.
    pub sample_rate: u32,
    pub output: OutputMode,
    /// Theme crossfade and initial master fade-in.
    pub crossfade_secs: f64,
    /// Master fade-out before a reset's silent reassignment.
    pub reset_fade_out_secs: f64,
    /// Master fade-in after a reset's silent reassignment.
    pub reset_fade_in_secs: f64,
    /// Ramp used by slider-style volume changes.
    pub volume_ramp_secs: f64,
    /// How far ahead of the audio clock loop segments are queued.
    pub schedule_ahead_secs: f64,
    /// How much consecutive loop segments overlap.
    pub loop_overlap_secs: f64,
    /// Wake-up cadence of each loop scheduler.
    pub loop_tick_ms: u64,
    /// Length of the placeholder buffer used when a layer fails to load.
    pub silent_buffer_secs: f64,
    /// How long initialization waits for a theme stream to produce audio.
    pub stream_start_timeout_ms: u64,
    /// Gain for a layer listed in a reset without an explicit volume.
    pub default_layer_volume: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            output: OutputMode::Device,
            crossfade_secs: 3.5,
            reset_fade_out_secs: 0.5,
            reset_fade_in_secs: 1.5,
            volume_ramp_secs: 0.1,
            schedule_ahead_secs: 0.1,
            loop_overlap_secs: 0.1,
            loop_tick_ms: 25,
            silent_buffer_secs: 2.0,
            stream_start_timeout_ms: 10_000,
            default_layer_volume: DEFAULT_LAYER_VOLUME,
        }
    }
}

impl EngineConfig {
    /// Defaults with no output device, for tests and headless rendering.
    pub fn offline() -> Self {
        Self {
            output: OutputMode::Offline,
            ..Self::default()
        }
    }

    pub const fn loop_tick(&self) -> Duration {
        Duration::from_millis(self.loop_tick_ms)
    }

    pub const fn stream_start_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_start_timeout_ms)
    }

    pub fn reset_fade_out(&self) -> Duration {
        Duration::from_secs_f64(self.reset_fade_out_secs.max(0.0))
    }

    /// Mute and unmute use half the crossfade.
    pub fn mute_ramp_secs(&self) -> f64 {
        self.crossfade_secs / 2.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.loop_tick(), Duration::from_millis(25));
        assert!((config.mute_ramp_secs() - 1.75).abs() < f64::EPSILON);
        assert_eq!(config.reset_fade_out(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"crossfade_secs": 2.0, "output": "offline"}"#).unwrap();
        assert_eq!(config.output, OutputMode::Offline);
        assert!((config.crossfade_secs - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.sample_rate, 48000);
    }
}

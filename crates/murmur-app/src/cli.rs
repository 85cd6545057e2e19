//! Command-line flags and engine configuration loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use murmur_audio::{EngineConfig, OutputMode};
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";

/// Ambient soundscape mixer.
#[derive(Debug, Parser)]
#[command(name = "murmur", version, about)]
pub struct Args {
    /// Theme and layer catalog.
    #[arg(long, default_value = "assets/catalog.json")]
    pub catalog: PathBuf,

    /// Engine configuration file (JSON). Defaults to the platform config directory.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for the snapshot database. Defaults to the platform data directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Render without an output device, pacing the clock in real time.
    #[arg(long)]
    pub offline: bool,

    /// Session sample rate when no device rate is available.
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Theme crossfade in seconds.
    #[arg(long)]
    pub crossfade: Option<f64>,
}

impl Args {
    /// Config file, then flags on top.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match self.config_path() {
            Some(path) => read_config(&path)?,
            None => EngineConfig::default(),
        };

        if self.offline {
            config.output = OutputMode::Offline;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(crossfade) = self.crossfade {
            config.crossfade_secs = crossfade.max(0.0);
        }
        debug!("Engine config: {config:?}");
        Ok(config)
    }

    fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config {
            return Some(path.clone());
        }
        let default = ProjectDirs::from("com", "murmur", "Murmur")?
            .config_dir()
            .join(CONFIG_FILE);
        default.exists().then_some(default)
    }
}

fn read_config(path: &Path) -> Result<EngineConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&json)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"crossfade_secs": 2.0, "sample_rate": 44100}"#).unwrap();

        let args = Args::parse_from([
            "murmur",
            "--config",
            path.to_str().unwrap(),
            "--offline",
            "--sample-rate",
            "22050",
        ]);
        let config = args.engine_config().unwrap();
        assert_eq!(config.output, OutputMode::Offline);
        assert_eq!(config.sample_rate, 22050);
        assert!((config.crossfade_secs - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bad_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{").unwrap();
        let args = Args::parse_from(["murmur", "--config", path.to_str().unwrap()]);
        assert!(args.engine_config().is_err());
    }
}

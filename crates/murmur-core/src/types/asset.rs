//! Theme and layer assets.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use super::{AssetId, VolumeMap};
use crate::{Error, HttpError, Result};

/// Anything with an id and an audio source the engine can play.
pub trait SoundAsset {
    fn id(&self) -> &AssetId;
    fn name(&self) -> &str;
    fn audio_src(&self) -> &str;

    /// Resolve `audio_src` into a fetchable location.
    fn source(&self) -> Result<AssetSource> {
        AssetSource::parse(self.audio_src())
    }
}

/// Long-form background music, streamed rather than fully decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub id: AssetId,
    pub name: String,
    pub audio_src: String,
    /// Visual effect tag consumed by the visualization collaborator.
    #[serde(default)]
    pub vanta_effect: Option<String>,
    /// Layers this theme ships with.
    #[serde(default)]
    pub layers: Vec<AssetId>,
    #[serde(default = "default_theme_volume")]
    pub default_theme_volume: f32,
    #[serde(default)]
    pub default_volumes: VolumeMap,
}

const fn default_theme_volume() -> f32 {
    0.5
}

impl Theme {
    pub fn new(id: impl Into<AssetId>, name: impl Into<String>, audio_src: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            audio_src: audio_src.into(),
            vanta_effect: None,
            layers: Vec::new(),
            default_theme_volume: default_theme_volume(),
            default_volumes: VolumeMap::new(),
        }
    }

    /// Add a layer with its default gain.
    pub fn with_layer(mut self, layer: impl Into<AssetId>, volume: f32) -> Self {
        let layer = layer.into();
        self.default_volumes.insert(layer.clone(), volume);
        self.layers.push(layer);
        self
    }

    pub const fn with_volume(mut self, volume: f32) -> Self {
        self.default_theme_volume = volume;
        self
    }

    pub fn has_layer(&self, layer: &str) -> bool {
        self.layers.iter().any(|l| l.as_str() == layer)
    }
}

impl SoundAsset for Theme {
    fn id(&self) -> &AssetId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn audio_src(&self) -> &str {
        &self.audio_src
    }
}

/// Short environmental loop, decoded fully into memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub id: AssetId,
    pub name: String,
    pub audio_src: String,
}

impl Layer {
    pub fn new(id: impl Into<AssetId>, name: impl Into<String>, audio_src: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            audio_src: audio_src.into(),
        }
    }
}

impl SoundAsset for Layer {
    fn id(&self) -> &AssetId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn audio_src(&self) -> &str {
        &self.audio_src
    }
}

/// Where an asset's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    Http(Url),
    File(PathBuf),
}

impl AssetSource {
    /// Parse an `audioSrc` value. Strings without a scheme are filesystem paths.
    pub fn parse(src: &str) -> Result<Self> {
        if !src.contains("://") {
            return Ok(Self::File(PathBuf::from(src)));
        }

        let url = Url::parse(src).map_err(|e| HttpError::InvalidUrl(format!("{src}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(url)),
            "file" => url
                .to_file_path()
                .map(Self::File)
                .map_err(|()| Error::InvalidArgument(format!("Not a local file URL: {src}"))),
            other => Err(Error::UnsupportedFormat(format!("URL scheme '{other}'"))),
        }
    }

    /// Lowercase file extension, used as a container hint for the decoder.
    pub fn extension(&self) -> Option<String> {
        let path = match self {
            Self::Http(url) => Path::new(url.path()).to_path_buf(),
            Self::File(path) => path.clone(),
        };
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;

    #[test]
    fn test_parse_sources() {
        assert!(matches!(
            AssetSource::parse("https://cdn.example.com/audio/rain.mp3"),
            Ok(AssetSource::Http(_))
        ));
        assert_eq!(
            AssetSource::parse("sounds/rain.ogg").ok(),
            Some(AssetSource::File(PathBuf::from("sounds/rain.ogg")))
        );
        assert!(matches!(
            AssetSource::parse("ftp://example.com/rain.mp3"),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_extension_hint() {
        let src = AssetSource::parse("https://cdn.example.com/a/Forest.MP3?v=2").ok();
        assert_eq!(src.and_then(|s| s.extension()), Some("mp3".to_string()));
    }

    #[test]
    fn test_theme_json_shape() {
        let json = r#"{
            "id": "lofi",
            "name": "Lo-fi",
            "audioSrc": "themes/lofi.mp3",
            "vantaEffect": "fog",
            "layers": ["rain"],
            "defaultThemeVolume": 0.6,
            "defaultVolumes": {"rain": 0.3}
        }"#;
        let theme: Theme = serde_json::from_str(json).unwrap();
        assert_eq!(theme.vanta_effect.as_deref(), Some("fog"));
        assert!(theme.has_layer("rain"));
        assert_eq!(theme.default_volumes.get("rain"), Some(&0.3));
    }
}

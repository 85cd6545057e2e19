//! The set of themes and layers available to the mixer.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AssetId, Layer, Theme};
use crate::{Error, Result};

/// Themes and layers, as shipped in `catalog.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    themes: Vec<Theme>,
    #[serde(default)]
    layers: Vec<Layer>,
}

impl Catalog {
    /// Build a catalog, dropping duplicate ids and dangling layer references.
    pub fn new(themes: Vec<Theme>, layers: Vec<Layer>) -> Self {
        let mut catalog = Self { themes, layers };
        catalog.normalize();
        catalog
    }

    /// Parse a catalog from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut catalog: Self = serde_json::from_str(json)?;
        if catalog.themes.is_empty() {
            return Err(Error::InvalidCatalog("catalog has no themes".to_string()));
        }
        catalog.normalize();
        Ok(catalog)
    }

    /// Read and parse a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&json)?;
        debug!(
            "Loaded catalog from {}: {} themes, {} layers",
            path.display(),
            catalog.themes.len(),
            catalog.layers.len()
        );
        Ok(catalog)
    }

    fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.layers.retain(|layer| {
            let fresh = seen.insert(layer.id.clone());
            if !fresh {
                warn!("Duplicate layer id '{}' ignored", layer.id);
            }
            fresh
        });

        let mut seen_themes = std::collections::HashSet::new();
        self.themes.retain(|theme| {
            let fresh = seen_themes.insert(theme.id.clone());
            if !fresh {
                warn!("Duplicate theme id '{}' ignored", theme.id);
            }
            fresh
        });

        for theme in &mut self.themes {
            theme.layers.retain(|id| {
                let known = seen.contains(id);
                if !known {
                    warn!("Theme '{}' references unknown layer '{id}'", theme.id);
                }
                known
            });
            let layers = &theme.layers;
            theme.default_volumes.retain(|id, _| layers.contains(id));
        }
    }

    pub fn themes(&self) -> &[Theme] {
        &self.themes
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn theme(&self, id: &str) -> Option<&Theme> {
        self.themes.iter().find(|t| t.id.as_str() == id)
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id.as_str() == id)
    }

    /// Like [`Catalog::theme`], failing with [`Error::UnknownAsset`].
    pub fn require_theme(&self, id: &str) -> Result<&Theme> {
        self.theme(id)
            .ok_or_else(|| Error::UnknownAsset(id.to_string()))
    }

    pub fn is_theme(&self, id: &str) -> bool {
        self.theme(id).is_some()
    }

    pub fn is_layer(&self, id: &str) -> bool {
        self.layer(id).is_some()
    }

    /// The theme played when nothing else has been chosen.
    pub fn default_theme(&self) -> Option<&Theme> {
        self.themes.first()
    }

    pub fn theme_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.themes.iter().map(|t| &t.id)
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.layers.iter().map(|l| &l.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "themes": [
            {"id": "storm", "name": "Storm", "audioSrc": "themes/storm.mp3",
             "layers": ["rain", "thunder", "ghost"],
             "defaultVolumes": {"rain": 0.4, "thunder": 0.2, "ghost": 1.0}},
            {"id": "woods", "name": "Woods", "audioSrc": "themes/woods.mp3", "layers": ["forest"]}
        ],
        "layers": [
            {"id": "rain", "name": "Rain", "audioSrc": "layers/rain.ogg"},
            {"id": "thunder", "name": "Thunder", "audioSrc": "layers/thunder.ogg"},
            {"id": "forest", "name": "Forest", "audioSrc": "layers/forest.ogg"},
            {"id": "rain", "name": "Rain again", "audioSrc": "layers/rain2.ogg"}
        ]
    }"#;

    #[test]
    fn test_parse_and_normalize() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.layers().len(), 3);
        assert_eq!(catalog.layer("rain").unwrap().audio_src, "layers/rain.ogg");

        let storm = catalog.theme("storm").unwrap();
        assert_eq!(storm.layers.len(), 2);
        assert!(!storm.has_layer("ghost"));
        assert!(storm.default_volumes.get("ghost").is_none());
        assert!((storm.default_theme_volume - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_default_theme_is_first() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.default_theme().unwrap().id.as_str(), "storm");
        assert!(catalog.is_theme("woods"));
        assert!(!catalog.is_layer("woods"));
        assert!(matches!(
            catalog.require_theme("nowhere"),
            Err(Error::UnknownAsset(id)) if id == "nowhere"
        ));
    }

    #[test]
    fn test_empty_catalog_rejected() {
        assert!(matches!(
            Catalog::from_json(r#"{"themes": [], "layers": []}"#),
            Err(Error::InvalidCatalog(_))
        ));
    }
}

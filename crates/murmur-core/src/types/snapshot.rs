//! Persisted mix state and the initial gain targets derived from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{AssetId, Catalog, Theme, Volume, VolumeMap};

/// Gain given to a layer that is part of a mix but has no stored volume.
pub const DEFAULT_LAYER_VOLUME: f32 = 0.5;

/// A user-built mix: a base theme stream plus a chosen set of layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomTheme {
    pub id: AssetId,
    pub name: String,
    pub base_theme: AssetId,
    pub layers: Vec<AssetId>,
    pub main_volume: f32,
    #[serde(default)]
    pub layer_volumes: VolumeMap,
}

/// Everything the persistence collaborator stores between sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MixSnapshot {
    /// Theme whose stream is audible.
    pub active_theme: Option<AssetId>,
    /// Main volume per theme.
    pub main_volumes: VolumeMap,
    /// Layer volumes per theme.
    pub layer_volumes: BTreeMap<AssetId, VolumeMap>,
    /// User-defined mixes.
    pub custom_themes: Vec<CustomTheme>,
    /// The custom mix currently applied, if any.
    pub active_custom: Option<AssetId>,
}

/// Gain targets handed to the engine at initialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialMix {
    pub active_theme: Option<AssetId>,
    /// One entry per theme and layer in the catalog.
    pub volumes: VolumeMap,
}

impl InitialMix {
    pub fn volume(&self, id: &str) -> f32 {
        self.volumes.get(id).copied().unwrap_or(0.0)
    }
}

impl MixSnapshot {
    pub fn custom_theme(&self, id: &str) -> Option<&CustomTheme> {
        self.custom_themes.iter().find(|c| c.id.as_str() == id)
    }

    /// Insert or replace a custom theme by id.
    pub fn upsert_custom_theme(&mut self, custom: CustomTheme) {
        match self.custom_themes.iter_mut().find(|c| c.id == custom.id) {
            Some(existing) => *existing = custom,
            None => self.custom_themes.push(custom),
        }
    }

    pub fn remove_custom_theme(&mut self, id: &str) -> bool {
        let before = self.custom_themes.len();
        self.custom_themes.retain(|c| c.id.as_str() != id);
        if self.active_custom.as_ref().is_some_and(|a| a.as_str() == id) {
            self.active_custom = None;
        }
        before != self.custom_themes.len()
    }

    /// The custom theme that is both selected and still resolvable.
    pub fn applied_custom<'a>(&'a self, catalog: &Catalog) -> Option<&'a CustomTheme> {
        let id = self.active_custom.as_ref()?;
        self.custom_theme(id.as_str())
            .filter(|c| catalog.is_theme(c.base_theme.as_str()))
    }

    pub fn set_main_volume(&mut self, theme: &AssetId, volume: f32) {
        self.main_volumes
            .insert(theme.clone(), Volume::new(volume).as_f32());
    }

    pub fn set_layer_volume(&mut self, theme: &AssetId, layer: &AssetId, volume: f32) {
        self.layer_volumes
            .entry(theme.clone())
            .or_default()
            .insert(layer.clone(), Volume::new(volume).as_f32());
    }

    /// Stored main volume for a theme, falling back to its catalog default.
    pub fn main_volume_for(&self, theme: &Theme) -> f32 {
        self.main_volumes
            .get(&theme.id)
            .copied()
            .unwrap_or(theme.default_theme_volume)
    }

    /// Volumes of the layers a theme ships with.
    pub fn layer_volumes_for(&self, theme: &Theme) -> VolumeMap {
        let stored = self.layer_volumes.get(&theme.id);
        theme
            .layers
            .iter()
            .map(|layer| {
                let volume = stored
                    .and_then(|s| s.get(layer))
                    .or_else(|| theme.default_volumes.get(layer))
                    .copied()
                    .unwrap_or(DEFAULT_LAYER_VOLUME);
                (layer.clone(), volume)
            })
            .collect()
    }

    /// Derive the gain target of every catalog asset.
    ///
    /// Unknown ids in the snapshot are ignored; an unknown active theme falls back to the
    /// catalog default.
    pub fn initial_mix(&self, catalog: &Catalog) -> InitialMix {
        let mut volumes: VolumeMap = catalog
            .theme_ids()
            .chain(catalog.layer_ids())
            .map(|id| (id.clone(), 0.0))
            .collect();

        let (active, main, layers) = if let Some(custom) = self.applied_custom(catalog) {
            let layers = custom
                .layers
                .iter()
                .filter(|l| catalog.is_layer(l.as_str()))
                .map(|l| {
                    let v = custom
                        .layer_volumes
                        .get(l)
                        .copied()
                        .unwrap_or(DEFAULT_LAYER_VOLUME);
                    (l.clone(), v)
                })
                .collect();
            (custom.base_theme.clone(), custom.main_volume, layers)
        } else {
            let theme = self
                .active_theme
                .as_ref()
                .and_then(|id| catalog.theme(id.as_str()))
                .or_else(|| catalog.default_theme());
            let Some(theme) = theme else {
                return InitialMix {
                    active_theme: None,
                    volumes,
                };
            };
            (
                theme.id.clone(),
                self.main_volume_for(theme),
                self.layer_volumes_for(theme),
            )
        };

        volumes.insert(active.clone(), Volume::new(main).as_f32());
        for (layer, volume) in layers {
            volumes.insert(layer, Volume::new(volume).as_f32());
        }

        InitialMix {
            active_theme: Some(active),
            volumes,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;
    use crate::Layer;

    fn catalog() -> Catalog {
        Catalog::new(
            vec![
                Theme::new("a", "A", "a.mp3").with_layer("rain", 0.2).with_volume(0.8),
                Theme::new("b", "B", "b.mp3").with_layer("forest", 0.4),
            ],
            vec![
                Layer::new("rain", "Rain", "rain.ogg"),
                Layer::new("forest", "Forest", "forest.ogg"),
            ],
        )
    }

    #[test]
    fn test_empty_snapshot_uses_catalog_defaults() {
        let mix = MixSnapshot::default().initial_mix(&catalog());
        assert_eq!(mix.active_theme, Some(AssetId::from("a")));
        assert!((mix.volume("a") - 0.8).abs() < f32::EPSILON);
        assert!((mix.volume("rain") - 0.2).abs() < f32::EPSILON);
        assert!(mix.volume("b").abs() < f32::EPSILON);
        assert!(mix.volume("forest").abs() < f32::EPSILON);
        assert_eq!(mix.volumes.len(), 4);
    }

    #[test]
    fn test_stored_volumes_override_defaults() {
        let mut snapshot = MixSnapshot {
            active_theme: Some("b".into()),
            ..MixSnapshot::default()
        };
        snapshot.set_main_volume(&"b".into(), 0.3);
        snapshot.set_layer_volume(&"b".into(), &"forest".into(), 1.7);

        let mix = snapshot.initial_mix(&catalog());
        assert_eq!(mix.active_theme, Some(AssetId::from("b")));
        assert!((mix.volume("b") - 0.3).abs() < f32::EPSILON);
        assert!((mix.volume("forest") - 1.0).abs() < f32::EPSILON);
        assert!(mix.volume("a").abs() < f32::EPSILON);
    }

    #[test]
    fn test_unknown_active_theme_falls_back() {
        let snapshot = MixSnapshot {
            active_theme: Some("gone".into()),
            ..MixSnapshot::default()
        };
        assert_eq!(
            snapshot.initial_mix(&catalog()).active_theme,
            Some(AssetId::from("a"))
        );
    }

    #[test]
    fn test_custom_theme_drives_initial_mix() {
        let mut snapshot = MixSnapshot::default();
        snapshot.upsert_custom_theme(CustomTheme {
            id: "night".into(),
            name: "Night".into(),
            base_theme: "b".into(),
            layers: vec!["rain".into(), "forest".into()],
            main_volume: 0.7,
            layer_volumes: [(AssetId::from("rain"), 0.9)].into_iter().collect(),
        });
        snapshot.active_custom = Some("night".into());

        let mix = snapshot.initial_mix(&catalog());
        assert_eq!(mix.active_theme, Some(AssetId::from("b")));
        assert!((mix.volume("b") - 0.7).abs() < f32::EPSILON);
        assert!((mix.volume("rain") - 0.9).abs() < f32::EPSILON);
        assert!((mix.volume("forest") - DEFAULT_LAYER_VOLUME).abs() < f32::EPSILON);

        assert!(snapshot.remove_custom_theme("night"));
        assert!(snapshot.active_custom.is_none());
    }

    #[test]
    fn test_snapshot_json_uses_camel_case() {
        let snapshot = MixSnapshot {
            active_theme: Some("a".into()),
            ..MixSnapshot::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"activeTheme\":\"a\""));
        assert!(json.contains("\"mainVolumes\""));
    }
}

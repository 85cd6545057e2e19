//! Application state: applies commands to the engine and keeps the snapshot in step.

use std::fmt::Write as _;

use anyhow::{anyhow, bail, Context, Result};
use murmur_audio::MixEngine;
use murmur_core::{AssetId, CustomTheme, MixSnapshot, VolumeMap};
use murmur_store::SnapshotStore;
use tracing::{debug, info};

use crate::commands::{Command, HELP};

pub struct App {
    engine: MixEngine,
    store: SnapshotStore,
    snapshot: MixSnapshot,
}

impl App {
    pub const fn new(engine: MixEngine, store: SnapshotStore, snapshot: MixSnapshot) -> Self {
        Self {
            engine,
            store,
            snapshot,
        }
    }

    pub const fn engine(&self) -> &MixEngine {
        &self.engine
    }

    pub const fn snapshot(&self) -> &MixSnapshot {
        &self.snapshot
    }

    fn active_theme(&self) -> Result<AssetId> {
        self.engine
            .current_mix()
            .active_theme
            .or_else(|| self.snapshot.active_theme.clone())
            .ok_or_else(|| anyhow!("no theme is active"))
    }

    fn active_custom_mut(&mut self) -> Option<&mut CustomTheme> {
        let id = self.snapshot.active_custom.clone()?;
        self.snapshot
            .custom_themes
            .iter_mut()
            .find(|c| c.id == id)
    }

    /// Apply one command and persist the snapshot if it changed. Returns the reply text.
    pub fn apply(&mut self, command: Command) -> Result<String> {
        debug!("Applying {command:?}");
        let persist = command.changes_snapshot();
        let reply = match command {
            Command::Theme(id) => self.select_theme(&id)?,
            Command::Volume(volume) => self.set_main_volume(volume)?,
            Command::Layer { id, volume } => self.set_layer_volume(&id, volume)?,
            Command::Mute => {
                if self.engine.toggle_mute() {
                    "muted".to_string()
                } else {
                    "unmuted".to_string()
                }
            }
            Command::Reset {
                theme,
                main_volume,
                layers,
            } => self.reset(&theme, main_volume, &layers)?,
            Command::CustomApply(id) => self.apply_custom(&id)?,
            Command::CustomSave { id, name } => self.save_custom(id, name)?,
            Command::CustomDelete(id) => {
                if !self.snapshot.remove_custom_theme(id.as_str()) {
                    bail!("no custom theme '{id}'");
                }
                format!("deleted '{id}'")
            }
            Command::CustomList => self.list_custom(),
            Command::Status => self.describe_status(),
            Command::Mix => self.describe_mix(),
            Command::Help => HELP.to_string(),
            Command::Quit => "bye".to_string(),
        };

        if persist {
            let written = self
                .store
                .save_snapshot(&self.snapshot)
                .context("Failed to save snapshot")?;
            debug!("Snapshot saved ({written} key(s) changed)");
        }
        Ok(reply)
    }

    fn select_theme(&mut self, id: &AssetId) -> Result<String> {
        let catalog = self.engine.catalog();
        let theme = catalog.require_theme(id.as_str())?;
        let volume = self.snapshot.main_volume_for(theme);
        let layer_volumes = self.snapshot.layer_volumes_for(theme);

        if !self.engine.select_theme(id.as_str(), volume) {
            if !self.engine.status().initialized {
                bail!("engine is not running");
            }
            return Ok(format!("'{id}' is already playing"));
        }

        // Bring the theme's own layers in alongside the crossfade.
        let crossfade = self.engine.config().crossfade_secs;
        for layer in catalog.layer_ids() {
            let target = layer_volumes.get(layer).copied().unwrap_or(0.0);
            self.engine.ramp_layer_volume(layer.as_str(), target, crossfade);
        }

        self.snapshot.active_theme = Some(id.clone());
        self.snapshot.active_custom = None;
        info!("Theme '{id}' selected");
        Ok(format!("crossfading to '{}'", theme.name))
    }

    fn set_main_volume(&mut self, volume: f32) -> Result<String> {
        let active = self.active_theme()?;
        self.engine.set_main_volume(volume, Some(active.as_str()));
        match self.active_custom_mut() {
            Some(custom) => custom.main_volume = volume,
            None => self.snapshot.set_main_volume(&active, volume),
        }
        Ok(format!("'{active}' volume {:.0}%", volume * 100.0))
    }

    fn set_layer_volume(&mut self, id: &AssetId, volume: f32) -> Result<String> {
        if !self.engine.catalog().is_layer(id.as_str()) {
            bail!("unknown layer '{id}'");
        }
        let active = self.active_theme()?;
        self.engine.set_layer_volume(id.as_str(), volume);
        match self.active_custom_mut() {
            Some(custom) => {
                if !custom.layers.contains(id) {
                    custom.layers.push(id.clone());
                }
                custom.layer_volumes.insert(id.clone(), volume);
            }
            None => self.snapshot.set_layer_volume(&active, id, volume),
        }
        Ok(format!("'{id}' volume {:.0}%", volume * 100.0))
    }

    fn reset(&mut self, theme: &AssetId, main_volume: f32, layers: &[(AssetId, Option<f32>)]) -> Result<String> {
        let default_volume = self.engine.config().default_layer_volume;
        let ids: Vec<AssetId> = layers.iter().map(|(id, _)| id.clone()).collect();
        let volumes: VolumeMap = layers
            .iter()
            .filter_map(|(id, volume)| volume.map(|v| (id.clone(), v)))
            .collect();

        if !self
            .engine
            .reset_and_play_theme(theme.as_str(), &ids, main_volume, &volumes)
        {
            bail!("cannot reset to '{theme}'");
        }

        self.snapshot.active_theme = Some(theme.clone());
        self.snapshot.active_custom = None;
        self.snapshot.set_main_volume(theme, main_volume);
        for id in ids.iter().filter(|id| self.engine.catalog().is_layer(id.as_str())) {
            let volume = volumes.get(id).copied().unwrap_or(default_volume);
            self.snapshot.set_layer_volume(theme, id, volume);
        }
        Ok(format!("resetting to '{theme}'"))
    }

    fn apply_custom(&mut self, id: &AssetId) -> Result<String> {
        let custom = self
            .snapshot
            .custom_theme(id.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("no custom theme '{id}'"))?;

        if !self.engine.reset_and_play_theme(
            custom.base_theme.as_str(),
            &custom.layers,
            custom.main_volume,
            &custom.layer_volumes,
        ) {
            bail!("cannot apply '{id}': base theme '{}' unavailable", custom.base_theme);
        }

        self.snapshot.active_theme = Some(custom.base_theme.clone());
        self.snapshot.active_custom = Some(custom.id.clone());
        Ok(format!("applying '{}'", custom.name))
    }

    fn save_custom(&mut self, id: AssetId, name: String) -> Result<String> {
        let mix = self.engine.current_mix();
        let base = mix
            .active_theme
            .clone()
            .ok_or_else(|| anyhow!("no theme is active"))?;

        let layer_volumes: VolumeMap = self
            .engine
            .catalog()
            .layer_ids()
            .filter_map(|layer| {
                mix.volume(layer.as_str())
                    .filter(|v| *v > 0.0)
                    .map(|v| (layer.clone(), v))
            })
            .collect();

        let custom = CustomTheme {
            id: id.clone(),
            name,
            main_volume: mix.volume(base.as_str()).unwrap_or(0.0),
            base_theme: base,
            layers: layer_volumes.keys().cloned().collect(),
            layer_volumes,
        };
        let reply = format!("saved '{}' ({} layers)", custom.name, custom.layers.len());
        self.snapshot.upsert_custom_theme(custom);
        self.snapshot.active_custom = Some(id);
        Ok(reply)
    }

    fn list_custom(&self) -> String {
        if self.snapshot.custom_themes.is_empty() {
            return "no custom themes".to_string();
        }
        let mut out = String::new();
        for custom in &self.snapshot.custom_themes {
            let marker = if self.snapshot.active_custom.as_ref() == Some(&custom.id) {
                "*"
            } else {
                " "
            };
            let _ = writeln!(
                out,
                "{marker} {} ({}) on '{}', {} layers",
                custom.id,
                custom.name,
                custom.base_theme,
                custom.layers.len()
            );
        }
        out.trim_end().to_string()
    }

    fn describe_status(&self) -> String {
        let status = self.engine.status();
        format!(
            "state={:?} initialized={} loading={} muted={} reset={:?}",
            status.engine_state, status.initialized, status.loading, status.muted, status.reset_phase
        )
    }

    fn describe_mix(&self) -> String {
        let mix = self.engine.current_mix();
        let mut out = format!(
            "active: {}{}",
            mix.active_theme.as_ref().map_or("none", AssetId::as_str),
            if mix.muted { " (muted)" } else { "" }
        );
        for (id, volume) in &mix.volumes {
            let _ = write!(out, "\n  {id:<16} {:>3.0}%", volume * 100.0);
        }
        out
    }
}

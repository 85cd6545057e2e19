//! The mix engine: one control surface over the session, layer loops and theme streams.
//!
//! Control calls are synchronous and cheap. They take a short lock on the engine core,
//! mutate gain automation on the session and return. The only async entry point is
//! [`MixEngine::initialize`], which loads buffers and waits for theme streams to start.
//!
//! A reset ([`MixEngine::reset_and_play_theme`]) is a two-phase transition:
//! 1. FadingOut: the master ramps to silence.
//! 2. At the barrier every gain is reassigned instantly while nothing is audible, the new
//!    theme becomes active, and the master fades back in (FadingIn).
//!
//! The barrier runs as a timer continuation tagged with a generation number, so a newer
//! reset supersedes an older one that has not reached its barrier yet. The timer runs on
//! the host clock while the fade runs on the session clock, so the barrier waits for the
//! session to reach the end of the fade, up to one extra fade-out length.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use murmur_core::{AssetId, Catalog, InitialMix, VolumeMap};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, OutputMode};
use crate::gain::GainParam;
use crate::loader::BufferLoader;
use crate::looper::{LoopTiming, LoopingPlayer};
use crate::output::{probe_default_rate, DeviceOutput};
use crate::session::{AudioSession, EngineState, NodeId};
use crate::themes::ThemeStreamManager;

/// Progress of [`MixEngine::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitState {
    #[default]
    NotInitialized,
    Loading,
    Ready,
}

/// Where a reset transition stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetPhase {
    #[default]
    Idle,
    FadingOut,
    FadingIn,
}

/// Read-only engine status for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub initialized: bool,
    pub loading: bool,
    pub muted: bool,
    pub engine_state: EngineState,
    pub reset_phase: ResetPhase,
}

/// The logical mix: active theme and the gain every unit is heading to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CurrentMix {
    pub active_theme: Option<AssetId>,
    pub volumes: VolumeMap,
    pub muted: bool,
}

impl CurrentMix {
    pub fn volume(&self, id: &str) -> Option<f32> {
        self.volumes.get(id).copied()
    }
}

struct LayerUnit {
    node: NodeId,
    player: LoopingPlayer,
}

struct PendingReset {
    generation: u64,
    theme: AssetId,
    main_volume: f32,
    /// Gains for the listed layers; every other layer goes silent.
    layers: VolumeMap,
    /// Session frame at which the fade-out reaches silence.
    silent_frame: u64,
}

#[derive(Default)]
struct EngineCore {
    init: InitState,
    closed: bool,
    muted: bool,
    session: Option<Arc<AudioSession>>,
    output: Option<DeviceOutput>,
    themes: Option<ThemeStreamManager>,
    layers: BTreeMap<AssetId, LayerUnit>,
    reset_generation: u64,
    reset_phase: ResetPhase,
    pending_reset: Option<PendingReset>,
}

impl EngineCore {
    /// Session and theme manager, once initialization has built them.
    fn ready(&mut self) -> Option<(Arc<AudioSession>, &mut ThemeStreamManager)> {
        if self.closed || self.init != InitState::Ready {
            return None;
        }
        let session = self.session.clone()?;
        self.themes.as_mut().map(|themes| (session, themes))
    }

    fn ramp_master(&self, target: f32, duration: f64) {
        if let Some(session) = &self.session {
            session.with_gain(NodeId::MASTER, |gain, now| gain.ramp_to(target, duration, now));
        }
    }

    fn current_reset_phase(&self) -> ResetPhase {
        match (self.reset_phase, &self.session) {
            (ResetPhase::FadingIn, Some(session)) => {
                let now = session.current_time();
                let ramping = session
                    .gain(NodeId::MASTER)
                    .is_some_and(|gain| gain.is_ramping(now));
                if ramping {
                    ResetPhase::FadingIn
                } else {
                    ResetPhase::Idle
                }
            }
            (phase, _) => phase,
        }
    }
}

/// Ambient mix engine.
///
/// Cloning is cheap and every clone controls the same engine.
#[derive(Clone)]
pub struct MixEngine {
    catalog: Arc<Catalog>,
    config: Arc<EngineConfig>,
    core: Arc<Mutex<EngineCore>>,
}

impl MixEngine {
    pub fn new(catalog: Catalog, config: EngineConfig) -> Self {
        Self {
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            core: Arc::new(Mutex::new(EngineCore::default())),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The session, once initialization has created it.
    pub fn session(&self) -> Option<Arc<AudioSession>> {
        self.core.lock().session.clone()
    }

    /// Build the session, load every layer, start every stream and fade the master in.
    ///
    /// Only the first call does anything. Returns false if the engine was already loading,
    /// ready or closed, or was closed while loading.
    pub async fn initialize(&self, mix: InitialMix) -> bool {
        {
            let mut core = self.core.lock();
            if core.closed || core.init != InitState::NotInitialized {
                debug!("Initialize ignored in state {:?}", core.init);
                return false;
            }
            core.init = InitState::Loading;
        }
        info!(
            "Initializing mix engine: {} themes, {} layers",
            self.catalog.themes().len(),
            self.catalog.layers().len()
        );

        let session = self.open_session().await;
        let loader = BufferLoader::new(session.sample_rate(), self.config.silent_buffer_secs);
        let buffers = loader.load_all(self.catalog.layers()).await;

        let wait_streams = {
            let mut core = self.core.lock();
            if core.closed {
                return false;
            }

            let timing = LoopTiming::from_config(&self.config, &session);
            for layer in self.catalog.layers() {
                let Some(node) = session.create_node(mix.volume(layer.id.as_str())) else {
                    continue;
                };
                let buffer = buffers
                    .get(&layer.id)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(loader.silent_buffer()));
                let player = LoopingPlayer::new(layer.id.clone(), Arc::clone(&session), node, buffer, timing);
                player.start();
                core.layers.insert(layer.id.clone(), LayerUnit { node, player });
            }

            let mut themes = ThemeStreamManager::new(Arc::clone(&session), self.config.crossfade_secs);
            for theme in self.catalog.themes() {
                themes.add_theme(theme, mix.volume(theme.id.as_str()));
            }
            if let Some(active) = &mix.active_theme {
                if !themes.set_active(active.as_str()) {
                    warn!("Initial theme '{active}' is not in the catalog");
                }
            }
            let wait = themes.wait_all_started(self.config.stream_start_timeout());
            core.themes = Some(themes);
            wait
        };

        wait_streams.await;

        let mut core = self.core.lock();
        if core.closed {
            return false;
        }
        if !core.muted {
            let duration = self.config.crossfade_secs;
            session.with_gain(NodeId::MASTER, |gain, now| gain.ramp_from(0.0, 1.0, duration, now));
        }
        core.init = InitState::Ready;
        info!("Mix engine ready");
        true
    }

    /// Create the session with the master silent, plus the device output if configured.
    ///
    /// Device probing and startup block, so they run on the blocking pool.
    async fn open_session(&self) -> Arc<AudioSession> {
        let fallback_rate = self.config.sample_rate;
        let sample_rate = match self.config.output {
            OutputMode::Device => tokio::task::spawn_blocking(probe_default_rate)
                .await
                .ok()
                .flatten()
                .unwrap_or(fallback_rate),
            OutputMode::Offline => fallback_rate,
        };
        let session = Arc::new(AudioSession::new(sample_rate));
        session.with_gain(NodeId::MASTER, |gain, _| gain.set_immediate(0.0));

        let output = match self.config.output {
            OutputMode::Device => {
                let device_session = Arc::clone(&session);
                match tokio::task::spawn_blocking(move || DeviceOutput::start(device_session)).await {
                    Ok(Ok(output)) => Some(output),
                    Ok(Err(e)) => {
                        warn!("Continuing without audio output: {e}");
                        None
                    }
                    Err(e) => {
                        warn!("Audio output startup task failed: {e}");
                        None
                    }
                }
            }
            OutputMode::Offline => None,
        };
        session.resume();

        let mut core = self.core.lock();
        if core.closed {
            // Closed while opening: nothing else will tear this down.
            session.close();
            drop(core);
            drop(output);
            return session;
        }
        core.session = Some(Arc::clone(&session));
        core.output = output;
        session
    }

    /// Crossfade to another theme. No-op for the active theme or an unknown id.
    pub fn select_theme(&self, theme_id: &str, target_volume: f32) -> bool {
        let mut core = self.core.lock();
        let Some((_, themes)) = core.ready() else {
            return false;
        };
        themes.select_theme(theme_id, target_volume)
    }

    /// Ramp a layer's gain over the default ramp duration.
    pub fn set_layer_volume(&self, layer_id: &str, volume: f32) -> bool {
        self.ramp_layer_volume(layer_id, volume, self.config.volume_ramp_secs)
    }

    pub fn ramp_layer_volume(&self, layer_id: &str, volume: f32, duration: f64) -> bool {
        let core = self.core.lock();
        if core.closed || core.init != InitState::Ready {
            return false;
        }
        let (Some(session), Some(unit)) = (&core.session, core.layers.get(layer_id)) else {
            warn!("Cannot set volume of unknown layer '{layer_id}'");
            return false;
        };
        session
            .with_gain(unit.node, |gain, now| gain.ramp_to(volume, duration, now))
            .is_some()
    }

    /// Ramp a theme's gain over the default ramp duration. `None` means the active theme.
    pub fn set_main_volume(&self, volume: f32, theme_id: Option<&str>) -> bool {
        self.ramp_main_volume(volume, self.config.volume_ramp_secs, theme_id)
    }

    pub fn ramp_main_volume(&self, volume: f32, duration: f64, theme_id: Option<&str>) -> bool {
        let mut core = self.core.lock();
        let Some((_, themes)) = core.ready() else {
            return false;
        };
        let target = match theme_id {
            Some(id) => AssetId::from(id),
            None => match themes.active_theme() {
                Some(active) => active.clone(),
                None => return false,
            },
        };
        themes.set_volume(target.as_str(), volume, duration)
    }

    /// Flip the master between silent and full over half the crossfade.
    ///
    /// Per-unit gains are untouched. Returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        let mut core = self.core.lock();
        if core.closed {
            return core.muted;
        }
        core.muted = !core.muted;
        let muted = core.muted;

        // While loading or fading out, the pending master fade reads the flag instead.
        let deferred = core.init != InitState::Ready || core.reset_phase == ResetPhase::FadingOut;
        if !deferred {
            // A mute ramp replaces any reset fade-in still running.
            core.reset_phase = ResetPhase::Idle;
            core.ramp_master(if muted { 0.0 } else { 1.0 }, self.config.mute_ramp_secs());
        }
        info!("Master {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    /// Fade out, reassign every gain while silent, then fade back in on `theme_id`.
    ///
    /// Listed layers get their volume from `layer_volumes`, or the configured default; every
    /// other layer and theme goes silent. Unknown themes and layers are ignored. While muted
    /// the master still fades out, but stays silent after the barrier.
    pub fn reset_and_play_theme(
        &self,
        theme_id: &str,
        layer_ids: &[AssetId],
        main_volume: f32,
        layer_volumes: &VolumeMap,
    ) -> bool {
        let generation = {
            let mut core = self.core.lock();
            let Some((session, themes)) = core.ready() else {
                return false;
            };
            if !themes.contains(theme_id) {
                warn!("Cannot reset to unknown theme '{theme_id}'");
                return false;
            }

            let layers: VolumeMap = layer_ids
                .iter()
                .filter(|id| core.layers.contains_key(id.as_str()))
                .map(|id| {
                    let volume = layer_volumes
                        .get(id)
                        .copied()
                        .unwrap_or(self.config.default_layer_volume);
                    (id.clone(), volume)
                })
                .collect();

            let fade_out = self.config.reset_fade_out_secs;
            core.reset_generation += 1;
            let generation = core.reset_generation;
            core.pending_reset = Some(PendingReset {
                generation,
                theme: AssetId::from(theme_id),
                main_volume,
                layers,
                silent_frame: session.current_frame() + session.frames_for(fade_out),
            });
            core.reset_phase = ResetPhase::FadingOut;
            // Even when muted: a mute ramp may still be on its way down.
            core.ramp_master(0.0, fade_out);
            generation
        };
        info!("Reset to '{theme_id}' scheduled (generation {generation})");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = self.clone();
                let delay = self.config.reset_fade_out();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(remaining) = engine.complete_reset(generation, false) {
                        tokio::time::sleep(remaining).await;
                        engine.complete_reset(generation, true);
                    }
                });
            }
            Err(_) => {
                warn!("No async runtime; applying reset without waiting for the fade-out");
                self.complete_reset(generation, true);
            }
        }
        true
    }

    /// The reset barrier. Stale generations do nothing.
    ///
    /// Unless `force` is set, returns how much longer to wait when the session clock has
    /// not yet reached the end of the fade-out.
    fn complete_reset(&self, generation: u64, force: bool) -> Option<Duration> {
        let mut core = self.core.lock();
        let Some(pending) = core.pending_reset.as_ref().filter(|p| p.generation == generation) else {
            debug!("Reset generation {generation} superseded");
            return None;
        };
        if !force {
            if let Some(session) = &core.session {
                let now = session.current_frame();
                if now < pending.silent_frame {
                    let remaining = session.time_of(pending.silent_frame - now);
                    debug!("Reset generation {generation} waiting {remaining:.3}s for the session clock");
                    return Some(Duration::from_secs_f64(remaining));
                }
            }
        }
        let reset = core.pending_reset.take()?;
        let muted = core.muted;

        let Some((session, themes)) = core.ready() else {
            return None;
        };
        let theme_ids: Vec<AssetId> = themes.theme_ids().cloned().collect();
        for id in &theme_ids {
            let volume = if *id == reset.theme { reset.main_volume } else { 0.0 };
            themes.set_immediate(id.as_str(), volume);
        }
        themes.set_active(reset.theme.as_str());

        for (id, unit) in &core.layers {
            let volume = reset.layers.get(id).copied().unwrap_or(0.0);
            session.with_gain(unit.node, |gain, _| gain.set_immediate(volume));
        }

        if muted {
            session.with_gain(NodeId::MASTER, |gain, _| gain.set_immediate(0.0));
            core.reset_phase = ResetPhase::Idle;
        } else {
            let duration = self.config.reset_fade_in_secs;
            session.with_gain(NodeId::MASTER, |gain, now| gain.ramp_from(0.0, 1.0, duration, now));
            core.reset_phase = ResetPhase::FadingIn;
        }
        info!("Reset applied: '{}' active (generation {generation})", reset.theme);
        None
    }

    /// Stop everything and close the session. Idempotent, and safe before or during
    /// initialization.
    pub fn cleanup(&self) {
        let output = {
            let mut core = self.core.lock();
            if core.closed {
                return;
            }
            core.closed = true;
            core.pending_reset = None;
            core.reset_generation += 1;
            core.reset_phase = ResetPhase::Idle;

            for unit in core.layers.values() {
                unit.player.stop();
            }
            core.layers.clear();
            if let Some(themes) = core.themes.as_mut() {
                themes.release_all();
            }
            core.themes = None;
            if let Some(session) = &core.session {
                session.close();
            }
            core.output.take()
        };

        if let Some(mut output) = output {
            output.stop();
        }
        info!("Mix engine cleaned up");
    }

    /// Host lifecycle: pause the session clock.
    pub fn suspend(&self) -> bool {
        self.session().is_some_and(|s| s.suspend())
    }

    /// Host lifecycle: restart the session clock.
    pub fn resume(&self) -> bool {
        self.session().is_some_and(|s| s.resume())
    }

    pub fn status(&self) -> EngineStatus {
        let core = self.core.lock();
        let engine_state = if core.closed {
            EngineState::Closed
        } else {
            core.session
                .as_ref()
                .map_or(EngineState::Suspended, |s| s.state())
        };
        EngineStatus {
            initialized: !core.closed && core.init == InitState::Ready,
            loading: !core.closed && core.init == InitState::Loading,
            muted: core.muted,
            engine_state,
            reset_phase: core.current_reset_phase(),
        }
    }

    /// Active theme and gain targets, with a pending reset's targets already applied.
    pub fn current_mix(&self) -> CurrentMix {
        let core = self.core.lock();
        let mut mix = CurrentMix {
            muted: core.muted,
            ..CurrentMix::default()
        };
        let (Some(session), Some(themes)) = (&core.session, &core.themes) else {
            return mix;
        };

        mix.active_theme = themes.active_theme().cloned();
        for id in themes.theme_ids() {
            if let Some(target) = themes.gain_target(id.as_str()) {
                mix.volumes.insert(id.clone(), target);
            }
        }
        for (id, unit) in &core.layers {
            if let Some(gain) = session.gain(unit.node) {
                mix.volumes.insert(id.clone(), gain.target());
            }
        }

        if let Some(reset) = &core.pending_reset {
            for (id, volume) in &mut mix.volumes {
                *volume = if *id == reset.theme {
                    reset.main_volume
                } else {
                    reset.layers.get(id).copied().unwrap_or(0.0)
                };
            }
            mix.active_theme = Some(reset.theme.clone());
        }
        mix
    }

    /// Gain automation of a theme or layer unit.
    pub fn unit_gain(&self, id: &str) -> Option<GainParam> {
        let core = self.core.lock();
        let session = core.session.as_ref()?;
        let node = core
            .layers
            .get(id)
            .map(|unit| unit.node)
            .or_else(|| core.themes.as_ref().and_then(|themes| themes.node(id)))?;
        session.gain(node)
    }

    /// Recent loop segment starts of a layer, for inspection.
    pub fn layer_segment_starts(&self, layer_id: &str) -> Vec<u64> {
        self.core
            .lock()
            .layers
            .get(layer_id)
            .map(|unit| unit.player.recent_starts())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MixEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixEngine")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

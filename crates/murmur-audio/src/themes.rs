//! Theme streams and crossfading between them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use murmur_core::{AssetId, Theme};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::session::{AudioSession, NodeId};
use crate::stream::{StreamStatus, ThemeStream};

/// Owns one stream and gain node per theme and tracks which theme is active.
pub struct ThemeStreamManager {
    session: Arc<AudioSession>,
    crossfade_secs: f64,
    streams: BTreeMap<AssetId, Arc<ThemeStream>>,
    active: Option<AssetId>,
}

impl ThemeStreamManager {
    pub fn new(session: Arc<AudioSession>, crossfade_secs: f64) -> Self {
        Self {
            session,
            crossfade_secs,
            streams: BTreeMap::new(),
            active: None,
        }
    }

    /// Create the theme's gain node and start its stream worker.
    ///
    /// Returns false if the theme already has a stream or the session is closed.
    pub fn add_theme(&mut self, theme: &Theme, initial_gain: f32) -> bool {
        if self.streams.contains_key(&theme.id) {
            return false;
        }
        let Some(node) = self.session.create_node(initial_gain) else {
            return false;
        };
        let stream = ThemeStream::spawn(theme, &self.session, node);
        self.streams.insert(theme.id.clone(), Arc::new(stream));
        true
    }

    /// Wait, in parallel, for every stream to produce audio or fail.
    ///
    /// Returns how many streams started within `timeout`.
    pub fn wait_all_started(&self, timeout: Duration) -> impl std::future::Future<Output = usize> + Send + 'static {
        let streams: Vec<_> = self.streams.values().cloned().collect();
        async move {
            let mut tasks = JoinSet::new();
            for stream in streams {
                tasks.spawn(async move {
                    let result = stream.wait_started(timeout).await;
                    if let Err(e) = &result {
                        warn!("Theme '{}' not started: {e}", stream.id());
                    }
                    result.is_ok()
                });
            }

            let mut started = 0;
            while let Some(joined) = tasks.join_next().await {
                if matches!(joined, Ok(true)) {
                    started += 1;
                }
            }
            info!("{started} theme stream(s) started");
            started
        }
    }

    pub fn active_theme(&self) -> Option<&AssetId> {
        self.active.as_ref()
    }

    /// Mark a theme active without touching any gain.
    pub fn set_active(&mut self, id: &str) -> bool {
        let Some((key, _)) = self.streams.get_key_value(id) else {
            return false;
        };
        self.active = Some(key.clone());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<NodeId> {
        self.streams.get(id).map(|s| s.node())
    }

    pub fn status(&self, id: &str) -> Option<StreamStatus> {
        self.streams.get(id).map(|s| s.status())
    }

    pub fn theme_ids(&self) -> impl Iterator<Item = &AssetId> {
        self.streams.keys()
    }

    /// Crossfade from the active theme to `id`.
    ///
    /// Selecting the active theme, or an unknown one, schedules nothing and returns false.
    pub fn select_theme(&mut self, id: &str, target_volume: f32) -> bool {
        if self.active.as_ref().map(AssetId::as_str) == Some(id) {
            debug!("Theme '{id}' already active");
            return false;
        }
        let Some(node) = self.node(id) else {
            warn!("Cannot select unknown theme '{id}'");
            return false;
        };

        let duration = self.crossfade_secs;
        if let Some(previous) = self.active.as_ref().map(AssetId::as_str).and_then(|a| self.node(a)) {
            self.session
                .with_gain(previous, |gain, now| gain.ramp_to(0.0, duration, now));
        }
        self.session
            .with_gain(node, |gain, now| gain.ramp_from(0.0, target_volume, duration, now));

        info!(
            "Crossfading {} -> {id} over {duration}s",
            self.active.as_ref().map(AssetId::as_str).unwrap_or("nothing")
        );
        self.set_active(id)
    }

    /// Ramp one theme's gain.
    pub fn set_volume(&self, id: &str, volume: f32, duration: f64) -> bool {
        self.node(id)
            .and_then(|node| {
                self.session
                    .with_gain(node, |gain, now| gain.ramp_to(volume, duration, now))
            })
            .is_some()
    }

    /// Jump one theme's gain, dropping any ramp in flight.
    pub fn set_immediate(&self, id: &str, volume: f32) -> bool {
        self.node(id)
            .and_then(|node| self.session.with_gain(node, |gain, _| gain.set_immediate(volume)))
            .is_some()
    }

    /// The gain a theme is heading to.
    pub fn gain_target(&self, id: &str) -> Option<f32> {
        self.node(id)
            .and_then(|node| self.session.gain(node))
            .map(|gain| gain.target())
    }

    /// Stop every stream and forget them.
    pub fn release_all(&mut self) {
        for stream in self.streams.values() {
            stream.release(&self.session);
            self.session.remove_node(stream.node());
        }
        if !self.streams.is_empty() {
            debug!("Released {} theme stream(s)", self.streams.len());
        }
        self.streams.clear();
        self.active = None;
    }
}

impl std::fmt::Debug for ThemeStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThemeStreamManager")
            .field("themes", &self.streams.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;

    fn manager() -> ThemeStreamManager {
        let session = Arc::new(AudioSession::new(1000));
        session.resume();
        let mut manager = ThemeStreamManager::new(session, 3.5);
        // Missing files: streams fail, gains still work.
        manager.add_theme(&Theme::new("a", "A", "/nonexistent/a.mp3"), 0.0);
        manager.add_theme(&Theme::new("b", "B", "/nonexistent/b.mp3"), 0.0);
        manager
    }

    #[tokio::test]
    async fn test_crossfade_ramps_both_gains() {
        let mut manager = manager();
        manager.set_active("a");
        manager.set_immediate("a", 0.6);

        assert!(manager.select_theme("b", 0.8));
        assert_eq!(manager.active_theme().map(AssetId::as_str), Some("b"));

        let a = manager.session.gain(manager.node("a").unwrap()).unwrap();
        let b = manager.session.gain(manager.node("b").unwrap()).unwrap();
        let ramp_a = a.ramp().unwrap();
        let ramp_b = b.ramp().unwrap();
        assert!((ramp_a.start_value - 0.6).abs() < 1e-6);
        assert!(ramp_a.end_value.abs() < 1e-6);
        assert!(ramp_b.start_value.abs() < 1e-6);
        assert!((ramp_b.end_value - 0.8).abs() < 1e-6);
        assert!((ramp_b.end_time - ramp_b.start_time - 3.5).abs() < 1e-9);
        manager.release_all();
    }

    #[tokio::test]
    async fn test_selecting_active_theme_is_noop() {
        let mut manager = manager();
        manager.select_theme("a", 0.5);
        let node = manager.node("a").unwrap();
        let before = manager.session.gain(node).unwrap().revision();

        assert!(!manager.select_theme("a", 0.9));
        assert_eq!(manager.session.gain(node).unwrap().revision(), before);
        assert!(!manager.select_theme("nope", 0.9));
        manager.release_all();
    }

    #[tokio::test]
    async fn test_failed_streams_are_counted() {
        let mut manager = manager();
        let started = manager.wait_all_started(Duration::from_secs(5)).await;
        assert_eq!(started, 0);
        assert_eq!(manager.status("a"), Some(StreamStatus::Failed));
        manager.release_all();
        assert!(manager.active_theme().is_none());
        assert!(!manager.contains("a"));
    }
}

//! Gapless looping of decoded layer buffers.
//!
//! A [`LoopingPlayer`] is a lookahead metronome: every wake-up it queues one-shot voices
//! for each segment whose start falls inside the schedule-ahead window, then advances the
//! next start by `buffer length - overlap`. Starts are kept as absolute frames on the
//! session clock, so consecutive segments are spaced exactly.
//!
//! Voices are never stopped individually. [`LoopingPlayer::stop`] only halts scheduling;
//! segments already queued play out on their own.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use murmur_core::AssetId;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffer::DecodedBuffer;
use crate::config::EngineConfig;
use crate::session::{AudioSession, NodeId};

/// Recent segment starts kept for inspection.
const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    #[default]
    Idle,
    Scheduling,
}

/// Scheduler timing, in frames of the session clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTiming {
    pub ahead_frames: u64,
    pub overlap_frames: u64,
    pub tick: Duration,
}

impl LoopTiming {
    pub fn from_config(config: &EngineConfig, session: &AudioSession) -> Self {
        Self {
            ahead_frames: session.frames_for(config.schedule_ahead_secs),
            overlap_frames: session.frames_for(config.loop_overlap_secs),
            tick: config.loop_tick(),
        }
    }
}

/// Segment starts due in the window `[.., now + ahead)` and the next start after them.
///
/// Segments whose whole span already lies before `now` are skipped, keeping the start grid
/// aligned. A zero `step` plans nothing.
pub fn plan_segments(next: u64, now: u64, ahead: u64, step: u64) -> (Vec<u64>, u64) {
    if step == 0 {
        return (Vec::new(), next);
    }

    let mut next = next;
    if next + step <= now {
        next += (now - next) / step * step;
    }

    let horizon = now + ahead;
    let mut starts = Vec::new();
    while next < horizon {
        starts.push(next);
        next += step;
    }
    (starts, next)
}

struct LoopState {
    phase: LoopPhase,
    next_start: u64,
    history: VecDeque<u64>,
    cancel: Option<CancellationToken>,
}

struct Shared {
    id: AssetId,
    session: Arc<AudioSession>,
    node: NodeId,
    buffer: Arc<DecodedBuffer>,
    timing: LoopTiming,
    state: Mutex<LoopState>,
}

impl Shared {
    fn step(&self) -> u64 {
        (self.buffer.frames() as u64).saturating_sub(self.timing.overlap_frames)
    }

    fn tick(&self) -> usize {
        let mut state = self.state.lock();
        if state.phase != LoopPhase::Scheduling {
            return 0;
        }

        let now = self.session.current_frame();
        let (starts, next) = plan_segments(state.next_start, now, self.timing.ahead_frames, self.step());
        state.next_start = next;

        for start in &starts {
            if !self
                .session
                .schedule_buffer(self.node, Arc::clone(&self.buffer), *start)
            {
                break;
            }
            if state.history.len() == HISTORY_LEN {
                state.history.pop_front();
            }
            state.history.push_back(*start);
        }

        if !starts.is_empty() {
            trace!("'{}' queued {} segment(s), next at frame {}", self.id, starts.len(), next);
        }
        starts.len()
    }
}

/// Per-layer loop scheduler.
#[derive(Clone)]
pub struct LoopingPlayer {
    shared: Arc<Shared>,
}

impl LoopingPlayer {
    pub fn new(
        id: AssetId,
        session: Arc<AudioSession>,
        node: NodeId,
        buffer: Arc<DecodedBuffer>,
        timing: LoopTiming,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                session,
                node,
                buffer,
                timing,
                state: Mutex::new(LoopState {
                    phase: LoopPhase::Idle,
                    next_start: 0,
                    history: VecDeque::with_capacity(HISTORY_LEN),
                    cancel: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &AssetId {
        &self.shared.id
    }

    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    pub fn phase(&self) -> LoopPhase {
        self.shared.state.lock().phase
    }

    pub fn is_scheduling(&self) -> bool {
        self.phase() == LoopPhase::Scheduling
    }

    /// Frames between consecutive segment starts.
    pub fn step_frames(&self) -> u64 {
        self.shared.step()
    }

    /// Begin looping from the current clock position.
    ///
    /// Returns false, queuing nothing, when already scheduling, when the session is closed,
    /// or when the buffer is no longer than the overlap.
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        let token = {
            let mut state = shared.state.lock();
            if state.phase == LoopPhase::Scheduling || shared.session.is_closed() {
                return false;
            }
            if shared.buffer.frames() as u64 <= shared.timing.overlap_frames {
                warn!(
                    "Not looping '{}': buffer of {} frames is not longer than the {}-frame overlap",
                    shared.id,
                    shared.buffer.frames(),
                    shared.timing.overlap_frames
                );
                return false;
            }

            state.phase = LoopPhase::Scheduling;
            state.next_start = shared.session.current_frame();
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            token
        };

        shared.tick();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_wakeups(Arc::clone(shared), token));
            }
            Err(_) => warn!("No async runtime; '{}' loops only on manual ticks", shared.id),
        }

        debug!("Started loop '{}' (step {} frames)", shared.id, shared.step());
        true
    }

    /// Halt scheduling and cancel the pending wake-up. Returns false if already idle.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.phase == LoopPhase::Idle {
            return false;
        }
        state.phase = LoopPhase::Idle;
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        debug!("Stopped loop '{}'", self.shared.id);
        true
    }

    /// Run one scheduling pass now. Returns the number of segments queued.
    pub fn tick(&self) -> usize {
        self.shared.tick()
    }

    /// Absolute frame of the next segment to be queued.
    pub fn next_start_frame(&self) -> u64 {
        self.shared.state.lock().next_start
    }

    pub fn next_start_time(&self) -> f64 {
        self.shared.session.time_of(self.next_start_frame())
    }

    /// Start frames of the most recently queued segments, oldest first.
    pub fn recent_starts(&self) -> Vec<u64> {
        self.shared.state.lock().history.iter().copied().collect()
    }
}

impl std::fmt::Debug for LoopingPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopingPlayer")
            .field("id", &self.shared.id)
            .field("node", &self.shared.node)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

async fn run_wakeups(shared: Arc<Shared>, cancel_token: CancellationToken) {
    let mut interval = tokio::time::interval(shared.timing.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately and start() already ran that pass.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = interval.tick() => {
                if shared.session.is_closed() {
                    break;
                }
                shared.tick();
            }
        }
    }
    trace!("Wake-ups for '{}' ended", shared.id);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;

    fn setup(buffer_frames: usize) -> (Arc<AudioSession>, LoopingPlayer) {
        let session = Arc::new(AudioSession::new(1000));
        session.resume();
        let node = session.create_node(1.0).unwrap();
        let buffer = Arc::new(DecodedBuffer::new(vec![0.1; buffer_frames * 2], 1000));
        let timing = LoopTiming {
            ahead_frames: 100,
            overlap_frames: 100,
            tick: Duration::from_millis(25),
        };
        let player = LoopingPlayer::new("rain".into(), Arc::clone(&session), node, buffer, timing);
        (session, player)
    }

    #[test]
    fn test_plan_segments_window() {
        let (starts, next) = plan_segments(0, 0, 100, 900);
        assert_eq!(starts, vec![0]);
        assert_eq!(next, 900);

        // Nothing due until the window reaches the next start.
        let (starts, next) = plan_segments(900, 700, 100, 900);
        assert!(starts.is_empty());
        assert_eq!(next, 900);

        let (starts, _) = plan_segments(900, 801, 100, 900);
        assert_eq!(starts, vec![900]);
    }

    #[test]
    fn test_plan_segments_short_step_fills_window() {
        let (starts, next) = plan_segments(0, 0, 100, 30);
        assert_eq!(starts, vec![0, 30, 60, 90]);
        assert_eq!(next, 120);
        assert_eq!(plan_segments(5, 0, 100, 0), (Vec::new(), 5));
    }

    #[test]
    fn test_plan_segments_skips_elapsed_segments() {
        let (starts, next) = plan_segments(0, 2_000, 100, 900);
        // 0 and 900 ended before frame 2000; 1800 is still playing.
        assert_eq!(starts, vec![1800]);
        assert_eq!(next, 2700);
    }

    #[tokio::test]
    async fn test_start_queues_first_segment() {
        let (session, player) = setup(1000);
        assert!(player.start());
        assert!(player.is_scheduling());
        assert_eq!(player.recent_starts(), vec![0]);
        assert_eq!(session.voice_count(player.node()), 1);
        assert!(!player.start());
        assert!(player.stop());
        assert!(!player.stop());
    }

    #[tokio::test]
    async fn test_short_buffer_is_rejected() {
        let (session, player) = setup(100);
        assert!(!player.start());
        assert_eq!(player.phase(), LoopPhase::Idle);
        assert!(player.recent_starts().is_empty());
        assert_eq!(session.voice_count(player.node()), 0);
    }

    #[test]
    fn test_manual_ticks_keep_exact_spacing() {
        let (session, player) = setup(1000);
        assert!(player.start());
        for _ in 0..200 {
            session.render_frames(25);
            player.tick();
        }
        let starts = player.recent_starts();
        assert!(starts.len() >= 5);
        assert!(starts.windows(2).all(|w| w[1] - w[0] == 900));
    }

    #[test]
    fn test_stopped_player_queues_nothing() {
        let (session, player) = setup(1000);
        player.start();
        player.stop();
        session.render_frames(2000);
        assert_eq!(player.tick(), 0);
        assert_eq!(player.recent_starts(), vec![0]);
    }
}

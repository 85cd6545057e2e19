//! The process-wide audio session: sample clock, mixing graph and lifecycle.
//!
//! A session owns a master gain and a set of gain nodes. Each node mixes one-shot buffer
//! voices (loop segments) and attached stream rings (theme audio), scales the result by
//! its [`GainParam`], and feeds the master bus.
//!
//! The clock is the count of frames rendered. It only advances while the session is
//! [`EngineState::Running`], whether frames are pulled by a device callback
//! ([`crate::output`]) or by the host via [`AudioSession::render_frames`].
//!
//! Only the mix engine creates and closes a session; everything else borrows it through
//! an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::buffer::{DecodedBuffer, SharedStreamRing, RING_CHANNELS};
use crate::gain::GainParam;

/// Lifecycle of the audio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    /// Created or suspended by the host; the clock stands still.
    #[default]
    Suspended,
    Running,
    /// Terminal.
    Closed,
}

/// Handle to a gain node in the session graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// The master bus.
    pub const MASTER: Self = Self(0);
}

/// A one-shot playback of a decoded buffer starting at an absolute frame.
struct Voice {
    buffer: Arc<DecodedBuffer>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

struct GainNode {
    gain: GainParam,
    voices: Vec<Voice>,
    streams: Vec<SharedStreamRing>,
}

struct Graph {
    master: GainParam,
    nodes: HashMap<NodeId, GainNode>,
    next_id: u64,
    /// Stereo master bus for the current render pass.
    bus: Vec<f32>,
    /// Stereo output of the node being rendered.
    node_mix: Vec<f32>,
    /// Samples pulled from a stream ring.
    stream_read: Vec<f32>,
}

impl Graph {
    fn gain_mut(&mut self, node: NodeId) -> Option<&mut GainParam> {
        if node == NodeId::MASTER {
            Some(&mut self.master)
        } else {
            self.nodes.get_mut(&node).map(|n| &mut n.gain)
        }
    }

    fn gain(&self, node: NodeId) -> Option<&GainParam> {
        if node == NodeId::MASTER {
            Some(&self.master)
        } else {
            self.nodes.get(&node).map(|n| &n.gain)
        }
    }
}

/// Shared audio context for one mixing session.
pub struct AudioSession {
    sample_rate: u32,
    frame: AtomicU64,
    state: RwLock<EngineState>,
    graph: Mutex<Graph>,
}

impl AudioSession {
    /// Create a suspended session with the master gain at `1.0`.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frame: AtomicU64::new(0),
            state: RwLock::new(EngineState::Suspended),
            graph: Mutex::new(Graph {
                master: GainParam::new(1.0),
                nodes: HashMap::new(),
                next_id: 1,
                bus: Vec::new(),
                node_mix: Vec::new(),
                stream_read: Vec::new(),
            }),
        }
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far.
    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Seconds rendered so far.
    pub fn current_time(&self) -> f64 {
        self.time_of(self.current_frame())
    }

    pub fn time_of(&self, frame: u64) -> f64 {
        frame as f64 / f64::from(self.sample_rate)
    }

    /// Number of frames closest to `secs`.
    pub fn frames_for(&self, secs: f64) -> u64 {
        (secs.max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EngineState::Closed
    }

    /// Start the clock. Returns false if the session was already running or is closed.
    pub fn resume(&self) -> bool {
        self.transition(EngineState::Running)
    }

    /// Stop the clock, as a host does when backgrounding. Returns false if not running.
    pub fn suspend(&self) -> bool {
        self.transition(EngineState::Suspended)
    }

    /// Close the session and drop every node. Returns false if already closed.
    pub fn close(&self) -> bool {
        if !self.transition(EngineState::Closed) {
            return false;
        }
        let mut graph = self.graph.lock();
        let nodes = graph.nodes.len();
        graph.nodes.clear();
        info!("Audio session closed ({nodes} nodes released)");
        true
    }

    fn transition(&self, next: EngineState) -> bool {
        let mut state = self.state.write();
        if *state == EngineState::Closed || *state == next {
            return false;
        }
        debug!("Session state changed: {:?} -> {:?}", *state, next);
        *state = next;
        true
    }

    /// Add a gain node. Returns `None` once the session is closed.
    pub fn create_node(&self, initial_gain: f32) -> Option<NodeId> {
        if self.is_closed() {
            return None;
        }
        let mut graph = self.graph.lock();
        let id = NodeId(graph.next_id);
        graph.next_id += 1;
        graph.nodes.insert(
            id,
            GainNode {
                gain: GainParam::new(initial_gain),
                voices: Vec::new(),
                streams: Vec::new(),
            },
        );
        trace!("Created gain node {id:?}");
        Some(id)
    }

    pub fn remove_node(&self, node: NodeId) -> bool {
        self.graph.lock().nodes.remove(&node).is_some()
    }

    /// Mutate a node's gain with the current clock time.
    ///
    /// The graph stays locked for the duration of `f`; it must not call back into the
    /// session.
    pub fn with_gain<R>(&self, node: NodeId, f: impl FnOnce(&mut GainParam, f64) -> R) -> Option<R> {
        if self.is_closed() {
            return None;
        }
        let now = self.current_time();
        let mut graph = self.graph.lock();
        graph.gain_mut(node).map(|gain| f(gain, now))
    }

    /// Copy of a node's gain parameter.
    pub fn gain(&self, node: NodeId) -> Option<GainParam> {
        self.graph.lock().gain(node).cloned()
    }

    /// Gain value at the current clock time.
    pub fn gain_value(&self, node: NodeId) -> Option<f32> {
        let now = self.current_time();
        self.graph.lock().gain(node).map(|g| g.value_at(now))
    }

    /// Queue a one-shot playback of `buffer` on `node` starting at `start_frame`.
    ///
    /// A start in the past plays from the buffer's beginning on the next render.
    pub fn schedule_buffer(&self, node: NodeId, buffer: Arc<DecodedBuffer>, start_frame: u64) -> bool {
        if self.is_closed() {
            return false;
        }
        let start_frame = start_frame.max(self.current_frame());
        let mut graph = self.graph.lock();
        let Some(target) = graph.nodes.get_mut(&node) else {
            return false;
        };
        target.voices.push(Voice {
            buffer,
            start_frame,
        });
        true
    }

    /// Voices queued or playing on a node.
    pub fn voice_count(&self, node: NodeId) -> usize {
        self.graph.lock().nodes.get(&node).map_or(0, |n| n.voices.len())
    }

    /// Route a stream ring into a node.
    pub fn attach_stream(&self, node: NodeId, ring: SharedStreamRing) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut graph = self.graph.lock();
        let Some(target) = graph.nodes.get_mut(&node) else {
            return false;
        };
        if !target.streams.iter().any(|r| Arc::ptr_eq(r, &ring)) {
            target.streams.push(ring);
        }
        true
    }

    pub fn detach_stream(&self, node: NodeId, ring: &SharedStreamRing) -> bool {
        let mut graph = self.graph.lock();
        let Some(target) = graph.nodes.get_mut(&node) else {
            return false;
        };
        let before = target.streams.len();
        target.streams.retain(|r| !Arc::ptr_eq(r, ring));
        before != target.streams.len()
    }

    /// Render interleaved output with `channels` channels and advance the clock.
    ///
    /// Outputs silence without advancing while the session is not running.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        if self.state() != EngineState::Running {
            out.fill(0.0);
            return;
        }

        let frames = out.len() / channels;
        let base = self.current_frame();
        let rate = f64::from(self.sample_rate);
        let time_of = |frame: u64| frame as f64 / rate;

        let mut graph = self.graph.lock();
        let Graph {
            master,
            nodes,
            bus,
            node_mix,
            stream_read,
            ..
        } = &mut *graph;

        bus.clear();
        bus.resize(frames * RING_CHANNELS, 0.0);

        for node in nodes.values_mut() {
            node_mix.clear();
            node_mix.resize(frames * RING_CHANNELS, 0.0);
            let mut audible = false;

            for voice in &node.voices {
                let end = voice.end_frame();
                if voice.start_frame >= base + frames as u64 || end <= base {
                    continue;
                }
                audible = true;
                let first = voice.start_frame.saturating_sub(base) as usize;
                let last = ((end - base) as usize).min(frames);
                for i in first..last {
                    let (left, right) = voice.buffer.frame((base + i as u64 - voice.start_frame) as usize);
                    node_mix[i * RING_CHANNELS] += left;
                    node_mix[i * RING_CHANNELS + 1] += right;
                }
            }
            node.voices.retain(|v| v.end_frame() > base + frames as u64);

            for ring in &node.streams {
                stream_read.clear();
                stream_read.resize(frames * RING_CHANNELS, 0.0);
                let read = ring.read(stream_read);
                if read > 0 {
                    audible = true;
                    if read < stream_read.len() {
                        ring.record_underrun();
                    }
                }
                for (mixed, sample) in node_mix.iter_mut().zip(&stream_read[..read]) {
                    *mixed += sample;
                }
            }

            if audible {
                for i in 0..frames {
                    let g = node.gain.value_at(time_of(base + i as u64));
                    bus[i * RING_CHANNELS] += node_mix[i * RING_CHANNELS] * g;
                    bus[i * RING_CHANNELS + 1] += node_mix[i * RING_CHANNELS + 1] * g;
                }
            }
            node.gain.settle(time_of(base + frames as u64));
        }

        for i in 0..frames {
            let m = master.value_at(time_of(base + i as u64));
            let left = bus[i * RING_CHANNELS] * m;
            let right = bus[i * RING_CHANNELS + 1] * m;
            let frame = &mut out[i * channels..(i + 1) * channels];
            if channels == 1 {
                frame[0] = (left + right) * 0.5;
            } else {
                frame[0] = left;
                frame[1] = right;
                frame[2..].fill(0.0);
            }
        }
        master.settle(time_of(base + frames as u64));
        drop(graph);

        self.frame.fetch_add(frames as u64, Ordering::AcqRel);
    }

    /// Pull `frames` stereo frames offline.
    pub fn render_frames(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * RING_CHANNELS];
        self.render(&mut out, RING_CHANNELS);
        out
    }

    /// Render and discard audio until the clock reaches `secs` (offline use).
    pub fn advance_to(&self, secs: f64) {
        let target = self.frames_for(secs);
        while self.state() == EngineState::Running && self.current_frame() < target {
            let chunk = (target - self.current_frame()).min(4096) as usize;
            self.render_frames(chunk);
        }
    }
}

impl std::fmt::Debug for AudioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSession")
            .field("sample_rate", &self.sample_rate)
            .field("frame", &self.current_frame())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;
    use crate::buffer::shared_stream_ring;

    fn running(rate: u32) -> AudioSession {
        let session = AudioSession::new(rate);
        session.resume();
        session
    }

    #[test]
    fn test_lifecycle() {
        let session = AudioSession::new(48000);
        assert_eq!(session.state(), EngineState::Suspended);
        assert!(session.resume());
        assert!(!session.resume());
        assert!(session.suspend());
        assert!(session.close());
        assert!(!session.close());
        assert!(!session.resume());
        assert_eq!(session.state(), EngineState::Closed);
        assert!(session.create_node(1.0).is_none());
    }

    #[test]
    fn test_clock_stands_still_while_suspended() {
        let session = AudioSession::new(1000);
        let out = session.render_frames(100);
        assert_eq!(session.current_frame(), 0);
        assert!(out.iter().all(|s| *s == 0.0));

        session.resume();
        session.render_frames(100);
        assert_eq!(session.current_frame(), 100);
        assert!((session.current_time() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_voice_plays_at_scheduled_frame() {
        let session = running(1000);
        let node = session.create_node(1.0).unwrap();
        let buffer = Arc::new(DecodedBuffer::new(vec![0.5; 20], 1000)); // 10 frames
        assert!(session.schedule_buffer(node, buffer, 5));

        let out = session.render_frames(20);
        for frame in 0..20 {
            let expected = if (5..15).contains(&frame) { 0.5 } else { 0.0 };
            assert!((out[frame * 2] - expected).abs() < 1e-6, "frame {frame}");
        }
        assert_eq!(session.voice_count(node), 0);
    }

    #[test]
    fn test_past_start_plays_immediately() {
        let session = running(1000);
        session.render_frames(50);
        let node = session.create_node(1.0).unwrap();
        session.schedule_buffer(node, Arc::new(DecodedBuffer::new(vec![1.0; 4], 1000)), 0);
        let out = session.render_frames(4);
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!(out[4].abs() < 1e-6);
    }

    #[test]
    fn test_gain_and_master_scale_output() {
        let session = running(1000);
        let node = session.create_node(0.5).unwrap();
        session.schedule_buffer(node, Arc::new(DecodedBuffer::new(vec![1.0; 200], 1000)), 0);
        session.with_gain(NodeId::MASTER, |g, _| g.set_immediate(0.5));

        let out = session.render_frames(10);
        assert!((out[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_master_ramp_follows_clock() {
        let session = running(1000);
        session.with_gain(NodeId::MASTER, |g, now| g.ramp_from(0.0, 1.0, 1.0, now));
        session.advance_to(0.5);
        let value = session.gain_value(NodeId::MASTER).unwrap();
        assert!((value - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_stream_ring_is_mixed() {
        let session = running(1000);
        let node = session.create_node(1.0).unwrap();
        let ring = shared_stream_ring(64);
        ring.write(&[0.25; 8]);
        assert!(session.attach_stream(node, ring.clone()));

        let out = session.render_frames(8);
        assert!((out[0] - 0.25).abs() < 1e-6);
        assert!(out[8].abs() < 1e-6);
        assert_eq!(ring.underruns(), 1);

        assert!(session.detach_stream(node, &ring));
    }

    #[test]
    fn test_mono_and_multichannel_output() {
        let session = running(1000);
        let node = session.create_node(1.0).unwrap();
        session.schedule_buffer(node, Arc::new(DecodedBuffer::new(vec![1.0, 0.0, 1.0, 0.0], 1000)), 0);

        let mut mono = [0.0f32; 1];
        session.render(&mut mono, 1);
        assert!((mono[0] - 0.5).abs() < 1e-6);

        let mut quad = [9.0f32; 4];
        session.render(&mut quad, 4);
        assert!((quad[0] - 1.0).abs() < 1e-6);
        assert!(quad[2].abs() < 1e-6 && quad[3].abs() < 1e-6);
    }
}

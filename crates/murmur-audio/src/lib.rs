//! # murmur-audio
//!
//! Ambient mixing engine for Murmur.
//!
//! Features:
//! - Sample-clocked mixing session, rendered by a cpal device or offline
//! - Gapless lookahead looping of decoded layer buffers
//! - Streamed theme playback with crossfades
//! - Click-free gain automation for layers, themes and the master bus

pub mod buffer;
pub mod config;
pub mod decode;
pub mod gain;
pub mod loader;
pub mod looper;
pub mod mixer;
pub mod output;
pub mod resample;
pub mod session;
pub mod stream;
pub mod themes;

pub use config::{EngineConfig, OutputMode};
pub use gain::{GainParam, Ramp};
pub use loader::{BufferLoader, LoadError};
pub use looper::{LoopPhase, LoopingPlayer};
pub use mixer::{CurrentMix, EngineStatus, InitState, MixEngine, ResetPhase};
pub use session::{AudioSession, EngineState, NodeId};
pub use stream::StreamStatus;

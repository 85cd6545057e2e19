//! Sample storage: decoded layer buffers and the theme stream ring.

pub mod decoded;
pub mod ring;

pub use decoded::{to_stereo, DecodedBuffer};
pub use ring::{shared_stream_ring, SharedStreamRing, StreamRing, RING_CHANNELS};

//! Core domain types for Murmur.

pub mod asset;
pub mod catalog;
pub mod common;
pub mod snapshot;

pub use asset::{AssetSource, Layer, SoundAsset, Theme};
pub use catalog::Catalog;
pub use common::*;
pub use snapshot::{CustomTheme, InitialMix, MixSnapshot, DEFAULT_LAYER_VOLUME};

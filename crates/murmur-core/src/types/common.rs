//! Common types shared across the workspace.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a theme or layer asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for AssetId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Gain target per asset id.
///
/// Ordered so serialized snapshots are stable byte-for-byte.
pub type VolumeMap = BTreeMap<AssetId, f32>;

/// Volume level (0.0 to 1.0).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Volume(f32);

impl Volume {
    pub const MIN: Self = Self(0.0);
    pub const MAX: Self = Self(1.0);
    pub const DEFAULT: Self = Self(1.0);

    /// Clamp into `[0, 1]`. NaN and infinities that cannot be clamped map to silence.
    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            return Self::MIN;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub const fn as_f32(&self) -> f32 {
        self.0
    }

    pub fn is_silent(&self) -> bool {
        self.0 <= 0.0
    }

    pub fn as_percentage(&self) -> u8 {
        (self.0 * 100.0).round() as u8
    }

    pub fn from_percentage(percent: u8) -> Self {
        Self::new(f32::from(percent) / 100.0)
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<f32> for Volume {
    fn from(value: f32) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_volume_clamping() {
        assert_eq!(Volume::new(1.5).as_f32(), 1.0);
        assert_eq!(Volume::new(-0.5).as_f32(), 0.0);
        assert_eq!(Volume::new(0.5).as_f32(), 0.5);
        assert_eq!(Volume::new(f32::NAN).as_f32(), 0.0);
        assert_eq!(Volume::new(f32::INFINITY).as_f32(), 1.0);
    }

    #[test]
    fn test_volume_percentage() {
        assert_eq!(Volume::new(0.35).as_percentage(), 35);
        assert_eq!(Volume::from_percentage(200), Volume::MAX);
    }

    #[test]
    fn test_asset_id_lookup_by_str() {
        let mut volumes = VolumeMap::new();
        volumes.insert(AssetId::from("rain"), 0.2);
        assert_eq!(volumes.get("rain"), Some(&0.2));
        assert_eq!(AssetId::from("rain").to_string(), "rain");
    }

    proptest! {
        #[test]
        fn volume_is_always_in_unit_range(value in proptest::num::f32::ANY) {
            let v = Volume::new(value).as_f32();
            prop_assert!((0.0..=1.0).contains(&v));
        }
    }
}

//! # murmur-store
//!
//! Persistence of the mix snapshot (`SQLite` key → JSON).
//!
//! The snapshot is split over a handful of keys so each part can be written on its own:
//! - `activeTheme`: the audible theme id
//! - `mainVolumes`: main volume per theme
//! - `layerVolumes`: layer volumes per theme
//! - `customThemes`: user-built mixes
//! - `customThemeConfig`: which custom mix is applied
//!
//! Writes whose value hashes the same as what is stored are skipped.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use lru::LruCache;
use murmur_core::{AssetId, Error, MixSnapshot, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub const KEY_ACTIVE_THEME: &str = "activeTheme";
pub const KEY_MAIN_VOLUMES: &str = "mainVolumes";
pub const KEY_CUSTOM_THEMES: &str = "customThemes";
pub const KEY_LAYER_VOLUMES: &str = "layerVolumes";
pub const KEY_CUSTOM_THEME_CONFIG: &str = "customThemeConfig";

/// Keys making up a snapshot.
pub const SNAPSHOT_KEYS: [&str; 5] = [
    KEY_ACTIVE_THEME,
    KEY_MAIN_VOLUMES,
    KEY_CUSTOM_THEMES,
    KEY_LAYER_VOLUMES,
    KEY_CUSTOM_THEME_CONFIG,
];

const DB_FILE: &str = "murmur.db";

/// Stored under `customThemeConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct CustomThemeConfig {
    active_custom: Option<AssetId>,
}

/// Key → JSON store for the mix snapshot.
pub struct SnapshotStore {
    db: Arc<Mutex<Connection>>,
    /// Directory holding the database, `None` when in memory.
    data_dir: Option<PathBuf>,
    /// Hot values in front of the database.
    memory_cache: Arc<Mutex<LruCache<String, String>>>,
}

impl SnapshotStore {
    /// Open the store in the platform data directory.
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "murmur", "Murmur")
            .ok_or_else(|| Error::Store("Failed to determine data directory".to_string()))?;
        Self::with_path(project_dirs.data_dir())
    }

    /// Open the store in `data_dir`, creating it if needed.
    pub fn with_path(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::Store(format!("Failed to create data directory: {e}")))?;

        let db = Connection::open(data_dir.join(DB_FILE))
            .map_err(|e| Error::Store(format!("Failed to open database: {e}")))?;
        info!("Snapshot store opened at {}", data_dir.display());
        Self::from_connection(db, Some(data_dir))
    }

    /// A store that lives only as long as the value.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("Failed to open database: {e}")))?;
        Self::from_connection(db, None)
    }

    fn from_connection(db: Connection, data_dir: Option<PathBuf>) -> Result<Self> {
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS snapshot (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                digest TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| Error::Store(format!("Failed to initialize database: {e}")))?;

        // SAFETY: 32 is a non-zero constant
        #[allow(clippy::expect_used)]
        let cache_size = NonZeroUsize::new(32).expect("32 is non-zero");

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            data_dir,
            memory_cache: Arc::new(Mutex::new(LruCache::new(cache_size))),
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    fn digest(value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Raw JSON stored under `key`.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        if let Some(value) = self.memory_cache.lock().get(key) {
            return Some(value.clone());
        }

        let db = self.db.lock();
        let value: Option<String> = db
            .query_row("SELECT value FROM snapshot WHERE key = ?", [key], |row| row.get(0))
            .optional()
            .unwrap_or_else(|e| {
                warn!("Failed to read '{key}': {e}");
                None
            });
        drop(db);

        if let Some(value) = &value {
            self.memory_cache.lock().put(key.to_string(), value.clone());
        }
        value
    }

    /// Store raw JSON under `key`. Returns false when the stored value was identical.
    pub fn set_raw(&self, key: &str, value: &str) -> Result<bool> {
        let digest = Self::digest(value);
        let db = self.db.lock();

        let stored: Option<String> = db
            .query_row("SELECT digest FROM snapshot WHERE key = ?", [key], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Store(format!("Failed to read digest: {e}")))?;
        if stored.as_deref() == Some(digest.as_str()) {
            debug!("'{key}' unchanged, skipping write");
            return Ok(false);
        }

        db.execute(
            "INSERT OR REPLACE INTO snapshot (key, value, digest, updated_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![key, value, digest, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Store(format!("Failed to store '{key}': {e}")))?;
        drop(db);

        self.memory_cache.lock().put(key.to_string(), value.to_string());
        Ok(true)
    }

    /// When `key` was last written.
    pub fn updated_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let db = self.db.lock();
        let stamp: String = db
            .query_row("SELECT updated_at FROM snapshot WHERE key = ?", [key], |row| row.get(0))
            .ok()?;
        DateTime::parse_from_rfc3339(&stamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.memory_cache.lock().pop(key);
        let db = self.db.lock();
        let removed = db
            .execute("DELETE FROM snapshot WHERE key = ?", [key])
            .map_err(|e| Error::Store(format!("Failed to remove '{key}': {e}")))?;
        Ok(removed > 0)
    }

    /// Delete every stored key.
    pub fn clear(&self) -> Result<()> {
        let db = self.db.lock();
        db.execute_batch("DELETE FROM snapshot;")
            .map_err(|e| Error::Store(format!("Failed to clear store: {e}")))?;
        self.memory_cache.lock().clear();
        info!("Snapshot store cleared");
        Ok(())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        let db = self.db.lock();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM snapshot", [], |row| row.get(0))
            .unwrap_or(0);
        usize::try_from(count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode `key`, falling back to the default when it is missing or corrupt.
    fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let Some(raw) = self.get_raw(key) else {
            return T::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring corrupt '{key}': {e}");
            T::default()
        })
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<bool> {
        let json = serde_json::to_string(value)?;
        self.set_raw(key, &json)
    }

    /// Load the snapshot. Missing or corrupt keys come back as defaults.
    pub fn load_snapshot(&self) -> MixSnapshot {
        let config: CustomThemeConfig = self.get_or_default(KEY_CUSTOM_THEME_CONFIG);
        MixSnapshot {
            active_theme: self.get_or_default(KEY_ACTIVE_THEME),
            main_volumes: self.get_or_default(KEY_MAIN_VOLUMES),
            layer_volumes: self.get_or_default(KEY_LAYER_VOLUMES),
            custom_themes: self.get_or_default(KEY_CUSTOM_THEMES),
            active_custom: config.active_custom,
        }
    }

    /// Write every snapshot key. Returns how many keys actually changed.
    pub fn save_snapshot(&self, snapshot: &MixSnapshot) -> Result<usize> {
        let config = CustomThemeConfig {
            active_custom: snapshot.active_custom.clone(),
        };
        let written = [
            self.set_json(KEY_ACTIVE_THEME, &snapshot.active_theme)?,
            self.set_json(KEY_MAIN_VOLUMES, &snapshot.main_volumes)?,
            self.set_json(KEY_LAYER_VOLUMES, &snapshot.layer_volumes)?,
            self.set_json(KEY_CUSTOM_THEMES, &snapshot.custom_themes)?,
            self.set_json(KEY_CUSTOM_THEME_CONFIG, &config)?,
        ]
        .into_iter()
        .filter(|changed| *changed)
        .count();

        if written > 0 {
            debug!("Saved snapshot ({written} key(s) changed)");
        }
        Ok(written)
    }
}

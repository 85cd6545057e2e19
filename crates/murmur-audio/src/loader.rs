//! Fetching and decoding layer assets into [`DecodedBuffer`]s.
//!
//! [`BufferLoader::load`] reports failures as a typed [`LoadError`]. The engine never sees
//! them: it goes through [`BufferLoader::load_or_silent`], which logs the failure and
//! substitutes a silent buffer so a single broken asset degrades to silence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use murmur_core::{AssetId, AssetSource, Layer, SoundAsset};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::buffer::{to_stereo, DecodedBuffer};
use crate::decode::decode_all;
use crate::resample::resample_all;

/// Default timeout for asset requests.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Why an asset could not be turned into a buffer.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Invalid audio source: {0}")]
    Source(String),

    #[error("Fetch failed for {uri}: {message}")]
    Fetch { uri: String, message: String },

    #[error("{uri} responded with HTTP {status}")]
    Status { uri: String, status: u16 },

    #[error("Decode failed for {uri}: {message}")]
    Decode { uri: String, message: String },
}

/// Loads layer assets at the session sample rate and caches them by asset id.
#[derive(Clone)]
pub struct BufferLoader {
    http: reqwest::Client,
    sample_rate: u32,
    silent_secs: f64,
    cache: Arc<RwLock<HashMap<AssetId, Arc<DecodedBuffer>>>>,
}

impl BufferLoader {
    pub fn new(sample_rate: u32, silent_secs: f64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {e}");
                reqwest::Client::new()
            });

        Self {
            http,
            sample_rate,
            silent_secs,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The placeholder used for failed loads.
    pub fn silent_buffer(&self) -> DecodedBuffer {
        DecodedBuffer::silent(self.silent_secs, self.sample_rate)
    }

    /// Cached buffer for an asset, if it has been loaded.
    pub fn get(&self, id: &str) -> Option<Arc<DecodedBuffer>> {
        self.cache.read().get(id).cloned()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Fetch and decode an asset.
    pub async fn load<A: SoundAsset + ?Sized>(&self, asset: &A) -> Result<DecodedBuffer, LoadError> {
        let uri = asset.audio_src().to_string();
        let source = asset
            .source()
            .map_err(|e| LoadError::Source(format!("{uri}: {e}")))?;

        let data = self.fetch(&source, &uri).await?;
        debug!("Fetched {} bytes for '{}'", data.len(), asset.id());

        let hint = source.extension();
        let sample_rate = self.sample_rate;
        let decode_uri = uri.clone();
        tokio::task::spawn_blocking(move || decode_to_session_rate(data, hint.as_deref(), sample_rate, &decode_uri))
            .await
            .map_err(|e| LoadError::Decode {
                uri,
                message: format!("decode task failed: {e}"),
            })?
    }

    async fn fetch(&self, source: &AssetSource, uri: &str) -> Result<Bytes, LoadError> {
        match source {
            AssetSource::Http(url) => {
                let response = self.http.get(url.clone()).send().await.map_err(|e| LoadError::Fetch {
                    uri: uri.to_string(),
                    message: e.to_string(),
                })?;

                let status = response.status();
                if !status.is_success() {
                    return Err(LoadError::Status {
                        uri: uri.to_string(),
                        status: status.as_u16(),
                    });
                }

                response.bytes().await.map_err(|e| LoadError::Fetch {
                    uri: uri.to_string(),
                    message: e.to_string(),
                })
            }
            AssetSource::File(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| LoadError::Fetch {
                    uri: uri.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    /// Load an asset, or a silent placeholder if anything goes wrong. Never fails.
    pub async fn load_or_silent<A: SoundAsset + ?Sized>(&self, asset: &A) -> Arc<DecodedBuffer> {
        if let Some(buffer) = self.get(asset.id().as_str()) {
            return buffer;
        }

        let buffer = match self.load(asset).await {
            Ok(buffer) => {
                debug!(
                    "Loaded '{}': {:.2}s at {} Hz",
                    asset.id(),
                    buffer.duration_secs(),
                    buffer.sample_rate()
                );
                buffer
            }
            Err(e) => {
                warn!("Using silence for '{}': {e}", asset.id());
                self.silent_buffer()
            }
        };

        let buffer = Arc::new(buffer);
        self.cache
            .write()
            .insert(asset.id().clone(), Arc::clone(&buffer));
        buffer
    }

    /// Drop the cached buffer and load the asset again.
    pub async fn reload<A: SoundAsset + ?Sized>(&self, asset: &A) -> Arc<DecodedBuffer> {
        self.cache.write().remove(asset.id().as_str());
        self.load_or_silent(asset).await
    }

    /// Load every layer concurrently and wait for all of them to settle.
    pub async fn load_all(&self, layers: &[Layer]) -> HashMap<AssetId, Arc<DecodedBuffer>> {
        let mut tasks = JoinSet::new();
        for layer in layers {
            let loader = self.clone();
            let layer = layer.clone();
            tasks.spawn(async move {
                let buffer = loader.load_or_silent(&layer).await;
                (layer.id, buffer)
            });
        }

        let mut buffers = HashMap::with_capacity(layers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, buffer)) => {
                    buffers.insert(id, buffer);
                }
                Err(e) => warn!("Layer load task failed: {e}"),
            }
        }

        // A panicked task still leaves its layer playable.
        for layer in layers {
            buffers
                .entry(layer.id.clone())
                .or_insert_with(|| Arc::new(self.silent_buffer()));
        }

        info!("Loaded {} layer buffers", buffers.len());
        buffers
    }
}

fn decode_to_session_rate(
    data: Bytes,
    hint: Option<&str>,
    sample_rate: u32,
    uri: &str,
) -> Result<DecodedBuffer, LoadError> {
    let decode_err = |e: murmur_core::Error| LoadError::Decode {
        uri: uri.to_string(),
        message: e.to_string(),
    };

    let decoded = decode_all(data, hint).map_err(decode_err)?;
    let stereo = to_stereo(&decoded.samples, decoded.channels);
    let samples = resample_all(&stereo, decoded.sample_rate, sample_rate, 2).map_err(decode_err)?;
    Ok(DecodedBuffer::new(samples, sample_rate))
}

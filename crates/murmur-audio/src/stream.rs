//! Streamed theme playback.
//!
//! Each theme gets a worker thread that fetches the asset once, then decodes it packet by
//! packet into a [`StreamRing`](crate::buffer::StreamRing) attached to the theme's gain
//! node. At end of stream the decoder restarts from the cached bytes, so the theme loops
//! forever and is never held fully decoded in memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use murmur_core::{AssetId, AssetSource, Error, HttpError, Result, SoundAsset, Theme};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{shared_stream_ring, to_stereo, SharedStreamRing, RING_CHANNELS};
use crate::decode::AudioDecoder;
use crate::resample::Resampler;
use crate::session::{AudioSession, NodeId};

/// Ring capacity in seconds of audio.
const RING_SECONDS: usize = 1;

/// How long the worker sleeps when the ring is full.
const FULL_BACKOFF: Duration = Duration::from_millis(5);

/// Fetch attempts before a transient network failure counts as a start failure.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where a theme stream is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamStatus {
    /// Fetching or decoding the first audio.
    #[default]
    Pending,
    Playing,
    /// Fetch or decode failed; the theme stays silent.
    Failed,
    Stopped,
}

/// One theme's streaming source.
pub struct ThemeStream {
    id: AssetId,
    node: NodeId,
    ring: SharedStreamRing,
    status: Arc<RwLock<StreamStatus>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

impl ThemeStream {
    /// Attach a ring to `node` and spawn the worker that fills it.
    pub fn spawn(theme: &Theme, session: &Arc<AudioSession>, node: NodeId) -> Self {
        let sample_rate = session.sample_rate();
        let ring = shared_stream_ring(sample_rate as usize * RING_SECONDS);
        session.attach_stream(node, Arc::clone(&ring));

        let status = Arc::new(RwLock::new(StreamStatus::Pending));
        let stop = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = oneshot::channel();

        let worker = StreamWorker {
            id: theme.id.clone(),
            source: theme.source(),
            ring: Arc::clone(&ring),
            status: Arc::clone(&status),
            stop: Arc::clone(&stop),
            sample_rate,
            started: Some(started_tx),
        };

        let handle = std::thread::Builder::new()
            .name(format!("theme-stream-{}", theme.id))
            .spawn(move || worker.run());

        let worker = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn stream worker for '{}': {e}", theme.id);
                *status.write() = StreamStatus::Failed;
                None
            }
        };

        Self {
            id: theme.id.clone(),
            node,
            ring,
            status,
            stop,
            worker: Mutex::new(worker),
            started: Mutex::new(Some(started_rx)),
        }
    }

    pub fn id(&self) -> &AssetId {
        &self.id
    }

    pub const fn node(&self) -> NodeId {
        self.node
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.read()
    }

    pub fn ring(&self) -> &SharedStreamRing {
        &self.ring
    }

    /// Wait for the first audio, or the start failure, at most `timeout`.
    ///
    /// Only the first call waits; later calls report the current status.
    pub async fn wait_started(&self, timeout: Duration) -> Result<()> {
        let receiver = self.started.lock().take();
        let Some(receiver) = receiver else {
            return match self.status() {
                StreamStatus::Failed => Err(Error::AudioDecode(format!("Stream '{}' failed", self.id))),
                _ => Ok(()),
            };
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Internal(format!(
                "Stream '{}' did not start within {:?}",
                self.id, timeout
            ))),
        }
    }

    /// Stop the worker and detach from the session. Idempotent.
    pub fn release(&self, session: &AudioSession) {
        self.stop.store(true, Ordering::Release);
        session.detach_stream(self.node, &self.ring);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            // The worker only blocks on the initial fetch; don't wait on it.
            if handle.is_finished() {
                let _ = handle.join();
            }
            self.ring.clear();
            let mut status = self.status.write();
            if *status != StreamStatus::Failed {
                *status = StreamStatus::Stopped;
            }
            debug!("Released theme stream '{}'", self.id);
        }
    }
}

impl std::fmt::Debug for ThemeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThemeStream")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

struct StreamWorker {
    id: AssetId,
    source: Result<AssetSource>,
    ring: SharedStreamRing,
    status: Arc<RwLock<StreamStatus>>,
    stop: Arc<AtomicBool>,
    sample_rate: u32,
    started: Option<oneshot::Sender<Result<()>>>,
}

impl StreamWorker {
    fn run(mut self) {
        if let Err(e) = self.stream() {
            if e.is_fetch_error() {
                warn!("Theme stream '{}' could not be fetched: {e}", self.id);
            } else {
                warn!("Theme stream '{}' failed to start: {e}", self.id);
            }
            *self.status.write() = StreamStatus::Failed;
            if let Some(tx) = self.started.take() {
                let _ = tx.send(Err(e));
            }
            return;
        }
        trace!("Theme stream worker '{}' exiting", self.id);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Fetch the asset, retrying failures that may clear up on their own.
    fn fetch(&self, source: &AssetSource) -> Result<Bytes> {
        let mut attempt = 1;
        loop {
            match fetch_bytes(source) {
                Err(e) if e.is_retryable() && attempt < FETCH_ATTEMPTS && !self.stopped() => {
                    debug!("Fetching theme '{}' failed (attempt {attempt}): {e}", self.id);
                    std::thread::sleep(FETCH_RETRY_DELAY * attempt);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn stream(&mut self) -> Result<()> {
        let source = std::mem::replace(&mut self.source, Err(Error::Cancelled))?;
        let data = self.fetch(&source)?;
        if self.stopped() {
            return Ok(());
        }
        debug!("Theme '{}' fetched {} bytes", self.id, data.len());

        let hint = source.extension();
        let mut decoder = AudioDecoder::from_bytes(data.clone(), hint.as_deref())?;
        let mut resampler = Resampler::new(decoder.sample_rate(), self.sample_rate, RING_CHANNELS)?;
        let mut pending: Vec<f32> = Vec::new();
        let mut decoded_this_pass = false;

        while !self.stopped() {
            if pending.is_empty() {
                match decoder.decode_next()? {
                    Some(packet) => {
                        decoded_this_pass = true;
                        let stereo = to_stereo(&packet, decoder.channels());
                        pending = resampler.process(&stereo)?;
                    }
                    None => {
                        if !decoded_this_pass {
                            return Err(Error::AudioDecode(format!("Theme '{}' has no audio", self.id)));
                        }
                        pending = resampler.flush()?;
                        resampler.reset();
                        decoder = AudioDecoder::from_bytes(data.clone(), hint.as_deref())?;
                        decoded_this_pass = false;
                        trace!("Theme '{}' looped", self.id);
                    }
                }
                continue;
            }

            let written = self.ring.write(&pending);
            pending.drain(..written);

            if written > 0 {
                if let Some(tx) = self.started.take() {
                    *self.status.write() = StreamStatus::Playing;
                    info!("Theme stream '{}' playing", self.id);
                    let _ = tx.send(Ok(()));
                }
            }
            if !pending.is_empty() {
                std::thread::sleep(FULL_BACKOFF);
            }
        }
        Ok(())
    }
}

/// Blocking fetch of a stream asset.
fn fetch_bytes(source: &AssetSource) -> Result<Bytes> {
    match source {
        AssetSource::Http(url) => {
            let mut response = ureq::get(url.as_str())
                .call()
                .map_err(|e| http_error(url.as_str(), e))?;
            let data = response
                .body_mut()
                .with_config()
                .limit(u64::MAX)
                .read_to_vec()
                .map_err(|e| http_error(url.as_str(), e))?;
            Ok(Bytes::from(data))
        }
        AssetSource::File(path) => Ok(Bytes::from(std::fs::read(path)?)),
    }
}

fn http_error(url: &str, error: ureq::Error) -> Error {
    let http = match error {
        ureq::Error::StatusCode(status) => HttpError::StatusError {
            status,
            message: url.to_string(),
        },
        ureq::Error::Timeout(_) => HttpError::Timeout,
        ureq::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => HttpError::Timeout,
        ureq::Error::BadUri(uri) => HttpError::InvalidUrl(uri),
        e @ (ureq::Error::HostNotFound | ureq::Error::ConnectionFailed | ureq::Error::Io(_)) => {
            HttpError::ConnectionFailed(format!("{url}: {e}"))
        }
        other => return Error::Network(format!("{url}: {other}")),
    };
    Error::Http(http)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap for brevity
mod tests {
    use super::*;
    use crate::decode::tests::wav_bytes;

    fn theme_file(dir: &tempfile::TempDir, frames: usize) -> Theme {
        let path = dir.path().join("theme.wav");
        std::fs::write(&path, wav_bytes(&vec![0.5; frames * 2], 1000, 2)).unwrap();
        Theme::new("lofi", "Lo-fi", path.to_string_lossy())
    }

    #[tokio::test]
    async fn test_stream_fills_ring_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        // Shorter than the ring, so filling it requires looping.
        let theme = theme_file(&dir, 300);
        let session = Arc::new(AudioSession::new(1000));
        let node = session.create_node(1.0).unwrap();

        let stream = ThemeStream::spawn(&theme, &session, node);
        stream.wait_started(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.status(), StreamStatus::Playing);

        for _ in 0..200 {
            if stream.ring().free() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stream.ring().available_frames() > 300);

        stream.release(&session);
        assert_eq!(stream.status(), StreamStatus::Stopped);
        stream.release(&session);
    }

    #[test]
    fn test_http_failures_classified() {
        let missing = http_error("http://host/a.mp3", ureq::Error::StatusCode(404));
        assert!(matches!(
            missing,
            Error::Http(HttpError::StatusError { status: 404, .. })
        ));
        assert!(missing.is_fetch_error());
        assert!(!missing.is_retryable());

        let refused = http_error("http://host/a.mp3", ureq::Error::ConnectionFailed);
        assert!(refused.is_retryable());

        let slow = http_error(
            "http://host/a.mp3",
            ureq::Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)),
        );
        assert!(matches!(slow, Error::Http(HttpError::Timeout)));
    }

    #[test]
    fn test_unreachable_host_is_connection_failure() {
        // Bind then drop to get a local port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let source = AssetSource::parse(&format!("http://127.0.0.1:{port}/theme.mp3")).unwrap();

        let err = fetch_bytes(&source).unwrap_err();
        assert!(
            matches!(err, Error::Http(HttpError::ConnectionFailed(_))),
            "got {err:?}"
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_asset_marks_failed() {
        let session = Arc::new(AudioSession::new(1000));
        let node = session.create_node(1.0).unwrap();
        let theme = Theme::new("gone", "Gone", "/nonexistent/theme.mp3");

        let stream = ThemeStream::spawn(&theme, &session, node);
        assert!(stream.wait_started(Duration::from_secs(5)).await.is_err());
        assert_eq!(stream.status(), StreamStatus::Failed);
        assert!(stream.wait_started(Duration::from_secs(1)).await.is_err());

        stream.release(&session);
        assert_eq!(stream.status(), StreamStatus::Failed);
    }
}

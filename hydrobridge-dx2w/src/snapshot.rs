//! Crash-consistent snapshots of the history store.
//!
//! The file is the serialized register → entries map (JSON or CBOR) inside a
//! gzip stream. Saves go to a sibling temp file which is synced and then
//! renamed over the previous snapshot.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hydrobridge_common::Format;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::HistoryConfig;
use crate::connection::stopped;
use crate::error::{Dx2wError, Result};
use crate::history::{HistoryMap, HistoryStore};

/// Saves and restores the history store.
#[derive(Debug, Clone)]
pub struct SnapshotPersister {
    path: PathBuf,
    format: Format,
    interval: Duration,
}

impl SnapshotPersister {
    pub fn new(path: impl Into<PathBuf>, format: Format, interval: Duration) -> Self {
        Self {
            path: path.into(),
            format,
            interval,
        }
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(
            config.snapshot_path(),
            config.format,
            config.snapshot_interval(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Write `history` atomically.
    pub fn write(&self, history: &HistoryMap) -> Result<()> {
        let bytes = hydrobridge_common::encode(history, self.format)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| io_error("create", dir, e))?;
        }

        let tmp = self.temp_path();
        let file = File::create(&tmp).map_err(|e| io_error("create", &tmp, e))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(&bytes)
            .map_err(|e| io_error("write", &tmp, e))?;
        let file = encoder.finish().map_err(|e| io_error("write", &tmp, e))?;
        file.sync_all().map_err(|e| io_error("sync", &tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| io_error("rename", &self.path, e))?;
        Ok(())
    }

    /// Read the snapshot. `Ok(None)` means there is no file (cold start).
    pub fn read(&self) -> Result<Option<HistoryMap>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("open", &self.path, e)),
        };

        let mut bytes = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(|e| io_error("decompress", &self.path, e))?;

        let history = hydrobridge_common::decode_auto(&bytes)?;
        Ok(Some(history))
    }

    /// Save the store's current content.
    pub fn save(&self, store: &HistoryStore) -> Result<()> {
        let history = store.snapshot();
        let registers = history.len();
        self.write(&history)?;
        debug!(path = %self.path.display(), registers, "Saved history snapshot");
        Ok(())
    }

    /// Save without blocking the runtime. Failures are logged, never returned.
    pub async fn save_in_background(&self, store: &HistoryStore) {
        let history = store.snapshot();
        let persister = self.clone();
        let result = tokio::task::spawn_blocking(move || persister.write(&history)).await;

        match result {
            Ok(Ok(())) => debug!(path = %self.path.display(), "Saved history snapshot"),
            Ok(Err(e)) => error!(path = %self.path.display(), error = %e, "Snapshot save failed"),
            Err(e) => error!(path = %self.path.display(), error = %e, "Snapshot task failed"),
        }
    }

    /// Restore the store from disk.
    ///
    /// A missing file is a cold start. An unreadable file is logged and
    /// discarded. Returns whether anything was restored.
    pub fn load(&self, store: &HistoryStore) -> bool {
        match self.read() {
            Ok(Some(history)) => {
                store.restore(history);
                info!(
                    path = %self.path.display(),
                    registers = store.register_count(),
                    entries = store.total_entries(),
                    "Restored history snapshot"
                );
                true
            }
            Ok(None) => {
                info!(path = %self.path.display(), "No history snapshot, starting cold");
                false
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Discarding unreadable history snapshot");
                false
            }
        }
    }

    /// Save every interval until shutdown. The first save happens one interval
    /// after start; the final save at shutdown belongs to the caller.
    pub async fn run(self, store: Arc<HistoryStore>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Snapshot timer started (interval: {}s, path: {})",
            self.interval.as_secs(),
            self.path.display()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.save_in_background(&store).await,
                _ = stopped(&mut shutdown) => break,
            }
        }

        debug!("Snapshot timer stopped");
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> Dx2wError {
    Dx2wError::persistence(format!(
        "failed to {} '{}': {}",
        action,
        path.display(),
        err
    ))
}

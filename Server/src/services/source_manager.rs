use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::get_metrics;
use prometheus::IntGauge;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::transcode::supervisor::{JobState, TranscodeSupervisor};
use crate::types::SourceKey;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to create output directory: {0}")]
    Io(#[from] std::io::Error),
}

/// One participant's live feed within one session: the relay transcoder
/// slot, the packager slot, the output directory they share, and the
/// reconciler watching that directory. Supervisor slots are disjoint per
/// source, so no cross-source locking exists anywhere.
pub struct MediaSource {
    pub key: SourceKey,
    pub relay_url: String,
    pub output_dir: PathBuf,
    pub relay: TranscodeSupervisor,
    pub packager: TranscodeSupervisor,
    reconciler_stop: Mutex<Option<oneshot::Sender<()>>>,
}

/// Job states of both supervisor slots, for the health/status surface.
#[derive(Clone, Debug, Serialize)]
pub struct SourceHealth {
    pub relay: JobState,
    pub packager: JobState,
}

impl MediaSource {
    pub fn set_reconciler_stop(&self, stop_tx: oneshot::Sender<()>) {
        *self.reconciler_stop.lock().unwrap() = Some(stop_tx);
    }

    pub fn stop_reconciler(&self) {
        if let Some(stop_tx) = self.reconciler_stop.lock().unwrap().take() {
            let _ = stop_tx.send(());
        }
    }

    pub fn health(&self) -> SourceHealth {
        SourceHealth {
            relay: self.relay.state(),
            packager: self.packager.state(),
        }
    }
}

/// Result of registering a source: the fresh entry, plus the entry it
/// displaced when the same feed was already publishing (the caller owns
/// tearing the displaced one down before relying on the output directory).
pub struct Created {
    pub source: Arc<MediaSource>,
    pub displaced: Option<Arc<MediaSource>>,
}

/// Registry of all live media sources.
pub struct SourceManager {
    media_root: PathBuf,
    relay_port: u16,
    stop_grace: Duration,
    sources: RwLock<HashMap<SourceKey, Arc<MediaSource>>>,
    active_sources: IntGauge,
}

impl SourceManager {
    #[instrument(skip_all)]
    pub fn new(media_root: PathBuf, relay_port: u16, stop_grace: Duration) -> Self {
        let active_sources = get_metrics()
            .get_or_create_gauge("active_media_sources", "Number of live media sources")
            .unwrap();
        Self {
            media_root,
            relay_port,
            stop_grace,
            sources: RwLock::new(HashMap::new()),
            active_sources,
        }
    }

    /// Multicast relay address derived from the participant id; each feed
    /// gets its own group so relays never cross.
    fn relay_url(&self, key: &SourceKey) -> String {
        let hi = (key.participant_id >> 8) & 0xff;
        let lo = key.participant_id & 0xff;
        format!(
            "udp://239.128.{}.{}:{}?pkt_size=1316",
            hi, lo, self.relay_port
        )
    }

    /// Register a source for `key`, creating its output directory. An
    /// existing entry for the same key is returned as displaced.
    #[instrument(skip_all, fields(source = %key))]
    pub fn create(&self, key: SourceKey) -> Result<Created, SourceError> {
        let output_dir = self
            .media_root
            .join(key.session_id.to_string())
            .join(key.participant_id.to_string())
            .join("dash");
        std::fs::create_dir_all(&output_dir)?;

        let source = Arc::new(MediaSource {
            key,
            relay_url: self.relay_url(&key),
            output_dir,
            relay: TranscodeSupervisor::new(format!("relay {}", key), self.stop_grace),
            packager: TranscodeSupervisor::new(format!("packager {}", key), self.stop_grace),
            reconciler_stop: Mutex::new(None),
        });

        let displaced = {
            let mut sources = self.sources.write().unwrap();
            let displaced = sources.insert(key, source.clone());
            self.active_sources.set(sources.len() as i64);
            displaced
        };
        debug!("media source registered");

        Ok(Created { source, displaced })
    }

    /// Deregister `source`, but only if it is still the current entry for
    /// its key; a displaced source must not remove its replacement.
    pub fn remove(&self, source: &Arc<MediaSource>) -> bool {
        let mut sources = self.sources.write().unwrap();
        match sources.get(&source.key) {
            Some(current) if Arc::ptr_eq(current, source) => {
                sources.remove(&source.key);
                self.active_sources.set(sources.len() as i64);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &SourceKey) -> Option<Arc<MediaSource>> {
        self.sources.read().unwrap().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<MediaSource>> {
        self.sources.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &std::path::Path) -> SourceManager {
        SourceManager::new(root.to_path_buf(), 4055, Duration::from_millis(100))
    }

    #[test]
    fn create_builds_the_output_directory() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let key = SourceKey { session_id: 7, participant_id: 3 };

        let created = manager.create(key).unwrap();
        assert!(created.displaced.is_none());
        assert!(created.source.output_dir.ends_with("7/3/dash"));
        assert!(created.source.output_dir.is_dir());
        assert_eq!(
            created.source.relay_url,
            "udp://239.128.0.3:4055?pkt_size=1316"
        );
    }

    #[test]
    fn republishing_displaces_the_old_source() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let key = SourceKey { session_id: 7, participant_id: 3 };

        let first = manager.create(key).unwrap();
        let second = manager.create(key).unwrap();
        let displaced = second.displaced.expect("first source displaced");
        assert!(Arc::ptr_eq(&displaced, &first.source));

        // The displaced entry cannot remove its replacement.
        assert!(!manager.remove(&displaced));
        assert!(manager.get(&key).is_some());
        assert!(manager.remove(&second.source));
        assert!(manager.get(&key).is_none());
    }
}

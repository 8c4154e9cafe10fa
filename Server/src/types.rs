use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::SessionDirectory;
use crate::services::session_hub::SessionHub;
use crate::services::source_manager::SourceManager;

pub type SessionId = u64;
pub type ParticipantId = u64;

/// Key of one participant's live feed within one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SourceKey {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.participant_id)
    }
}

/// What happens to an inbound frame when the ingest buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OverflowPolicy {
    /// Drop the oldest buffered frame to make room.
    DropOldest,
    /// Hold the producer until the transcoder catches up.
    Block,
}

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

#[derive(Clone, Debug)]
pub struct PackagingConfig {
    pub segment_duration_secs: u32,
    pub window_size: u32,
    pub extra_window_size: u32,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub max_idle_cycles: u32,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub ffmpeg: String,
    pub media_root: PathBuf,
    pub relay_port: u16,
    pub stop_grace: Duration,
    pub ingest: IngestConfig,
    pub packaging: PackagingConfig,
    pub reconciler: ReconcilerConfig,
}

/// The service singletons every connection handler needs.
#[derive(Clone)]
pub struct Services {
    pub sources: Arc<SourceManager>,
    pub hub: Arc<SessionHub>,
    pub directory: Arc<dyn SessionDirectory>,
    pub config: Arc<RelayConfig>,
}

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub socket_io: Arc<socketioxide::SocketIo>,
}

/// Payload of the signaling `subscribe` event.
#[derive(Deserialize, Debug)]
pub struct SubscribeRequest {
    pub token: String,
}

/// Payload of the ingest `publish` event.
#[derive(Deserialize, Debug)]
pub struct PublishRequest {
    pub token: String,
}

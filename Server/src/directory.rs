// directory.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::types::{ParticipantId, SessionId};

/// An authenticated participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown identity")]
    UnknownIdentity,
    #[error("participant {0} is not in an active session")]
    NoActiveSession(ParticipantId),
}

/// The external user/session store. Persistence and token issuance live
/// outside the relay core; this is the seam the core calls through before
/// it allocates any resource for a connection.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, DirectoryError>;
    async fn session_of(&self, identity: &Identity) -> Result<SessionId, DirectoryError>;
}

#[derive(Clone, Debug, Deserialize)]
pub struct RosterEntry {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    #[serde(default)]
    pub display_name: String,
}

/// Roster-backed directory for deployments without the account service,
/// and for tests. Tokens map to participants; participants map to their
/// active session.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<String, RosterEntry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `{token: {participant_id, session_id, display_name}}` roster.
    pub fn from_roster_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        let entries: HashMap<String, RosterEntry> = serde_json::from_str(&data)?;
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn insert(&self, token: impl Into<String>, entry: RosterEntry) {
        self.entries.write().unwrap().insert(token.into(), entry);
    }
}

#[async_trait]
impl SessionDirectory for InMemoryDirectory {
    async fn authenticate(&self, token: &str) -> Result<Identity, DirectoryError> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(token).ok_or(DirectoryError::UnknownIdentity)?;
        let display_name = if entry.display_name.is_empty() {
            format!("participant-{}", entry.participant_id)
        } else {
            entry.display_name.clone()
        };
        Ok(Identity {
            participant_id: entry.participant_id,
            display_name,
        })
    }

    async fn session_of(&self, identity: &Identity) -> Result<SessionId, DirectoryError> {
        let entries = self.entries.read().unwrap();
        entries
            .values()
            .find(|entry| entry.participant_id == identity.participant_id)
            .map(|entry| entry.session_id)
            .ok_or(DirectoryError::NoActiveSession(identity.participant_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roster_tokens_resolve_to_sessions() {
        let directory = InMemoryDirectory::new();
        directory.insert(
            "tok-a",
            RosterEntry {
                participant_id: 3,
                session_id: 7,
                display_name: String::new(),
            },
        );

        let identity = directory.authenticate("tok-a").await.unwrap();
        assert_eq!(identity.participant_id, 3);
        assert_eq!(identity.display_name, "participant-3");
        assert_eq!(directory.session_of(&identity).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn unknown_tokens_are_rejected() {
        let directory = InMemoryDirectory::new();
        assert!(matches!(
            directory.authenticate("nope").await,
            Err(DirectoryError::UnknownIdentity)
        ));
    }
}

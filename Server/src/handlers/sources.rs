// handlers/sources.rs

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use crate::services::source_manager::SourceHealth;
use crate::types::AppState;

#[derive(Serialize, Debug)]
pub struct SourceSummary {
    pub session_id: u64,
    pub participant_id: u64,
    pub output_dir: String,
    pub health: SourceHealth,
}

#[derive(Serialize, Debug)]
pub struct SourcesResponse {
    pub sources: Vec<SourceSummary>,
}

/// Live media sources with the job states of their supervisor slots.
#[instrument(skip_all)]
pub async fn list_sources(State(app_state): State<AppState>) -> Json<SourcesResponse> {
    let sources = app_state
        .services
        .sources
        .list()
        .into_iter()
        .map(|source| SourceSummary {
            session_id: source.key.session_id,
            participant_id: source.key.participant_id,
            output_dir: source.output_dir.display().to_string(),
            health: source.health(),
        })
        .collect();

    Json(SourcesResponse { sources })
}

#[derive(Serialize, Debug)]
pub struct SessionSummary {
    pub session_id: u64,
    pub subscribers: usize,
}

#[derive(Serialize, Debug)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

/// Sessions currently holding signaling subscribers.
#[instrument(skip_all)]
pub async fn list_sessions(State(app_state): State<AppState>) -> Json<SessionsResponse> {
    let mut sessions: Vec<SessionSummary> = app_state
        .services
        .hub
        .sessions()
        .into_iter()
        .map(|(session_id, subscribers)| SessionSummary {
            session_id,
            subscribers,
        })
        .collect();
    sessions.sort_by_key(|session| session.session_id);

    Json(SessionsResponse { sessions })
}

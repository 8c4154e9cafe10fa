// handlers/dash.rs

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, instrument};

use crate::types::AppState;

fn content_type_for(file_name: &str) -> Option<&'static str> {
    if file_name.ends_with(".mpd") {
        Some("application/dash+xml")
    } else if file_name.ends_with(".m4s") {
        Some("video/iso.segment")
    } else if file_name.ends_with(".mp4") {
        Some("video/mp4")
    } else {
        None
    }
}

/// Serve one file the packaging pipeline produced for a `(session,
/// participant)` feed.
#[instrument(skip_all)]
pub async fn fetch_dash_file(
    State(app_state): State<AppState>,
    Path((session_id, participant_id, file_name)): Path<(u64, u64, String)>,
) -> Response {
    if file_name.contains('/') || file_name.contains("..") {
        error!("rejected dash path {}", file_name);
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(content_type) = content_type_for(&file_name) else {
        error!("unsupported dash file requested: {}", file_name);
        return StatusCode::BAD_REQUEST.into_response();
    };

    let path = app_state
        .services
        .config
        .media_root
        .join(session_id.to_string())
        .join(participant_id.to_string())
        .join("dash")
        .join(&file_name);

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("serving {}", path.display());
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", content_type)
                .body(axum::body::Body::from(bytes))
                .unwrap()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

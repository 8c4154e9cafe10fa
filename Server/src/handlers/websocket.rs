// handlers/websocket.rs

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use socketioxide::extract::{Data, SocketRef};
use socketioxide::layer::SocketIoLayer;
use socketioxide::socket::DisconnectReason;
use socketioxide::SocketIo;
use tracing::{debug, info, instrument, warn};

use crate::ingest::publish;
use crate::services::session_hub::{SignalSink, SinkClosed};
use crate::types::{AppState, ParticipantId, Services, SessionId, SubscribeRequest};

#[derive(Serialize, Debug)]
pub struct SimpleSocket {
    pub id: String,
    pub connected: bool,
}

#[derive(Serialize, Debug)]
pub struct SimpleSocketsResponse {
    pub sockets: Vec<SimpleSocket>,
}

#[instrument(skip_all)]
pub async fn list_sockets(
    State(app_state): State<AppState>,
) -> Json<SimpleSocketsResponse> {
    let sockets = app_state.socket_io.sockets().unwrap_or_default();
    let mut simple_sockets = Vec::<SimpleSocket>::new();
    for socket in sockets {
        simple_sockets.push(SimpleSocket {
            id: socket.id.to_string(),
            connected: socket.connected(),
        });
    }
    Json(SimpleSocketsResponse {
        sockets: simple_sockets,
    })
}

/// Hub-facing wrapper around a socket.io connection.
pub struct SocketIoSink {
    id: String,
    socket: SocketRef,
}

impl SocketIoSink {
    pub fn new(socket: SocketRef) -> Self {
        Self {
            id: socket.id.to_string(),
            socket,
        }
    }
}

impl SignalSink for SocketIoSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_text(&self, message: &str) -> Result<(), SinkClosed> {
        self.socket.emit("session", message).map_err(|_| SinkClosed)
    }

    fn close(&self) {
        self.socket.clone().disconnect().ok();
    }
}

/// Build the socket.io layer with both namespaces: `/` for session
/// signaling, `/publish` for media ingest.
#[instrument(skip_all)]
pub fn create_websocket_router_layer(services: Services) -> (SocketIoLayer, SocketIo) {
    let (layer, io) = SocketIo::new_layer();

    {
        let services = services.clone();
        io.ns("/", move |socket: SocketRef| {
            let services = services.clone();
            async move {
                setup_signaling(socket, services);
            }
        });
    }

    {
        let services = services.clone();
        io.ns("/publish", move |socket: SocketRef| {
            let services = services.clone();
            async move {
                publish::setup(socket, services);
            }
        });
    }

    let io_clone = io.clone();
    (layer, io_clone)
}

/// Wire one signaling socket. Clients authenticate with `subscribe` and
/// from then on receive the session's broadcast text on `session` events.
fn setup_signaling(socket: SocketRef, services: Services) {
    debug!("signaling socket {} connected", socket.id);

    let membership: Arc<Mutex<Option<(SessionId, ParticipantId)>>> = Arc::new(Mutex::new(None));

    {
        let membership = membership.clone();
        let services = services.clone();
        socket.on("subscribe", move |s: SocketRef, Data::<SubscribeRequest>(request)| {
            let membership = membership.clone();
            let services = services.clone();
            async move {
                if membership.lock().unwrap().is_some() {
                    let _ = s.emit("error", "already subscribed");
                    return;
                }

                // Validation failures are rejected before the connection is
                // registered anywhere.
                let identity = match services.directory.authenticate(&request.token).await {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!("subscribe rejected: {}", e);
                        let _ = s.emit("error", &e.to_string());
                        s.clone().disconnect().ok();
                        return;
                    }
                };
                let session_id = match services.directory.session_of(&identity).await {
                    Ok(session_id) => session_id,
                    Err(e) => {
                        warn!("subscribe rejected: {}", e);
                        let _ = s.emit("error", &e.to_string());
                        s.clone().disconnect().ok();
                        return;
                    }
                };

                let sink = Arc::new(SocketIoSink::new(s.clone()));
                services.hub.subscribe(session_id, sink);
                *membership.lock().unwrap() = Some((session_id, identity.participant_id));

                services.hub.broadcast(
                    session_id,
                    &format!("{} joined session {}", identity.display_name, session_id),
                );
            }
        });
    }

    {
        socket.on_disconnect(move |socket: SocketRef, reason: DisconnectReason| {
            let membership = membership.clone();
            let services = services.clone();
            async move {
                info!("signaling socket {} disconnected: {:?}", socket.id, reason);
                let entry = membership.lock().unwrap().take();
                if let Some((session_id, participant_id)) = entry {
                    services.hub.unsubscribe(&socket.id.to_string());
                    services.hub.broadcast(
                        session_id,
                        &format!("participant {} left session {}", participant_id, session_id),
                    );
                }
            }
        });
    }
}

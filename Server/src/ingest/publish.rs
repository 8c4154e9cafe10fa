// ingest/publish.rs

use std::sync::{Arc, Mutex};

use socketioxide::extract::{Data, SocketRef};
use socketioxide::socket::DisconnectReason;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::directory::DirectoryError;
use crate::ingest::{run_writer, FrameQueue};
use crate::packaging;
use crate::reconcile::{self, ReconcilerEvent};
use crate::services::source_manager::{MediaSource, SourceError};
use crate::transcode::args;
use crate::transcode::supervisor::SupervisorError;
use crate::types::{PublishRequest, Services, SourceKey};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("transcoder unavailable: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("transcoder exposed no input pipe")]
    NoInput,
}

struct ActivePublish {
    source: Arc<MediaSource>,
    queue: Arc<FrameQueue>,
    writer: JoinHandle<()>,
    packaging: JoinHandle<()>,
}

type PublishSlot = Arc<Mutex<Option<ActivePublish>>>;

/// Wire one `/publish` socket: authentication-gated `publish`, binary
/// `frame` events into the bounded ingest buffer, and disconnect as the
/// sole teardown trigger for the media source. Reconnects arrive here as
/// brand-new sockets and create brand-new sources.
pub fn setup(socket: SocketRef, services: Services) {
    let slot: PublishSlot = Arc::new(Mutex::new(None));

    {
        let slot = slot.clone();
        let services = services.clone();
        socket.on("publish", move |s: SocketRef, Data::<PublishRequest>(request)| {
            let slot = slot.clone();
            let services = services.clone();
            async move {
                if slot.lock().unwrap().is_some() {
                    let _ = s.emit("error", "already publishing");
                    return;
                }
                if let Err(e) = start_publish(&s, &services, &request.token, &slot).await {
                    warn!("publish rejected: {}", e);
                    let _ = s.emit("error", &e.to_string());
                    s.clone().disconnect().ok();
                }
            }
        });
    }

    {
        let slot = slot.clone();
        socket.on("frame", move |_s: SocketRef, Data::<Vec<u8>>(frame)| {
            let slot = slot.clone();
            async move {
                let queue = slot
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|active| active.queue.clone());
                if let Some(queue) = queue {
                    queue.push(frame).await;
                }
            }
        });
    }

    {
        let services = services.clone();
        socket.on_disconnect(move |socket: SocketRef, reason: DisconnectReason| {
            let slot = slot.clone();
            let services = services.clone();
            async move {
                info!("publish socket {} disconnected: {:?}", socket.id, reason);
                let active = slot.lock().unwrap().take();
                if let Some(active) = active {
                    teardown(&services, active).await;
                }
            }
        });
    }
}

/// Entry point of the ingest pipeline. Identity and session membership are
/// validated before any resource is allocated; a validation failure leaves
/// no trace behind.
#[instrument(skip_all)]
async fn start_publish(
    socket: &SocketRef,
    services: &Services,
    token: &str,
    slot: &PublishSlot,
) -> Result<(), PublishError> {
    let identity = services.directory.authenticate(token).await?;
    let session_id = services.directory.session_of(&identity).await?;
    let key = SourceKey {
        session_id,
        participant_id: identity.participant_id,
    };

    let created = services.sources.create(key)?;
    let source = created.source.clone();

    if let Some(displaced) = created.displaced {
        // A stale publisher for the same feed; stop its children before the
        // new ones touch the shared output directory.
        info!("displacing previous publisher for {}", key);
        displaced.stop_reconciler();
        displaced.relay.stop().await;
        displaced.packager.stop().await;
    }

    match start_pipeline(socket, services, &source, key, slot).await {
        Ok(()) => {
            services.hub.broadcast(
                session_id,
                &format!("stream started for {}", identity.display_name),
            );
            Ok(())
        }
        Err(e) => {
            // Nothing half-started survives a failed publish.
            source.relay.stop().await;
            source.packager.stop().await;
            source.stop_reconciler();
            services.sources.remove(&source);
            Err(e)
        }
    }
}

async fn start_pipeline(
    socket: &SocketRef,
    services: &Services,
    source: &Arc<MediaSource>,
    key: SourceKey,
    slot: &PublishSlot,
) -> Result<(), PublishError> {
    let config = &services.config;

    // Relay transcoder: connection frames in, MPEG-TS out on the relay
    // address the packager consumes.
    let relay_spec = args::relay_args(&config.ffmpeg, &source.relay_url);
    source.relay.start(relay_spec).await?;
    let stdin = source
        .relay
        .take_stdin()
        .await
        .ok_or(PublishError::NoInput)?;

    let queue = Arc::new(FrameQueue::new(&config.ingest));
    let writer = tokio::spawn(run_writer(key, queue.clone(), stdin));

    // Packaging pipeline, owned by this publish.
    let packaging_task = {
        let source = source.clone();
        let hub = services.hub.clone();
        let ffmpeg = config.ffmpeg.clone();
        let packaging_config = config.packaging.clone();
        tokio::spawn(async move {
            let label = format!("participant {}", key.participant_id);
            let relay_url = source.relay_url.clone();
            let output_dir = source.output_dir.clone();
            let spec_config = packaging_config.clone();
            let spec =
                move || args::package_args(&ffmpeg, &relay_url, &output_dir, &spec_config);
            packaging::run(
                &source.packager,
                &hub,
                key.session_id,
                &label,
                &packaging_config,
                spec,
            )
            .await;
        })
    };

    // Reconciler for the output directory. Its retirement is an observable
    // event, surfaced to the session like any other lifecycle milestone.
    let (stop_tx, stop_rx) = oneshot::channel();
    source.set_reconciler_stop(stop_tx);
    {
        let hub = services.hub.clone();
        let events: reconcile::EventCallback = Arc::new(move |event| {
            if let ReconcilerEvent::Stopped { idle_cycles } = event {
                hub.broadcast(
                    key.session_id,
                    &format!(
                        "segment cleanup for participant {} retired after {} idle cycles",
                        key.participant_id, idle_cycles
                    ),
                );
            }
        });
        tokio::spawn(reconcile::run(
            source.output_dir.clone(),
            config.reconciler.clone(),
            stop_rx,
            events,
        ));
    }

    // Relay-exit watcher: a dying transcoder tears the source down through
    // the normal disconnect path even while the socket stays open.
    {
        let mut relay_state = source.relay.subscribe();
        let socket = socket.clone();
        tokio::spawn(async move {
            loop {
                if relay_state.borrow_and_update().is_terminal() {
                    break;
                }
                if relay_state.changed().await.is_err() {
                    break;
                }
            }
            info!("relay job for {} ended, closing publish socket", key);
            socket.disconnect().ok();
        });
    }

    *slot.lock().unwrap() = Some(ActivePublish {
        source: source.clone(),
        queue,
        writer,
        packaging: packaging_task,
    });

    Ok(())
}

/// Runs once per publish: drain the writer (closing the transcoder's input),
/// stop both children, retire the reconciler, deregister and announce.
#[instrument(skip_all, fields(source = %active.source.key))]
async fn teardown(services: &Services, active: ActivePublish) {
    let ActivePublish { source, queue, writer, packaging } = active;

    queue.close();
    if let Err(e) = writer.await {
        warn!("ingest writer task failed: {}", e);
    }

    source.relay.stop().await;
    source.packager.stop().await;
    if let Err(e) = packaging.await {
        warn!("packaging task failed: {}", e);
    }
    source.stop_reconciler();

    if services.sources.remove(&source) {
        services.hub.broadcast(
            source.key.session_id,
            &format!("stream ended for participant {}", source.key.participant_id),
        );
    }
}

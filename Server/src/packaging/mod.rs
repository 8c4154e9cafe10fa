use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::services::session_hub::SessionHub;
use crate::transcode::args::CommandSpec;
use crate::transcode::supervisor::{JobState, TranscodeSupervisor};
use crate::types::{PackagingConfig, SessionId};

/// How a packaging run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagingOutcome {
    /// The packager exited cleanly (its input ended).
    Completed,
    /// The owner stopped the source while packaging was live.
    Stopped,
    /// Every attempt failed; the terminal failure was broadcast.
    Failed,
    /// The slot was already packaging; re-invocation is refused, never
    /// tolerated.
    Refused,
}

/// Drive one packaging process for a media source. Child failures are
/// retried a bounded number of times with a fixed backoff; retries and the
/// terminal failure surface as session broadcast text, never as raw child
/// diagnostics.
#[instrument(skip_all, fields(label = %label))]
pub async fn run(
    packager: &TranscodeSupervisor,
    hub: &SessionHub,
    session_id: SessionId,
    label: &str,
    config: &PackagingConfig,
    spec: impl Fn() -> CommandSpec,
) -> PackagingOutcome {
    if packager.is_running() {
        warn!("packaging already running for this source, refusing re-invocation");
        return PackagingOutcome::Refused;
    }

    for attempt in 1..=config.max_attempts.max(1) {
        if packager.stop_requested() {
            info!("packaging stopped by owner");
            return PackagingOutcome::Stopped;
        }

        match packager.start(spec()).await {
            Err(e) => warn!("packaging spawn failed: {}", e),
            Ok(()) => {
                // A stop that raced the start would otherwise leave the
                // fresh child unowned; the flag is sticky, so this check
                // catches every interleaving.
                if packager.stop_requested() {
                    packager.stop().await;
                    info!("packaging stopped by owner");
                    return PackagingOutcome::Stopped;
                }
                match packager.wait_terminal().await {
                    JobState::Exited(0) => {
                        info!("packaging finished");
                        return PackagingOutcome::Completed;
                    }
                    state => {
                        if packager.stop_requested() {
                            info!("packaging stopped by owner");
                            return PackagingOutcome::Stopped;
                        }
                        warn!("packaging attempt {} ended abnormally: {:?}", attempt, state);
                    }
                }
            }
        }

        if attempt < config.max_attempts {
            hub.broadcast(
                session_id,
                &format!(
                    "packaging for {} restarting (attempt {}/{})",
                    label,
                    attempt + 1,
                    config.max_attempts
                ),
            );
            sleep(config.retry_backoff).await;
            if packager.stop_requested() {
                info!("packaging stopped by owner during backoff");
                return PackagingOutcome::Stopped;
            }
        }
    }

    error!("packaging failed after {} attempts", config.max_attempts);
    hub.broadcast(session_id, &format!("packaging for {} failed permanently", label));
    PackagingOutcome::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session_hub::{SignalSink, SinkClosed};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    impl SignalSink for RecordingSink {
        fn id(&self) -> &str {
            "viewer"
        }

        fn send_text(&self, message: &str) -> Result<(), SinkClosed> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }

        fn close(&self) {}
    }

    fn config(max_attempts: u32) -> PackagingConfig {
        PackagingConfig {
            segment_duration_secs: 1,
            window_size: 5,
            extra_window_size: 5,
            max_attempts,
            retry_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_broadcast_text() {
        let packager = TranscodeSupervisor::new("pack", Duration::from_millis(100));
        let hub = SessionHub::new();
        let sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()) });
        hub.subscribe(7, sink.clone());

        let outcome = run(&packager, &hub, 7, "participant 3", &config(2), || {
            CommandSpec::new("sh").args(["-c", "exit 1"])
        })
        .await;

        assert_eq!(outcome, PackagingOutcome::Failed);
        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("restarting (attempt 2/2)"));
        assert!(sent[1].contains("failed permanently"));
    }

    #[tokio::test]
    async fn clean_exit_completes_without_noise() {
        let packager = TranscodeSupervisor::new("pack", Duration::from_millis(100));
        let hub = SessionHub::new();
        let sink = Arc::new(RecordingSink { sent: Mutex::new(Vec::new()) });
        hub.subscribe(7, sink.clone());

        let outcome = run(&packager, &hub, 7, "participant 3", &config(3), || {
            CommandSpec::new("true")
        })
        .await;

        assert_eq!(outcome, PackagingOutcome::Completed);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_slot_refuses_reinvocation() {
        let packager = TranscodeSupervisor::new("pack", Duration::from_millis(100));
        let hub = SessionHub::new();

        // Occupy the slot with a long-lived child.
        packager
            .start(CommandSpec::new("cat").pipe_stdin())
            .await
            .unwrap();

        let outcome = run(&packager, &hub, 7, "participant 3", &config(3), || {
            CommandSpec::new("true")
        })
        .await;
        assert_eq!(outcome, PackagingOutcome::Refused);

        packager.stop().await;
    }
}

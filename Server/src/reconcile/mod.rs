use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dash_manifest::{naming, parse_mpd, timeline};
use metrics::get_metrics;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::types::ReconcilerConfig;

/// Observable outcomes of the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerEvent {
    /// A cycle ran and deleted `deleted` stale segment files.
    Swept { deleted: u64 },
    /// The manifest could not be read or parsed; nothing was touched.
    SkippedCycle,
    /// The loop stopped after the configured run of idle cycles.
    Stopped { idle_cycles: u32 },
}

pub type EventCallback = Arc<dyn Fn(ReconcilerEvent) + Send + Sync>;

/// One reconciliation cycle over `dir`: parse the manifest, expand every
/// representation's timeline into the expected offsets, and delete segment
/// files outside that set. Returns `None` when the manifest could not be
/// read or parsed — the cycle is skipped entirely, nothing is ever deleted
/// on uncertain state.
pub fn sweep_dir(dir: &Path) -> Option<u64> {
    let mpd_path = dir.join(naming::MANIFEST_FILE);
    let xml = match fs::read_to_string(&mpd_path) {
        Ok(xml) => xml,
        Err(e) => {
            debug!("manifest {} not readable, skipping cycle: {}", mpd_path.display(), e);
            return None;
        }
    };
    let manifest = match parse_mpd(&xml) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("manifest {} not parseable, skipping cycle: {}", mpd_path.display(), e);
            return None;
        }
    };

    let mut expected: HashSet<String> = HashSet::new();
    for rep in manifest.representations() {
        for offset in timeline::expected_offsets(&rep.timeline) {
            expected.insert(naming::segment_file_name(&rep.id, offset));
        }
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot list {}, skipping cycle: {}", dir.display(), e);
            return None;
        }
    };

    let mut deleted = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        // Only files following the segment naming convention are candidates;
        // the manifest, init segments and temp files are never touched.
        if naming::parse_segment_file_name(name).is_none() {
            continue;
        }
        if expected.contains(name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                deleted += 1;
                info!("deleted stale segment {}", name);
            }
            Err(e) => {
                // Non-fatal; the cycle continues and the file is retried
                // next tick.
                warn!("failed to delete segment {}: {}", name, e);
            }
        }
    }

    Some(deleted)
}

/// Periodic reconciliation for one output directory. The owner stops it
/// through `stop_rx`; otherwise the loop retires itself after
/// `max_idle_cycles` cycles without a deletion. That self-stop is a
/// resource policy, not a correctness requirement, and is reported through
/// the event callback rather than happening silently.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub async fn run(
    dir: PathBuf,
    config: ReconcilerConfig,
    mut stop_rx: oneshot::Receiver<()>,
    events: EventCallback,
) {
    let metrics = get_metrics();
    let segments_deleted = metrics
        .get_or_create_counter("segments_deleted_total", "Stale segment files deleted")
        .unwrap();
    let cycles_skipped = metrics
        .get_or_create_counter(
            "reconcile_cycles_skipped",
            "Reconcile cycles skipped due to unreadable manifests",
        )
        .unwrap();

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut idle_cycles = 0u32;
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("reconciler stopped by owner");
                return;
            }
            _ = ticker.tick() => {}
        }

        match sweep_dir(&dir) {
            None => {
                cycles_skipped.inc();
                idle_cycles += 1;
                events(ReconcilerEvent::SkippedCycle);
            }
            Some(0) => {
                idle_cycles += 1;
                events(ReconcilerEvent::Swept { deleted: 0 });
            }
            Some(deleted) => {
                idle_cycles = 0;
                segments_deleted.inc_by(deleted);
                events(ReconcilerEvent::Swept { deleted });
            }
        }

        if idle_cycles >= config.max_idle_cycles {
            info!("no stale segments for {} cycles, retiring reconciler", idle_cycles);
            events(ReconcilerEvent::Stopped { idle_cycles });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic">
  <Period id="0" start="PT0.0S">
    <AdaptationSet id="0" contentType="video">
      <Representation id="0" mimeType="video/mp4" bandwidth="1500000">
        <SegmentTemplate timescale="1000" initialization="init-stream$RepresentationID$.m4s" media="chunk-stream$RepresentationID$-$Time$.m4s">
          <SegmentTimeline>
            <S t="0" d="1000" r="2" />
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn sweep_deletes_only_orphaned_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(naming::MANIFEST_FILE), MANIFEST).unwrap();
        touch(dir.path(), "chunk-stream0-0.m4s");
        touch(dir.path(), "chunk-stream0-1000.m4s");
        touch(dir.path(), "chunk-stream0-5000.m4s");
        touch(dir.path(), "init-stream0.m4s");
        touch(dir.path(), "notes.txt");

        // The manifest covers {0, 1000, 2000}; only 5000 is stale.
        assert_eq!(sweep_dir(dir.path()), Some(1));
        assert_eq!(
            names(dir.path()),
            vec![
                "chunk-stream0-0.m4s",
                "chunk-stream0-1000.m4s",
                "init-stream0.m4s",
                "notes.txt",
                "stream.mpd",
            ]
        );

        // Idempotent: a second cycle with an unchanged manifest deletes nothing.
        assert_eq!(sweep_dir(dir.path()), Some(0));
    }

    #[test]
    fn missing_manifest_skips_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "chunk-stream0-5000.m4s");

        assert_eq!(sweep_dir(dir.path()), None);
        assert_eq!(names(dir.path()), vec!["chunk-stream0-5000.m4s"]);
    }

    #[test]
    fn malformed_manifest_skips_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(naming::MANIFEST_FILE), "<MPD><Period>").unwrap();
        touch(dir.path(), "chunk-stream0-5000.m4s");

        assert_eq!(sweep_dir(dir.path()), None);
        assert_eq!(
            names(dir.path()),
            vec!["chunk-stream0-5000.m4s", "stream.mpd"]
        );
    }

    #[tokio::test]
    async fn idle_run_retires_with_an_observable_event() {
        let dir = tempfile::tempdir().unwrap();
        let events: Arc<Mutex<Vec<ReconcilerEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let (_stop_tx, stop_rx) = oneshot::channel();

        let config = ReconcilerConfig {
            interval: Duration::from_millis(5),
            max_idle_cycles: 3,
        };
        run(
            dir.path().to_path_buf(),
            config,
            stop_rx,
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        )
        .await;

        let events = events.lock().unwrap();
        assert_eq!(events.last(), Some(&ReconcilerEvent::Stopped { idle_cycles: 3 }));
        assert_eq!(
            events.iter().filter(|e| **e == ReconcilerEvent::SkippedCycle).count(),
            3
        );
    }

    #[tokio::test]
    async fn owner_stop_ends_the_loop_without_a_retire_event() {
        let dir = tempfile::tempdir().unwrap();
        let events: Arc<Mutex<Vec<ReconcilerEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let (stop_tx, stop_rx) = oneshot::channel();

        let config = ReconcilerConfig {
            interval: Duration::from_secs(3600),
            max_idle_cycles: 10,
        };
        let task = tokio::spawn(run(
            dir.path().to_path_buf(),
            config,
            stop_rx,
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        ));

        stop_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ReconcilerEvent::Stopped { .. })));
    }
}

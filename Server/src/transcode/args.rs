// transcode/args.rs

use std::path::{Path, PathBuf};

use dash_manifest::naming;

use crate::types::PackagingConfig;

/// An external command as an explicit argument vector. Commands are never
/// assembled through a shell, so addresses and paths need no quoting.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub pipe_stdin: bool,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            pipe_stdin: false,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn pipe_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Relay transcode: webm frames on stdin, MPEG-TS out on the relay address.
pub fn relay_args(ffmpeg: &str, relay_url: &str) -> CommandSpec {
    CommandSpec::new(ffmpeg)
        .args(["-f", "webm", "-analyzeduration", "1500000", "-i", "pipe:0"])
        .args(["-fflags", "nobuffer+flush_packets+discardcorrupt"])
        .args(["-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency"])
        .args(["-g", "30", "-sc_threshold", "0"])
        .args(["-c:a", "aac", "-b:a", "128k", "-ac", "2", "-ar", "44100"])
        .args(["-f", "mpegts"])
        .arg(relay_url)
        .pipe_stdin()
}

/// DASH packaging: segments the already-transcoded relay stream into a
/// manifest plus media segments inside `output_dir`. The segment name
/// templates come from `dash_manifest::naming` so the reconciler can derive
/// offsets back out of the directory listing.
pub fn package_args(
    ffmpeg: &str,
    input_url: &str,
    output_dir: &Path,
    config: &PackagingConfig,
) -> CommandSpec {
    CommandSpec::new(ffmpeg)
        .args(["-i", input_url])
        .args(["-fflags", "nobuffer+flush_packets+discardcorrupt"])
        .args(["-c", "copy"])
        .args(["-f", "dash"])
        .args(["-use_timeline", "1", "-use_template", "1"])
        .args(["-seg_duration", &config.segment_duration_secs.to_string()])
        .args(["-window_size", &config.window_size.to_string()])
        .args(["-extra_window_size", &config.extra_window_size.to_string()])
        .args(["-remove_at_exit", "0"])
        .args(["-init_seg_name", naming::INIT_TEMPLATE])
        .args(["-media_seg_name", naming::MEDIA_TEMPLATE])
        .arg(naming::MANIFEST_FILE)
        .current_dir(output_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> PackagingConfig {
        PackagingConfig {
            segment_duration_secs: 2,
            window_size: 5,
            extra_window_size: 5,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }

    #[test]
    fn relay_reads_stdin_and_targets_the_relay_address() {
        let spec = relay_args("ffmpeg", "udp://239.128.0.7:4055?pkt_size=1316");
        assert_eq!(spec.program, "ffmpeg");
        assert!(spec.pipe_stdin);
        assert!(spec.args.contains(&"pipe:0".to_string()));
        assert_eq!(
            spec.args.last().unwrap(),
            "udp://239.128.0.7:4055?pkt_size=1316"
        );
    }

    #[test]
    fn packaging_writes_the_shared_naming_convention() {
        let spec = package_args(
            "ffmpeg",
            "udp://239.128.0.7:4055",
            Path::new("/tmp/out"),
            &test_config(),
        );
        assert!(!spec.pipe_stdin);
        assert_eq!(spec.current_dir.as_deref(), Some(Path::new("/tmp/out")));
        let media_pos = spec.args.iter().position(|a| a == "-media_seg_name").unwrap();
        assert_eq!(spec.args[media_pos + 1], naming::MEDIA_TEMPLATE);
        let seg_pos = spec.args.iter().position(|a| a == "-seg_duration").unwrap();
        assert_eq!(spec.args[seg_pos + 1], "2");
        assert_eq!(spec.args.last().unwrap(), naming::MANIFEST_FILE);
    }
}

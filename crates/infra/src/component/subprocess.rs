//! Out-of-process component adapter.
//!
//! Launches `<interpreter> <script>` and exchanges one JSON object per line
//! over the child's stdin/stdout. Requests carry an `op` tag:
//!
//! ```text
//! -> {"op":"init","run_directory":"/opt/mpf/plugins"}
//! <- {"ok":true,"detection_type":"FACE","supports":["VIDEO","IMAGE"]}
//! -> {"op":"detect","job":{"type":"image",...}}
//! <- {"results":{"type":"image","results":[...]}}
//! <- {"error":{"code":"DETECTION_FAILED","message":"..."}}
//! -> {"op":"close"}
//! <- {"ok":true}
//! ```
//!
//! The child's stderr is inherited so its own logging reaches the executor's
//! output.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use batchexec_core::{
    AllAudioTracksJob, AllVideoTracksJob, AudioJob, AudioTrack, ComponentJob, DataType,
    DetectionComponent, DetectionError, DetectionFailure, DetectionOutcome, DetectionResults,
    ErrorCode, GenericJob, GenericTrack, ImageJob, ImageLocation, VideoJob, VideoTrack,
};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Init { run_directory: Option<&'a Path> },
    Detect { job: &'a ComponentJob },
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireCode {
    Number(i32),
    Name(String),
}

impl WireCode {
    fn into_code(self) -> ErrorCode {
        match self {
            WireCode::Number(n) => ErrorCode::from_i32(n),
            WireCode::Name(name) => {
                ErrorCode::from_name(&name).unwrap_or(ErrorCode::OtherDetectionErrorType)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: WireCode,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    #[serde(default)]
    ok: bool,
    detection_type: Option<String>,
    #[serde(default)]
    supports: Vec<String>,
    results: Option<DetectionResults>,
    error: Option<WireError>,
}

struct Pipes {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Component running in a child process.
pub struct SubprocessComponent {
    interpreter: String,
    script: PathBuf,
    run_directory: Option<PathBuf>,
    detection_type: String,
    supported: Vec<DataType>,
    pipes: Option<Pipes>,
    exit_grace: Duration,
}

/// How long a child gets to exit after its stdin closes before it is killed.
const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Wait up to `grace` for `child` to exit. `None` means it is still running.
fn wait_with_deadline(child: &mut Child, grace: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

impl SubprocessComponent {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            run_directory: None,
            detection_type: String::new(),
            supported: Vec::new(),
            pipes: None,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    fn spawn(&self) -> anyhow::Result<Pipes> {
        let mut child = Command::new(&self.interpreter)
            .arg(&self.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| {
                format!("failed to launch {} {}", self.interpreter, self.script.display())
            })?;
        let stdin = child.stdin.take().context("child stdin was not captured")?;
        let stdout = child.stdout.take().context("child stdout was not captured")?;
        Ok(Pipes {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn call(&mut self, request: &Request<'_>) -> anyhow::Result<Reply> {
        let pipes = self
            .pipes
            .as_mut()
            .ok_or_else(|| anyhow!("component process is not running"))?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        pipes
            .stdin
            .write_all(line.as_bytes())
            .and_then(|()| pipes.stdin.flush())
            .context("failed to write to component process")?;

        let mut reply = String::new();
        let read = pipes
            .stdout
            .read_line(&mut reply)
            .context("failed to read from component process")?;
        if read == 0 {
            bail!("component process exited without replying");
        }
        serde_json::from_str(&reply)
            .with_context(|| format!("malformed reply from component process: {}", reply.trim()))
    }

    fn detect(&mut self, job: ComponentJob) -> Result<DetectionResults, DetectionFailure> {
        let reply = self.call(&Request::Detect { job: &job })?;
        if let Some(e) = reply.error {
            return Err(DetectionError::new(e.code.into_code(), e.message).into());
        }
        let results = reply
            .results
            .ok_or_else(|| anyhow!("reply contained neither results nor an error"))?;
        if results.data_type() != job.data_type() {
            return Err(anyhow!(
                "component returned {} results for a {} job",
                results.data_type(),
                job.data_type()
            )
            .into());
        }
        Ok(results)
    }

    fn shutdown_child(&mut self) {
        if let Some(pipes) = self.pipes.take() {
            drop(pipes.stdin);
            let mut child = pipes.child;
            match wait_with_deadline(&mut child, self.exit_grace) {
                Ok(Some(status)) if !status.success() => {
                    warn!(%status, "component process exited unsuccessfully")
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(
                        grace_ms = self.exit_grace.as_millis() as u64,
                        "component process did not exit; killing it"
                    );
                    if let Err(e) = child.kill() {
                        warn!(error = %e, "failed to kill component process");
                    }
                    let _ = child.wait();
                }
                Err(e) => warn!(error = %e, "failed to wait for component process"),
            }
        }
    }
}

impl DetectionComponent for SubprocessComponent {
    fn set_run_directory(&mut self, dir: &Path) {
        self.run_directory = Some(dir.to_path_buf());
    }

    fn init(&mut self) -> bool {
        let result = self.spawn().and_then(|pipes| {
            self.pipes = Some(pipes);
            let run_directory = self.run_directory.clone();
            self.call(&Request::Init {
                run_directory: run_directory.as_deref(),
            })
        });

        match result {
            Ok(reply) if reply.ok => {
                self.detection_type = reply.detection_type.unwrap_or_default();
                self.supported = reply
                    .supports
                    .iter()
                    .filter_map(|name| DataType::parse(name))
                    .collect();
                info!(
                    script = %self.script.display(),
                    detection_type = %self.detection_type,
                    "component process initialized"
                );
                true
            }
            Ok(reply) => {
                let detail = reply.error.map(|e| e.message).unwrap_or_default();
                error!(detail = %detail, "component process reported an initialization failure");
                self.shutdown_child();
                false
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to initialize component process");
                self.shutdown_child();
                false
            }
        }
    }

    fn close(&mut self) -> bool {
        if self.pipes.is_none() {
            return true;
        }
        let ok = match self.call(&Request::Close) {
            Ok(reply) => reply.ok,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "component process did not acknowledge close");
                false
            }
        };
        self.shutdown_child();
        ok
    }

    fn detection_type(&self) -> String {
        self.detection_type.clone()
    }

    fn supports(&self, data_type: DataType) -> bool {
        self.supported.contains(&data_type)
    }

    fn get_video_detections(&mut self, job: &VideoJob) -> DetectionOutcome<VideoTrack> {
        match self.detect(ComponentJob::Video(job.clone()))? {
            DetectionResults::Video(tracks) => Ok(tracks),
            _ => unreachable!("data type checked in detect"),
        }
    }

    fn get_all_video_tracks_detections(
        &mut self,
        job: &AllVideoTracksJob,
    ) -> DetectionOutcome<VideoTrack> {
        match self.detect(ComponentJob::AllVideoTracks(job.clone()))? {
            DetectionResults::Video(tracks) => Ok(tracks),
            _ => unreachable!("data type checked in detect"),
        }
    }

    fn get_image_detections(&mut self, job: &ImageJob) -> DetectionOutcome<ImageLocation> {
        match self.detect(ComponentJob::Image(job.clone()))? {
            DetectionResults::Image(locations) => Ok(locations),
            _ => unreachable!("data type checked in detect"),
        }
    }

    fn get_audio_detections(&mut self, job: &AudioJob) -> DetectionOutcome<AudioTrack> {
        match self.detect(ComponentJob::Audio(job.clone()))? {
            DetectionResults::Audio(tracks) => Ok(tracks),
            _ => unreachable!("data type checked in detect"),
        }
    }

    fn get_all_audio_tracks_detections(
        &mut self,
        job: &AllAudioTracksJob,
    ) -> DetectionOutcome<AudioTrack> {
        match self.detect(ComponentJob::AllAudioTracks(job.clone()))? {
            DetectionResults::Audio(tracks) => Ok(tracks),
            _ => unreachable!("data type checked in detect"),
        }
    }

    fn get_generic_detections(&mut self, job: &GenericJob) -> DetectionOutcome<GenericTrack> {
        match self.detect(ComponentJob::Generic(job.clone()))? {
            DetectionResults::Generic(tracks) => Ok(tracks),
            _ => unreachable!("data type checked in detect"),
        }
    }
}

impl Drop for SubprocessComponent {
    fn drop(&mut self) {
        if let Some(pipes) = self.pipes.as_mut() {
            let _ = pipes.child.kill();
        }
        self.shutdown_child();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use batchexec_core::JobSpec;

    const SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"op":"init"'*) echo '{"ok":true,"detection_type":"ECHO","supports":["IMAGE","GENERIC"]}' ;;
    *'"op":"detect"'*'"type":"image"'*) echo '{"results":{"type":"image","results":[{"x_left_upper":1,"y_left_upper":2,"width":3,"height":4}]}}' ;;
    *'"op":"detect"'*'fail.bin'*) echo '{"error":{"code":"DETECTION_FAILED","message":"bad bytes"}}' ;;
    *'"op":"detect"'*) echo '{"results":{"type":"image","results":[]}}' ;;
    *'"op":"close"'*) echo '{"ok":true}'; exit 0 ;;
  esac
done
"#;

    fn component() -> (tempfile::TempDir, SubprocessComponent) {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("component.sh");
        std::fs::write(&script, SCRIPT).unwrap();
        (dir, SubprocessComponent::new("sh", script))
    }

    #[test]
    fn init_reads_capabilities() {
        let (_dir, mut component) = component();
        component.set_run_directory(Path::new("/tmp"));
        assert!(component.init());
        assert_eq!(component.detection_type(), "ECHO");
        assert!(component.supports(DataType::Image));
        assert!(component.supports(DataType::Unknown));
        assert!(!component.supports(DataType::Video));
        assert!(component.close());
    }

    #[test]
    fn image_detections_are_decoded() {
        let (_dir, mut component) = component();
        assert!(component.init());
        let locations = component
            .get_image_detections(&ImageJob {
                spec: JobSpec::new("job", "/a.png"),
                feed_forward_location: None,
            })
            .unwrap();
        assert_eq!(locations, vec![ImageLocation::new(1, 2, 3, 4)]);
    }

    #[test]
    fn error_replies_become_detection_errors() {
        let (_dir, mut component) = component();
        assert!(component.init());
        let err = component
            .get_generic_detections(&GenericJob {
                spec: JobSpec::new("job", "/fail.bin"),
                feed_forward_track: None,
            })
            .unwrap_err();
        assert_eq!(
            err.to_report(),
            (ErrorCode::DetectionFailed, "bad bytes".to_string())
        );
    }

    #[test]
    fn mismatched_result_type_is_reported_as_other() {
        let (_dir, mut component) = component();
        assert!(component.init());
        let err = component
            .get_generic_detections(&GenericJob {
                spec: JobSpec::new("job", "/x.bin"),
                feed_forward_track: None,
            })
            .unwrap_err();
        assert_eq!(err.to_report().0, ErrorCode::OtherDetectionErrorType);
    }

    #[test]
    fn child_ignoring_eof_is_killed_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stubborn.sh");
        std::fs::write(
            &script,
            "read -r line\necho '{\"ok\":false}'\nwhile true; do sleep 1; done\n",
        )
        .unwrap();
        let mut component =
            SubprocessComponent::new("sh", script).with_exit_grace(Duration::from_millis(200));

        let started = Instant::now();
        assert!(!component.init());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(component.pipes.is_none());
    }

    #[test]
    fn missing_interpreter_fails_init() {
        let mut component = SubprocessComponent::new("/definitely/not/an/interpreter", "x.py");
        assert!(!component.init());
        assert!(component.close());
    }
}

//! Periodic self-test of the detection component.
//!
//! A canary job, described by a TOML file, is run before jobs are
//! dispatched. Consecutive failures are counted; once the configured limit is
//! reached the check becomes fatal and the executor exits.
//!
//! ```toml
//! media = "${MPF_HOME}/plugins/MyComponent/health/sample.jpg"
//! media_type = "IMAGE"        # VIDEO, IMAGE, AUDIO or GENERIC
//! min_num_tracks = 1
//!
//! [job_properties]
//! CONFIDENCE_THRESHOLD = "0.5"
//!
//! [media_properties]
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{error, info, warn};

use batchexec_observability::{HEALTH_CHECK_SPAN_NAME, job_span};

use batchexec_core::{
    AudioJob, ComponentJob, DataType, DetectionComponent, GenericJob, ImageJob, JobSpec,
    Properties, VideoJob, run_detection,
};

use crate::config::{ConfigError, EnvLookup, HealthCheckSettings, interpolate_env_vars, interpolate_file_content};

const HEALTH_CHECK_JOB_NAME: &str = "HealthCheck";

#[derive(Debug, thiserror::Error)]
pub enum HealthCheckLoadError {
    #[error("failed to load health check file \"{path}\": {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load health check file: {0}")]
    Interpolation(#[from] ConfigError),

    #[error("failed to parse health check file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to load health check file: \"media\" key was empty")]
    EmptyMedia,

    #[error("failed to load health check file: no media file is present at \"{0}\"")]
    MediaNotFound(PathBuf),

    #[error("failed to load health check file: \"media_type\" key was set to an invalid value: {0}")]
    InvalidMediaType(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HealthCheckError {
    /// The consecutive failure limit was reached.
    #[error("health check failed {attempts} consecutive times; last failure: {reason}")]
    Fatal { attempts: u32, reason: String },
}

#[derive(Debug, Deserialize)]
struct HealthCheckFile {
    media: String,
    media_type: String,
    min_num_tracks: usize,
    #[serde(default)]
    job_properties: Properties,
    #[serde(default)]
    media_properties: Properties,
}

/// Canary job plus the minimum number of detections it must produce.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckJob {
    pub job: ComponentJob,
    pub min_num_tracks: usize,
}

impl HealthCheckJob {
    /// Load from `path` (itself subject to `${VAR}` expansion).
    pub fn load(path: &str, lookup: EnvLookup<'_>) -> Result<Self, HealthCheckLoadError> {
        let path = PathBuf::from(interpolate_env_vars(path, lookup)?);
        let content = std::fs::read_to_string(&path).map_err(|source| {
            HealthCheckLoadError::Read {
                path: path.clone(),
                source,
            }
        })?;
        Self::parse(&content, path.parent(), lookup)
    }

    /// Parse file content. Relative media paths resolve against `base_dir`.
    pub fn parse(
        content: &str,
        base_dir: Option<&Path>,
        lookup: EnvLookup<'_>,
    ) -> Result<Self, HealthCheckLoadError> {
        let file: HealthCheckFile = toml::from_str(&interpolate_file_content(content, lookup)?)?;

        if file.media.trim().is_empty() {
            return Err(HealthCheckLoadError::EmptyMedia);
        }
        let mut media = PathBuf::from(file.media.trim());
        if media.is_relative() {
            if let Some(base) = base_dir {
                media = base.join(media);
            }
        }
        if !media.exists() {
            return Err(HealthCheckLoadError::MediaNotFound(media));
        }

        let spec = JobSpec::new(HEALTH_CHECK_JOB_NAME, media.to_string_lossy())
            .with_job_properties(file.job_properties)
            .with_media_properties(file.media_properties);

        let job = match DataType::parse(&file.media_type) {
            Some(DataType::Video) => ComponentJob::Video(VideoJob {
                spec,
                start_frame: 0,
                stop_frame: -1,
                feed_forward_track: None,
            }),
            Some(DataType::Image) => ComponentJob::Image(ImageJob {
                spec,
                feed_forward_location: None,
            }),
            Some(DataType::Audio) => ComponentJob::Audio(AudioJob {
                spec,
                start_time: 0,
                stop_time: -1,
                feed_forward_track: None,
            }),
            Some(DataType::Unknown) => ComponentJob::Generic(GenericJob {
                spec,
                feed_forward_track: None,
            }),
            None => return Err(HealthCheckLoadError::InvalidMediaType(file.media_type)),
        };

        Ok(Self {
            job,
            min_num_tracks: file.min_num_tracks,
        })
    }

    /// Run the canary once. `Err` carries the failure reason.
    fn run<C: DetectionComponent + ?Sized>(&self, component: &mut C) -> Result<(), String> {
        let outcome = catch_unwind(AssertUnwindSafe(|| run_detection(component, &self.job)));
        match outcome {
            Ok(Ok(results)) if results.len() >= self.min_num_tracks => Ok(()),
            Ok(Ok(results)) => Err(format!(
                "only found {} results, but {} were expected",
                results.len(),
                self.min_num_tracks
            )),
            Ok(Err(e)) => {
                let (code, message) = e.to_report();
                Err(format!("component failed during health check: {code}: {message}"))
            }
            Err(_) => Err("component panicked during health check".to_string()),
        }
    }
}

type Sleeper = Box<dyn FnMut(Duration) + Send>;

/// Health-check state for an enabled check.
pub struct ActiveHealthCheck {
    job: HealthCheckJob,
    cooldown: Option<Duration>,
    max_attempts: Option<u32>,
    failure_count: u32,
    next_check: Option<Instant>,
    last_result: bool,
    sleeper: Sleeper,
}

impl ActiveHealthCheck {
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    fn in_cooldown(&self) -> bool {
        self.next_check.is_some_and(|next| Instant::now() < next)
    }
}

pub enum HealthCheck {
    Disabled,
    Enabled(Box<ActiveHealthCheck>),
}

impl core::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HealthCheck::Disabled => f.write_str("HealthCheck::Disabled"),
            HealthCheck::Enabled(active) => f
                .debug_struct("HealthCheck::Enabled")
                .field("cooldown", &active.cooldown)
                .field("max_attempts", &active.max_attempts)
                .field("failure_count", &active.failure_count)
                .finish(),
        }
    }
}

impl HealthCheck {
    /// Build from settings, loading the canary job when enabled.
    pub fn from_settings(
        settings: &HealthCheckSettings,
        lookup: EnvLookup<'_>,
    ) -> Result<Self, HealthCheckLoadError> {
        if !settings.enabled {
            return Ok(HealthCheck::Disabled);
        }
        let job = HealthCheckJob::load(&settings.file, lookup)?;
        info!(
            media = %job.job.spec().data_uri,
            min_num_tracks = job.min_num_tracks,
            "loaded health check job"
        );
        Ok(Self::enabled(job, settings.cooldown, settings.max_attempts))
    }

    pub fn enabled(job: HealthCheckJob, cooldown: Option<Duration>, max_attempts: Option<u32>) -> Self {
        HealthCheck::Enabled(Box::new(ActiveHealthCheck {
            job,
            cooldown,
            max_attempts,
            failure_count: 0,
            next_check: None,
            last_result: true,
            sleeper: Box::new(thread::sleep),
        }))
    }

    /// Replace the function used to wait out the cooldown after a failure.
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: FnMut(Duration) + Send + 'static,
    {
        if let HealthCheck::Enabled(active) = &mut self {
            active.sleeper = Box::new(sleeper);
        }
        self
    }

    /// Run the canary if due.
    ///
    /// Returns `Ok(true)` when healthy (or disabled), `Ok(false)` after a
    /// non-fatal failure, and the previous result while a cooldown is
    /// active. On failure `on_failure` is invoked before the fatal check and
    /// before sleeping.
    pub fn check<C, F>(&mut self, component: &mut C, on_failure: F) -> Result<bool, HealthCheckError>
    where
        C: DetectionComponent + ?Sized,
        F: FnOnce(),
    {
        let HealthCheck::Enabled(active) = self else {
            return Ok(true);
        };
        if active.in_cooldown() {
            return Ok(active.last_result);
        }

        let _span = job_span(HEALTH_CHECK_SPAN_NAME).entered();
        info!("running health check");
        let outcome = active.job.run(component);
        if let Some(cooldown) = active.cooldown {
            active.next_check = Some(Instant::now() + cooldown);
        }

        match outcome {
            Ok(()) => {
                info!(previous_failures = active.failure_count, "health check passed");
                active.failure_count = 0;
                active.last_result = true;
                Ok(true)
            }
            Err(reason) => {
                active.failure_count += 1;
                active.last_result = false;
                error!(
                    failures = active.failure_count,
                    max_attempts = active.max_attempts,
                    reason = %reason,
                    "health check failed"
                );
                on_failure();

                if let Some(max) = active.max_attempts {
                    if active.failure_count >= max {
                        return Err(HealthCheckError::Fatal {
                            attempts: active.failure_count,
                            reason,
                        });
                    }
                }

                if let Some(next) = active.next_check {
                    let wait = next.saturating_duration_since(Instant::now());
                    warn!(wait_secs = wait.as_secs(), "waiting before the next health check");
                    (active.sleeper)(wait);
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchexec_core::{DetectionOutcome, ImageLocation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Returns `detections[call]` locations on the n-th call.
    struct Scripted {
        detections: Vec<usize>,
        calls: usize,
    }

    impl Scripted {
        fn new(detections: Vec<usize>) -> Self {
            Self {
                detections,
                calls: 0,
            }
        }
    }

    impl DetectionComponent for Scripted {
        fn set_run_directory(&mut self, _dir: &Path) {}
        fn init(&mut self) -> bool {
            true
        }
        fn close(&mut self) -> bool {
            true
        }
        fn detection_type(&self) -> String {
            "TEST".to_string()
        }
        fn supports(&self, _data_type: DataType) -> bool {
            true
        }
        fn get_image_detections(&mut self, _job: &ImageJob) -> DetectionOutcome<ImageLocation> {
            let n = self.detections.get(self.calls).copied().unwrap_or(0);
            self.calls += 1;
            Ok(vec![ImageLocation::new(0, 0, 1, 1); n])
        }
    }

    fn canary() -> HealthCheckJob {
        HealthCheckJob {
            job: ComponentJob::Image(ImageJob {
                spec: JobSpec::new(HEALTH_CHECK_JOB_NAME, "/sample.png"),
                feed_forward_location: None,
            }),
            min_num_tracks: 1,
        }
    }

    fn recording_sleeper() -> (Arc<Mutex<Vec<Duration>>>, impl FnMut(Duration) + Send + 'static) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let record = slept.clone();
        (slept, move |d| record.lock().unwrap().push(d))
    }

    #[test]
    fn disabled_check_always_passes() {
        let mut hc = HealthCheck::Disabled;
        let mut component = Scripted::new(vec![]);
        assert!(hc.check(&mut component, || panic!("no callback")).unwrap());
        assert_eq!(component.calls, 0);
    }

    #[test]
    fn second_consecutive_failure_is_fatal_with_two_attempts() {
        let (slept, sleeper) = recording_sleeper();
        let mut hc = HealthCheck::enabled(canary(), Some(Duration::from_millis(1)), Some(2))
            .with_sleeper(sleeper);
        let mut component = Scripted::new(vec![0, 0]);
        let callbacks = AtomicUsize::new(0);

        let first = hc.check(&mut component, || {
            // Callback runs before the cooldown sleep.
            assert!(slept.lock().unwrap().is_empty());
            callbacks.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!first.unwrap());
        assert_eq!(slept.lock().unwrap().len(), 1);

        thread::sleep(Duration::from_millis(5));
        let second = hc.check(&mut component, || {
            callbacks.fetch_add(1, Ordering::SeqCst);
        });
        let HealthCheckError::Fatal { attempts, .. } = second.unwrap_err();
        assert_eq!(attempts, 2);
        assert_eq!(callbacks.load(Ordering::SeqCst), 2);
        // No sleep on the fatal path.
        assert_eq!(slept.lock().unwrap().len(), 1);
    }

    #[test]
    fn cooldown_between_failures_does_not_count_as_an_attempt() {
        let cooldown = Duration::from_millis(200);
        let mut hc = HealthCheck::enabled(canary(), Some(cooldown), Some(2)).with_sleeper(|_| {});
        let mut component = Scripted::new(vec![0, 0]);
        let callbacks = AtomicUsize::new(0);

        let first = hc.check(&mut component, || {
            callbacks.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!first.unwrap());
        assert_eq!(component.calls, 1);

        // Still cooling down: the cached failure comes back untouched.
        let cached = hc.check(&mut component, || panic!("not run"));
        assert!(!cached.unwrap());
        assert_eq!(component.calls, 1);

        thread::sleep(cooldown + Duration::from_millis(50));
        let third = hc.check(&mut component, || {
            callbacks.fetch_add(1, Ordering::SeqCst);
        });
        let HealthCheckError::Fatal { attempts, .. } = third.unwrap_err();
        assert_eq!(attempts, 2);
        assert_eq!(component.calls, 2);
        assert_eq!(callbacks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn three_attempts_allow_two_failures() {
        let mut hc = HealthCheck::enabled(canary(), None, Some(3)).with_sleeper(|_| {});
        let mut component = Scripted::new(vec![0, 0, 0]);

        assert!(!hc.check(&mut component, || {}).unwrap());
        assert!(!hc.check(&mut component, || {}).unwrap());
        assert!(hc.check(&mut component, || {}).is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut hc = HealthCheck::enabled(canary(), None, Some(2));
        let mut component = Scripted::new(vec![0, 1, 0]);

        assert!(!hc.check(&mut component, || {}).unwrap());
        assert!(hc.check(&mut component, || {}).unwrap());
        assert!(!hc.check(&mut component, || {}).unwrap());
        match &hc {
            HealthCheck::Enabled(active) => assert_eq!(active.failure_count(), 1),
            HealthCheck::Disabled => unreachable!(),
        }
    }

    #[test]
    fn cooldown_skips_component_and_returns_previous_result() {
        let mut hc = HealthCheck::enabled(canary(), Some(Duration::from_secs(3600)), None);
        let mut component = Scripted::new(vec![1, 0]);

        assert!(hc.check(&mut component, || {}).unwrap());
        assert!(hc.check(&mut component, || panic!("not run")).unwrap());
        assert!(hc.check(&mut component, || panic!("not run")).unwrap());
        assert_eq!(component.calls, 1);
    }

    #[test]
    fn no_max_attempts_is_never_fatal() {
        let mut hc = HealthCheck::enabled(canary(), None, None);
        let mut component = Scripted::new(vec![]);
        for _ in 0..10 {
            assert!(!hc.check(&mut component, || {}).unwrap());
        }
    }

    #[test]
    fn loads_canary_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample.mp4"), b"not really a video").unwrap();
        let file = dir.path().join("health-check.toml");
        std::fs::write(
            &file,
            "media = \"${SAMPLE_DIR}/sample.mp4\"\n\
             media_type = \"video\"\n\
             min_num_tracks = 2\n\
             [job_properties]\n\
             MODEL = \"tiny\"\n",
        )
        .unwrap();

        let dir_path = dir.path().to_string_lossy().to_string();
        let lookup = move |name: &str| (name == "SAMPLE_DIR").then(|| dir_path.clone());
        let job = HealthCheckJob::load(&file.to_string_lossy(), &lookup).unwrap();

        assert_eq!(job.min_num_tracks, 2);
        match &job.job {
            ComponentJob::Video(v) => {
                assert_eq!((v.start_frame, v.stop_frame), (0, -1));
                assert_eq!(v.spec.job_name, "HealthCheck");
                assert_eq!(v.spec.job_properties["MODEL"], "tiny");
            }
            other => panic!("unexpected job {other:?}"),
        }
    }

    #[test]
    fn relative_media_resolves_against_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"x").unwrap();
        let job = HealthCheckJob::parse(
            "media = \"a.bin\"\nmedia_type = \"GENERIC\"\nmin_num_tracks = 0\n",
            Some(dir.path()),
            &|_: &str| None,
        )
        .unwrap();
        assert!(matches!(job.job, ComponentJob::Generic(_)));
    }

    #[test]
    fn missing_media_file_is_a_load_error() {
        let err = HealthCheckJob::parse(
            "media = \"/definitely/not/here.png\"\nmedia_type = \"IMAGE\"\nmin_num_tracks = 1\n",
            None,
            &|_: &str| None,
        )
        .unwrap_err();
        assert!(matches!(err, HealthCheckLoadError::MediaNotFound(_)));
    }

    #[test]
    fn invalid_media_type_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"x").unwrap();
        let err = HealthCheckJob::parse(
            "media = \"a.bin\"\nmedia_type = \"HOLOGRAM\"\nmin_num_tracks = 1\n",
            Some(dir.path()),
            &|_: &str| None,
        )
        .unwrap_err();
        assert!(matches!(err, HealthCheckLoadError::InvalidMediaType(t) if t == "HOLOGRAM"));
    }
}

//! Components compiled into the executor binary.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use batchexec_core::{
    AudioJob, AudioTrack, DataType, DetectionComponent, DetectionError, DetectionOutcome,
    ErrorCode, GenericJob, GenericTrack, ImageJob, ImageLocation, JobSpec, VideoJob, VideoTrack,
};

type Factory = fn() -> Box<dyn DetectionComponent>;

const REGISTRY: &[(&str, Factory)] = &[("hello", hello)];

fn hello() -> Box<dyn DetectionComponent> {
    Box::new(HelloComponent::default())
}

/// Look up a built-in component by name.
pub fn builtin_component(name: &str) -> Option<Box<dyn DetectionComponent>> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, factory)| factory())
}

pub fn builtin_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}

const METADATA_PROPERTY: &str = "METADATA";

/// Reference component returning one fixed detection per job.
///
/// Used to exercise registration and the execution loop end to end.
#[derive(Debug, Default)]
pub struct HelloComponent {
    run_directory: Option<PathBuf>,
    initialized: bool,
}

impl HelloComponent {
    fn ensure_initialized(&self) -> Result<(), DetectionError> {
        if self.initialized {
            Ok(())
        } else {
            Err(DetectionError::new(
                ErrorCode::DetectionNotInitialized,
                "init() was not called",
            ))
        }
    }

    fn metadata(spec: &JobSpec, kind: &str) -> String {
        spec.job_properties
            .get(METADATA_PROPERTY)
            .cloned()
            .unwrap_or_else(|| format!("extra {kind} info"))
    }
}

impl DetectionComponent for HelloComponent {
    fn set_run_directory(&mut self, dir: &Path) {
        self.run_directory = Some(dir.to_path_buf());
    }

    fn init(&mut self) -> bool {
        info!(run_directory = ?self.run_directory, "hello component initialized");
        self.initialized = true;
        true
    }

    fn close(&mut self) -> bool {
        self.initialized = false;
        true
    }

    fn detection_type(&self) -> String {
        "HELLO".to_string()
    }

    fn supports(&self, data_type: DataType) -> bool {
        matches!(
            data_type,
            DataType::Video | DataType::Image | DataType::Audio | DataType::Unknown
        )
    }

    fn get_video_detections(&mut self, job: &VideoJob) -> DetectionOutcome<VideoTrack> {
        self.ensure_initialized()?;
        debug!(job = %job.spec.job_name, "hello video job");
        let stop_frame = job.stop_frame.max(job.start_frame);
        let track = VideoTrack::new(job.start_frame, stop_frame)
            .with_confidence(0.8)
            .with_location(
                job.start_frame,
                ImageLocation::new(0, 0, 100, 100).with_confidence(0.8),
            )
            .with_property(METADATA_PROPERTY, Self::metadata(&job.spec, "video track"));
        Ok(vec![track])
    }

    fn get_image_detections(&mut self, job: &ImageJob) -> DetectionOutcome<ImageLocation> {
        self.ensure_initialized()?;
        let location = ImageLocation::new(0, 0, 100, 100)
            .with_confidence(0.8)
            .with_property(METADATA_PROPERTY, Self::metadata(&job.spec, "image location"));
        Ok(vec![location])
    }

    fn get_audio_detections(&mut self, job: &AudioJob) -> DetectionOutcome<AudioTrack> {
        self.ensure_initialized()?;
        let stop_time = job.stop_time.max(job.start_time);
        Ok(vec![AudioTrack::new(job.start_time, stop_time).with_confidence(0.8)])
    }

    fn get_generic_detections(&mut self, job: &GenericJob) -> DetectionOutcome<GenericTrack> {
        self.ensure_initialized()?;
        Ok(vec![
            GenericTrack::new(0.8)
                .with_property(METADATA_PROPERTY, Self::metadata(&job.spec, "generic track")),
        ])
    }
}

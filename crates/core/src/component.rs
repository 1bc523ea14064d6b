//! Detection component capability.
//!
//! A component is the opaque, possibly unreliable algorithm plugin. The
//! executor only talks to it through [`DetectionComponent`]; whether it is
//! compiled in or lives in another process is decided once at startup.

use std::path::Path;

use thiserror::Error;

use crate::detection::{AudioTrack, GenericTrack, ImageLocation, VideoTrack};
use crate::error::{DetectionError, ErrorCode};
use crate::job::{
    AllAudioTracksJob, AllVideoTracksJob, AudioJob, ComponentJob, DetectionResults, GenericJob,
    ImageJob, VideoJob,
};
use crate::media::DataType;

/// Why a detection call produced no results.
#[derive(Debug, Error)]
pub enum DetectionFailure {
    /// The component reported a structured error code.
    #[error(transparent)]
    Detection(#[from] DetectionError),

    /// Anything else (transport failure, unexpected reply, ...).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DetectionFailure {
    /// Code and explanation reported to the pipeline.
    pub fn to_report(&self) -> (ErrorCode, String) {
        match self {
            DetectionFailure::Detection(e) => (e.code, e.message.clone()),
            DetectionFailure::Other(e) => (ErrorCode::OtherDetectionErrorType, format!("{e:#}")),
        }
    }
}

pub type DetectionOutcome<T> = Result<Vec<T>, DetectionFailure>;

fn unsupported<T>(what: &str) -> DetectionOutcome<T> {
    Err(DetectionError::new(
        ErrorCode::UnsupportedDataType,
        format!("This component does not support {what} jobs."),
    )
    .into())
}

/// Contract every detection component fulfils.
///
/// Entry points a component does not implement report
/// `UNSUPPORTED_DATA_TYPE`.
pub trait DetectionComponent: Send {
    /// Directory the component may load its models and config from.
    fn set_run_directory(&mut self, dir: &Path);

    /// Returns `false` when the component cannot be used.
    fn init(&mut self) -> bool;

    fn close(&mut self) -> bool;

    /// Label attached to every response, e.g. `FACE` or `TEXT`.
    fn detection_type(&self) -> String;

    fn supports(&self, data_type: DataType) -> bool;

    fn get_video_detections(&mut self, _job: &VideoJob) -> DetectionOutcome<VideoTrack> {
        unsupported("video")
    }

    fn get_all_video_tracks_detections(
        &mut self,
        _job: &AllVideoTracksJob,
    ) -> DetectionOutcome<VideoTrack> {
        unsupported("all video tracks")
    }

    fn get_image_detections(&mut self, _job: &ImageJob) -> DetectionOutcome<ImageLocation> {
        unsupported("image")
    }

    fn get_audio_detections(&mut self, _job: &AudioJob) -> DetectionOutcome<AudioTrack> {
        unsupported("audio")
    }

    fn get_all_audio_tracks_detections(
        &mut self,
        _job: &AllAudioTracksJob,
    ) -> DetectionOutcome<AudioTrack> {
        unsupported("all audio tracks")
    }

    fn get_generic_detections(&mut self, _job: &GenericJob) -> DetectionOutcome<GenericTrack> {
        unsupported("generic")
    }
}

impl<C: DetectionComponent + ?Sized> DetectionComponent for Box<C> {
    fn set_run_directory(&mut self, dir: &Path) {
        (**self).set_run_directory(dir)
    }

    fn init(&mut self) -> bool {
        (**self).init()
    }

    fn close(&mut self) -> bool {
        (**self).close()
    }

    fn detection_type(&self) -> String {
        (**self).detection_type()
    }

    fn supports(&self, data_type: DataType) -> bool {
        (**self).supports(data_type)
    }

    fn get_video_detections(&mut self, job: &VideoJob) -> DetectionOutcome<VideoTrack> {
        (**self).get_video_detections(job)
    }

    fn get_all_video_tracks_detections(
        &mut self,
        job: &AllVideoTracksJob,
    ) -> DetectionOutcome<VideoTrack> {
        (**self).get_all_video_tracks_detections(job)
    }

    fn get_image_detections(&mut self, job: &ImageJob) -> DetectionOutcome<ImageLocation> {
        (**self).get_image_detections(job)
    }

    fn get_audio_detections(&mut self, job: &AudioJob) -> DetectionOutcome<AudioTrack> {
        (**self).get_audio_detections(job)
    }

    fn get_all_audio_tracks_detections(
        &mut self,
        job: &AllAudioTracksJob,
    ) -> DetectionOutcome<AudioTrack> {
        (**self).get_all_audio_tracks_detections(job)
    }

    fn get_generic_detections(&mut self, job: &GenericJob) -> DetectionOutcome<GenericTrack> {
        (**self).get_generic_detections(job)
    }
}

/// Route a job to the matching entry point.
pub fn run_detection<C>(
    component: &mut C,
    job: &ComponentJob,
) -> Result<DetectionResults, DetectionFailure>
where
    C: DetectionComponent + ?Sized,
{
    Ok(match job {
        ComponentJob::Video(j) => DetectionResults::Video(component.get_video_detections(j)?),
        ComponentJob::AllVideoTracks(j) => {
            DetectionResults::Video(component.get_all_video_tracks_detections(j)?)
        }
        ComponentJob::Image(j) => DetectionResults::Image(component.get_image_detections(j)?),
        ComponentJob::Audio(j) => DetectionResults::Audio(component.get_audio_detections(j)?),
        ComponentJob::AllAudioTracks(j) => {
            DetectionResults::Audio(component.get_all_audio_tracks_detections(j)?)
        }
        ComponentJob::Generic(j) => {
            DetectionResults::Generic(component.get_generic_detections(j)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;

    struct ImageOnly;

    impl DetectionComponent for ImageOnly {
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
        fn supports(&self, data_type: DataType) -> bool {
            data_type == DataType::Image
        }
        fn get_image_detections(&mut self, _job: &ImageJob) -> DetectionOutcome<ImageLocation> {
            Ok(vec![ImageLocation::new(1, 2, 3, 4)])
        }
    }

    #[test]
    fn image_job_routes_to_image_entry_point() {
        let job = ComponentJob::Image(ImageJob {
            spec: JobSpec::new("job", "/a.png"),
            feed_forward_location: None,
        });
        let results = run_detection(&mut ImageOnly, &job).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.data_type(), DataType::Image);
    }

    #[test]
    fn unimplemented_entry_point_reports_unsupported() {
        let job = ComponentJob::Generic(GenericJob {
            spec: JobSpec::new("job", "/a.bin"),
            feed_forward_track: None,
        });
        let err = run_detection(&mut ImageOnly, &job).unwrap_err();
        assert_eq!(err.to_report().0, ErrorCode::UnsupportedDataType);
    }

    #[test]
    fn other_failures_map_to_other_error_code() {
        let failure = DetectionFailure::from(anyhow::anyhow!("pipe closed"));
        let (code, message) = failure.to_report();
        assert_eq!(code, ErrorCode::OtherDetectionErrorType);
        assert_eq!(message, "pipe closed");
    }
}

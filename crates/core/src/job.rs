//! Job payloads handed to detection components.

use serde::{Deserialize, Serialize};

use crate::detection::{AudioTrack, GenericTrack, ImageLocation, VideoTrack};
use crate::media::{DataType, Properties};

/// Fields every job variant carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable name used in logs (`Job <id>:<file>(<start>-<end>)`).
    pub job_name: String,
    /// Locator of the media (usually a local path).
    pub data_uri: String,
    #[serde(default)]
    pub job_properties: Properties,
    #[serde(default)]
    pub media_properties: Properties,
}

impl JobSpec {
    pub fn new(job_name: impl Into<String>, data_uri: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            data_uri: data_uri.into(),
            job_properties: Properties::new(),
            media_properties: Properties::new(),
        }
    }

    pub fn with_job_properties(mut self, props: Properties) -> Self {
        self.job_properties = props;
        self
    }

    pub fn with_media_properties(mut self, props: Properties) -> Self {
        self.media_properties = props;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub start_frame: i32,
    pub stop_frame: i32,
    #[serde(default)]
    pub feed_forward_track: Option<VideoTrack>,
}

/// Video job seeded with every track of a previous stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllVideoTracksJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub start_frame: i32,
    pub stop_frame: i32,
    pub feed_forward_tracks: Vec<VideoTrack>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(default)]
    pub feed_forward_location: Option<ImageLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub start_time: i32,
    pub stop_time: i32,
    #[serde(default)]
    pub feed_forward_track: Option<AudioTrack>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllAudioTracksJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub start_time: i32,
    pub stop_time: i32,
    pub feed_forward_tracks: Vec<AudioTrack>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(default)]
    pub feed_forward_track: Option<GenericTrack>,
}

/// Which detection entry point a job is routed to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JobType {
    Video,
    AllVideoTracks,
    Image,
    Audio,
    AllAudioTracks,
    Generic,
}

impl JobType {
    pub fn data_type(self) -> DataType {
        match self {
            JobType::Video | JobType::AllVideoTracks => DataType::Video,
            JobType::Image => DataType::Image,
            JobType::Audio | JobType::AllAudioTracks => DataType::Audio,
            JobType::Generic => DataType::Unknown,
        }
    }
}

/// A fully decoded job, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentJob {
    Video(VideoJob),
    AllVideoTracks(AllVideoTracksJob),
    Image(ImageJob),
    Audio(AudioJob),
    AllAudioTracks(AllAudioTracksJob),
    Generic(GenericJob),
}

impl ComponentJob {
    pub fn job_type(&self) -> JobType {
        match self {
            ComponentJob::Video(_) => JobType::Video,
            ComponentJob::AllVideoTracks(_) => JobType::AllVideoTracks,
            ComponentJob::Image(_) => JobType::Image,
            ComponentJob::Audio(_) => JobType::Audio,
            ComponentJob::AllAudioTracks(_) => JobType::AllAudioTracks,
            ComponentJob::Generic(_) => JobType::Generic,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.job_type().data_type()
    }

    pub fn spec(&self) -> &JobSpec {
        match self {
            ComponentJob::Video(j) => &j.spec,
            ComponentJob::AllVideoTracks(j) => &j.spec,
            ComponentJob::Image(j) => &j.spec,
            ComponentJob::Audio(j) => &j.spec,
            ComponentJob::AllAudioTracks(j) => &j.spec,
            ComponentJob::Generic(j) => &j.spec,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.spec().job_name
    }
}

/// Typed output of one detection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "results", rename_all = "snake_case")]
pub enum DetectionResults {
    Video(Vec<VideoTrack>),
    Image(Vec<ImageLocation>),
    Audio(Vec<AudioTrack>),
    Generic(Vec<GenericTrack>),
}

impl DetectionResults {
    pub fn len(&self) -> usize {
        match self {
            DetectionResults::Video(t) => t.len(),
            DetectionResults::Image(l) => l.len(),
            DetectionResults::Audio(t) => t.len(),
            DetectionResults::Generic(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            DetectionResults::Video(_) => DataType::Video,
            DetectionResults::Image(_) => DataType::Image,
            DetectionResults::Audio(_) => DataType::Audio,
            DetectionResults::Generic(_) => DataType::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_tracks_jobs_route_to_their_media_type() {
        assert_eq!(JobType::AllVideoTracks.data_type(), DataType::Video);
        assert_eq!(JobType::AllAudioTracks.data_type(), DataType::Audio);
        assert_eq!(JobType::Generic.data_type(), DataType::Unknown);
    }

    #[test]
    fn job_serializes_with_type_tag_and_flat_spec() {
        let job = ComponentJob::Image(ImageJob {
            spec: JobSpec::new("Job 1:a.png", "/data/a.png"),
            feed_forward_location: None,
        });
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["data_uri"], "/data/a.png");

        let back: ComponentJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}

//! `batchexec-core`: detection domain building blocks.
//!
//! This crate contains **pure domain** types (no broker, no IO): jobs,
//! detection results, error codes, and the component capability trait.

pub mod component;
pub mod detection;
pub mod error;
pub mod id;
pub mod job;
pub mod media;

pub use component::{DetectionComponent, DetectionFailure, DetectionOutcome, run_detection};
pub use detection::{AudioTrack, GenericTrack, ImageLocation, VideoTrack};
pub use error::{DetectionError, DetectionResult, ErrorCode};
pub use id::{JobId, MessageId};
pub use job::{
    AllAudioTracksJob, AllVideoTracksJob, AudioJob, ComponentJob, DetectionResults, GenericJob,
    ImageJob, JobSpec, JobType, VideoJob,
};
pub use media::{DataType, Properties};

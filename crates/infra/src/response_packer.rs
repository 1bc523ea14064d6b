//! Builds response envelopes.

use prost::Message;

use batchexec_core::{ComponentJob, DetectionResults, ErrorCode};
use batchexec_messaging::envelope::{
    AudioResponse, AudioTrackMsg, DetectionResponse, GenericResponse, GenericTrackMsg,
    ImageLocationMsg, ImageResponse, MediaDataType, VideoResponse, VideoTrackMsg,
};

use crate::job_context::JobContext;

/// Largest encoded response accepted by default (100 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("response of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("failed to encode response: {0}")]
    Encode(#[from] prost::EncodeError),
}

#[derive(Debug, Clone)]
pub struct ResponsePacker {
    max_response_bytes: usize,
}

impl Default for ResponsePacker {
    fn default() -> Self {
        Self {
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl ResponsePacker {
    pub fn with_max_response_bytes(max_response_bytes: usize) -> Self {
        Self { max_response_bytes }
    }

    /// Encode successful results for `ctx`.
    pub fn pack_response(
        &self,
        ctx: &JobContext,
        detection_type: &str,
        results: &DetectionResults,
    ) -> Result<Vec<u8>, PackError> {
        let mut response = envelope(ctx);
        let detection_type = detection_type.to_string();

        match results {
            DetectionResults::Video(tracks) => {
                let (start_frame, stop_frame) = range(ctx.job());
                response.video_responses.push(VideoResponse {
                    start_frame,
                    stop_frame,
                    detection_type,
                    video_tracks: tracks.iter().map(VideoTrackMsg::from).collect(),
                });
            }
            DetectionResults::Image(locations) => {
                response.image_responses.push(ImageResponse {
                    detection_type,
                    image_locations: locations.iter().map(ImageLocationMsg::from).collect(),
                });
            }
            DetectionResults::Audio(tracks) => {
                let (start_time, stop_time) = range(ctx.job());
                response.audio_responses.push(AudioResponse {
                    start_time,
                    stop_time,
                    detection_type,
                    audio_tracks: tracks.iter().map(AudioTrackMsg::from).collect(),
                });
            }
            DetectionResults::Generic(tracks) => {
                response.generic_responses.push(GenericResponse {
                    detection_type,
                    generic_tracks: tracks.iter().map(GenericTrackMsg::from).collect(),
                });
            }
        }

        self.encode(&response)
    }

    /// Encode an error for `ctx`. The typed sub-response matching the job is
    /// present but holds no detections.
    pub fn pack_error_response(
        &self,
        ctx: &JobContext,
        detection_type: &str,
        code: ErrorCode,
        explanation: &str,
    ) -> Result<Vec<u8>, PackError> {
        let mut response = envelope(ctx);
        response.error = code.as_i32();
        response.error_message = explanation.to_string();
        let detection_type = detection_type.to_string();

        match ctx.job() {
            ComponentJob::Video(_) | ComponentJob::AllVideoTracks(_) => {
                let (start_frame, stop_frame) = range(ctx.job());
                response.video_responses.push(VideoResponse {
                    start_frame,
                    stop_frame,
                    detection_type,
                    ..Default::default()
                });
            }
            ComponentJob::Image(_) => response.image_responses.push(ImageResponse {
                detection_type,
                ..Default::default()
            }),
            ComponentJob::Audio(_) | ComponentJob::AllAudioTracks(_) => {
                let (start_time, stop_time) = range(ctx.job());
                response.audio_responses.push(AudioResponse {
                    start_time,
                    stop_time,
                    detection_type,
                    ..Default::default()
                });
            }
            ComponentJob::Generic(_) => response.generic_responses.push(GenericResponse {
                detection_type,
                ..Default::default()
            }),
        }

        self.encode(&response)
    }

    fn encode(&self, response: &DetectionResponse) -> Result<Vec<u8>, PackError> {
        let size = response.encoded_len();
        if size > self.max_response_bytes {
            return Err(PackError::TooLarge {
                size,
                limit: self.max_response_bytes,
            });
        }
        let mut buf = Vec::with_capacity(size);
        response.encode(&mut buf)?;
        Ok(buf)
    }
}

fn envelope(ctx: &JobContext) -> DetectionResponse {
    let meta = ctx.protobuf_meta();
    DetectionResponse {
        request_id: meta.request_id,
        media_id: meta.media_id,
        task_index: meta.task_index,
        task_name: meta.task_name.clone(),
        action_index: meta.action_index,
        action_name: meta.action_name.clone(),
        data_type: MediaDataType::from(meta.data_type) as i32,
        error: ErrorCode::DetectionSuccess.as_i32(),
        ..Default::default()
    }
}

/// Requested frame or time range; `(0, 0)` for unsegmented media.
fn range(job: &ComponentJob) -> (i32, i32) {
    match job {
        ComponentJob::Video(j) => (j.start_frame, j.stop_frame),
        ComponentJob::AllVideoTracks(j) => (j.start_frame, j.stop_frame),
        ComponentJob::Audio(j) => (j.start_time, j.stop_time),
        ComponentJob::AllAudioTracks(j) => (j.start_time, j.stop_time),
        ComponentJob::Image(_) | ComponentJob::Generic(_) => (0, 0),
    }
}

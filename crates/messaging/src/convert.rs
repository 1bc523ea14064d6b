//! Conversions between domain detections and their wire messages.

use batchexec_core::{AudioTrack, DataType, GenericTrack, ImageLocation, VideoTrack};

use crate::envelope::{
    AudioRequest, AudioTrackMsg, DetectionRequest, FrameLocation, GenericRequest, GenericTrackMsg,
    ImageLocationMsg, ImageRequest, MediaDataType, VideoRequest, VideoTrackMsg,
};

/// Failure to interpret a request envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to decode detection request: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("detection request did not contain a video, image, audio or generic request")]
    NoPayload,

    #[error("detection request contained more than one typed request: {}", .0.join(", "))]
    MultiplePayloads(Vec<&'static str>),
}

/// The single typed sub-request of a [`DetectionRequest`].
#[derive(Debug, Clone, Copy)]
pub enum RequestPayload<'a> {
    Video(&'a VideoRequest),
    Image(&'a ImageRequest),
    Audio(&'a AudioRequest),
    Generic(&'a GenericRequest),
}

impl DetectionRequest {
    /// Select the typed sub-request. Exactly one must be present.
    pub fn payload(&self) -> Result<RequestPayload<'_>, EnvelopeError> {
        let mut found = Vec::new();
        if let Some(v) = &self.video_request {
            found.push(("video", RequestPayload::Video(v)));
        }
        if let Some(i) = &self.image_request {
            found.push(("image", RequestPayload::Image(i)));
        }
        if let Some(a) = &self.audio_request {
            found.push(("audio", RequestPayload::Audio(a)));
        }
        if let Some(g) = &self.generic_request {
            found.push(("generic", RequestPayload::Generic(g)));
        }

        match found.len() {
            0 => Err(EnvelopeError::NoPayload),
            1 => Ok(found.remove(0).1),
            _ => Err(EnvelopeError::MultiplePayloads(
                found.into_iter().map(|(name, _)| name).collect(),
            )),
        }
    }
}

impl From<DataType> for MediaDataType {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Unknown => MediaDataType::Unknown,
            DataType::Video => MediaDataType::Video,
            DataType::Image => MediaDataType::Image,
            DataType::Audio => MediaDataType::Audio,
        }
    }
}

impl From<MediaDataType> for DataType {
    fn from(value: MediaDataType) -> Self {
        match value {
            MediaDataType::Unknown => DataType::Unknown,
            MediaDataType::Video => DataType::Video,
            MediaDataType::Image => DataType::Image,
            MediaDataType::Audio => DataType::Audio,
        }
    }
}

impl From<&ImageLocation> for ImageLocationMsg {
    fn from(loc: &ImageLocation) -> Self {
        Self {
            x_left_upper: loc.x_left_upper,
            y_left_upper: loc.y_left_upper,
            width: loc.width,
            height: loc.height,
            confidence: loc.confidence,
            detection_properties: loc.detection_properties.clone(),
        }
    }
}

impl From<ImageLocationMsg> for ImageLocation {
    fn from(msg: ImageLocationMsg) -> Self {
        Self {
            x_left_upper: msg.x_left_upper,
            y_left_upper: msg.y_left_upper,
            width: msg.width,
            height: msg.height,
            confidence: msg.confidence,
            detection_properties: msg.detection_properties,
        }
    }
}

impl From<&VideoTrack> for VideoTrackMsg {
    fn from(track: &VideoTrack) -> Self {
        Self {
            start_frame: track.start_frame,
            stop_frame: track.stop_frame,
            confidence: track.confidence,
            frame_locations: track
                .frame_locations
                .iter()
                .map(|(frame, loc)| FrameLocation {
                    frame: *frame,
                    image_location: Some(loc.into()),
                })
                .collect(),
            detection_properties: track.detection_properties.clone(),
        }
    }
}

impl From<VideoTrackMsg> for VideoTrack {
    fn from(msg: VideoTrackMsg) -> Self {
        Self {
            start_frame: msg.start_frame,
            stop_frame: msg.stop_frame,
            confidence: msg.confidence,
            frame_locations: msg
                .frame_locations
                .into_iter()
                .map(|fl| (fl.frame, fl.image_location.unwrap_or_default().into()))
                .collect(),
            detection_properties: msg.detection_properties,
        }
    }
}

impl From<&AudioTrack> for AudioTrackMsg {
    fn from(track: &AudioTrack) -> Self {
        Self {
            start_time: track.start_time,
            stop_time: track.stop_time,
            confidence: track.confidence,
            detection_properties: track.detection_properties.clone(),
        }
    }
}

impl From<AudioTrackMsg> for AudioTrack {
    fn from(msg: AudioTrackMsg) -> Self {
        Self {
            start_time: msg.start_time,
            stop_time: msg.stop_time,
            confidence: msg.confidence,
            detection_properties: msg.detection_properties,
        }
    }
}

impl From<&GenericTrack> for GenericTrackMsg {
    fn from(track: &GenericTrack) -> Self {
        Self {
            confidence: track.confidence,
            detection_properties: track.detection_properties.clone(),
        }
    }
}

impl From<GenericTrackMsg> for GenericTrack {
    fn from(msg: GenericTrackMsg) -> Self {
        Self {
            confidence: msg.confidence,
            detection_properties: msg.detection_properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_has_no_payload() {
        let req = DetectionRequest::default();
        assert!(matches!(req.payload(), Err(EnvelopeError::NoPayload)));
    }

    #[test]
    fn two_payloads_are_rejected() {
        let req = DetectionRequest {
            video_request: Some(VideoRequest::default()),
            generic_request: Some(GenericRequest::default()),
            ..Default::default()
        };
        match req.payload() {
            Err(EnvelopeError::MultiplePayloads(names)) => {
                assert_eq!(names, vec!["video", "generic"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn single_payload_is_selected() {
        let req = DetectionRequest {
            image_request: Some(ImageRequest::default()),
            ..Default::default()
        };
        assert!(matches!(req.payload(), Ok(RequestPayload::Image(_))));
    }

    #[test]
    fn video_track_survives_wire_conversion() {
        let track = VideoTrack::new(3, 9)
            .with_confidence(0.75)
            .with_location(3, ImageLocation::new(1, 1, 10, 10).with_confidence(0.5))
            .with_location(9, ImageLocation::new(2, 2, 10, 10).with_property("CLASS", "car"))
            .with_property("TRACK", "1");
        let msg = VideoTrackMsg::from(&track);
        assert_eq!(msg.frame_locations.len(), 2);
        assert_eq!(VideoTrack::from(msg), track);
    }
}

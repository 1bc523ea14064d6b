//! Detection results produced by components.
//!
//! These are plain values: a component builds them, the response packer
//! copies them verbatim into the outgoing envelope. Every type is
//! serde-serializable so out-of-process components can return them as JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::media::Properties;

fn unset_confidence() -> f32 {
    -1.0
}

/// A bounding box found in one image or video frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLocation {
    pub x_left_upper: i32,
    pub y_left_upper: i32,
    pub width: i32,
    pub height: i32,
    #[serde(default = "unset_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub detection_properties: Properties,
}

impl ImageLocation {
    pub fn new(x_left_upper: i32, y_left_upper: i32, width: i32, height: i32) -> Self {
        Self {
            x_left_upper,
            y_left_upper,
            width,
            height,
            confidence: unset_confidence(),
            detection_properties: Properties::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detection_properties.insert(key.into(), value.into());
        self
    }
}

/// An object followed across a range of video frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTrack {
    pub start_frame: i32,
    pub stop_frame: i32,
    #[serde(default = "unset_confidence")]
    pub confidence: f32,
    /// Frame index to location. Ordered by frame.
    #[serde(default)]
    pub frame_locations: BTreeMap<i32, ImageLocation>,
    #[serde(default)]
    pub detection_properties: Properties,
}

impl VideoTrack {
    pub fn new(start_frame: i32, stop_frame: i32) -> Self {
        Self {
            start_frame,
            stop_frame,
            confidence: unset_confidence(),
            frame_locations: BTreeMap::new(),
            detection_properties: Properties::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_location(mut self, frame: i32, location: ImageLocation) -> Self {
        self.frame_locations.insert(frame, location);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detection_properties.insert(key.into(), value.into());
        self
    }
}

/// A detection spanning a time range (milliseconds) of an audio stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub start_time: i32,
    pub stop_time: i32,
    #[serde(default = "unset_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub detection_properties: Properties,
}

impl AudioTrack {
    pub fn new(start_time: i32, stop_time: i32) -> Self {
        Self {
            start_time,
            stop_time,
            confidence: unset_confidence(),
            detection_properties: Properties::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

/// A detection on media of unknown type. Only carries confidence and
/// properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericTrack {
    #[serde(default = "unset_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub detection_properties: Properties,
}

impl GenericTrack {
    pub fn new(confidence: f32) -> Self {
        Self {
            confidence,
            detection_properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detection_properties.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_confidence_deserializes_as_unset() {
        let loc: ImageLocation = serde_json::from_str(
            r#"{"x_left_upper":1,"y_left_upper":2,"width":3,"height":4}"#,
        )
        .unwrap();
        assert_eq!(loc.confidence, -1.0);
        assert!(loc.detection_properties.is_empty());
    }

    #[test]
    fn video_track_keys_are_frame_ordered() {
        let track = VideoTrack::new(0, 10)
            .with_location(7, ImageLocation::new(0, 0, 1, 1))
            .with_location(2, ImageLocation::new(0, 0, 1, 1));
        let frames: Vec<_> = track.frame_locations.keys().copied().collect();
        assert_eq!(frames, vec![2, 7]);
    }
}

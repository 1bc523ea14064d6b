//! Protobuf request/response envelopes.
//!
//! Message definitions are written out with `prost` derives instead of being
//! generated by a build script, so the crate builds without `protoc`.
//!
//! A request carries exactly one of `video_request`, `image_request`,
//! `audio_request` or `generic_request`; a response carries the matching
//! list of typed responses.

use std::collections::BTreeMap;

/// Wire enum for the media classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MediaDataType {
    Unknown = 0,
    Video = 1,
    Image = 2,
    Audio = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AlgorithmProperty {
    #[prost(string, tag = "1")]
    pub property_name: String,
    #[prost(string, tag = "2")]
    pub property_value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ImageLocationMsg {
    #[prost(int32, tag = "1")]
    pub x_left_upper: i32,
    #[prost(int32, tag = "2")]
    pub y_left_upper: i32,
    #[prost(int32, tag = "3")]
    pub width: i32,
    #[prost(int32, tag = "4")]
    pub height: i32,
    #[prost(float, tag = "5")]
    pub confidence: f32,
    #[prost(btree_map = "string, string", tag = "6")]
    pub detection_properties: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameLocation {
    #[prost(int32, tag = "1")]
    pub frame: i32,
    #[prost(message, optional, tag = "2")]
    pub image_location: Option<ImageLocationMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VideoTrackMsg {
    #[prost(int32, tag = "1")]
    pub start_frame: i32,
    #[prost(int32, tag = "2")]
    pub stop_frame: i32,
    #[prost(float, tag = "3")]
    pub confidence: f32,
    #[prost(message, repeated, tag = "4")]
    pub frame_locations: Vec<FrameLocation>,
    #[prost(btree_map = "string, string", tag = "5")]
    pub detection_properties: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AudioTrackMsg {
    #[prost(int32, tag = "1")]
    pub start_time: i32,
    #[prost(int32, tag = "2")]
    pub stop_time: i32,
    #[prost(float, tag = "3")]
    pub confidence: f32,
    #[prost(btree_map = "string, string", tag = "4")]
    pub detection_properties: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GenericTrackMsg {
    #[prost(float, tag = "1")]
    pub confidence: f32,
    #[prost(btree_map = "string, string", tag = "2")]
    pub detection_properties: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VideoRequest {
    #[prost(int32, tag = "1")]
    pub start_frame: i32,
    #[prost(int32, tag = "2")]
    pub stop_frame: i32,
    #[prost(message, optional, tag = "3")]
    pub feed_forward_track: Option<VideoTrackMsg>,
    /// When set, the job is seeded with every track in
    /// `feed_forward_tracks` instead of a single track.
    #[prost(bool, tag = "4")]
    pub feed_forward_all_tracks: bool,
    #[prost(message, repeated, tag = "5")]
    pub feed_forward_tracks: Vec<VideoTrackMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ImageRequest {
    #[prost(message, optional, tag = "1")]
    pub feed_forward_location: Option<ImageLocationMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AudioRequest {
    #[prost(int32, tag = "1")]
    pub start_time: i32,
    #[prost(int32, tag = "2")]
    pub stop_time: i32,
    #[prost(message, optional, tag = "3")]
    pub feed_forward_track: Option<AudioTrackMsg>,
    #[prost(bool, tag = "4")]
    pub feed_forward_all_tracks: bool,
    #[prost(message, repeated, tag = "5")]
    pub feed_forward_tracks: Vec<AudioTrackMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GenericRequest {
    #[prost(message, optional, tag = "1")]
    pub feed_forward_track: Option<GenericTrackMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DetectionRequest {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(int64, tag = "2")]
    pub media_id: i64,
    #[prost(int32, tag = "3")]
    pub task_index: i32,
    #[prost(string, tag = "4")]
    pub task_name: String,
    #[prost(int32, tag = "5")]
    pub action_index: i32,
    #[prost(string, tag = "6")]
    pub action_name: String,
    #[prost(string, tag = "7")]
    pub media_path: String,
    #[prost(enumeration = "MediaDataType", tag = "8")]
    pub data_type: i32,
    #[prost(message, repeated, tag = "9")]
    pub algorithm_property: Vec<AlgorithmProperty>,
    #[prost(btree_map = "string, string", tag = "10")]
    pub media_metadata: BTreeMap<String, String>,
    #[prost(message, optional, tag = "11")]
    pub video_request: Option<VideoRequest>,
    #[prost(message, optional, tag = "12")]
    pub image_request: Option<ImageRequest>,
    #[prost(message, optional, tag = "13")]
    pub audio_request: Option<AudioRequest>,
    #[prost(message, optional, tag = "14")]
    pub generic_request: Option<GenericRequest>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VideoResponse {
    #[prost(int32, tag = "1")]
    pub start_frame: i32,
    #[prost(int32, tag = "2")]
    pub stop_frame: i32,
    #[prost(string, tag = "3")]
    pub detection_type: String,
    #[prost(message, repeated, tag = "4")]
    pub video_tracks: Vec<VideoTrackMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ImageResponse {
    #[prost(string, tag = "1")]
    pub detection_type: String,
    #[prost(message, repeated, tag = "2")]
    pub image_locations: Vec<ImageLocationMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AudioResponse {
    #[prost(int32, tag = "1")]
    pub start_time: i32,
    #[prost(int32, tag = "2")]
    pub stop_time: i32,
    #[prost(string, tag = "3")]
    pub detection_type: String,
    #[prost(message, repeated, tag = "4")]
    pub audio_tracks: Vec<AudioTrackMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GenericResponse {
    #[prost(string, tag = "1")]
    pub detection_type: String,
    #[prost(message, repeated, tag = "2")]
    pub generic_tracks: Vec<GenericTrackMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DetectionResponse {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    #[prost(int64, tag = "2")]
    pub media_id: i64,
    #[prost(int32, tag = "3")]
    pub task_index: i32,
    #[prost(string, tag = "4")]
    pub task_name: String,
    #[prost(int32, tag = "5")]
    pub action_index: i32,
    #[prost(string, tag = "6")]
    pub action_name: String,
    #[prost(enumeration = "MediaDataType", tag = "7")]
    pub data_type: i32,
    /// Wire value of the error code; `0` means success.
    #[prost(int32, tag = "8")]
    pub error: i32,
    #[prost(string, tag = "9")]
    pub error_message: String,
    #[prost(message, repeated, tag = "10")]
    pub video_responses: Vec<VideoResponse>,
    #[prost(message, repeated, tag = "11")]
    pub image_responses: Vec<ImageResponse>,
    #[prost(message, repeated, tag = "12")]
    pub audio_responses: Vec<AudioResponse>,
    #[prost(message, repeated, tag = "13")]
    pub generic_responses: Vec<GenericResponse>,
}

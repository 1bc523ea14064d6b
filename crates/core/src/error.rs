//! Detection error model.

use thiserror::Error;

/// Result type returned by detection components.
pub type DetectionResult<T> = Result<T, DetectionError>;

/// Structured failure reason reported back to the pipeline.
///
/// The numeric values are part of the wire contract: they are sent as the
/// `error` field of every response envelope, so new codes may only be
/// appended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    #[default]
    DetectionSuccess = 0,
    OtherDetectionErrorType,
    DetectionNotInitialized,
    UnrecognizedDataType,
    UnsupportedDataType,
    InvalidDatafileUri,
    CouldNotOpenDatafile,
    CouldNotReadDatafile,
    FileWriteError,
    ImageReadError,
    BadFrameSize,
    BoundingBoxSizeError,
    InvalidFrameInterval,
    InvalidStartFrame,
    InvalidStopFrame,
    DetectionFailed,
    DetectionTrackingFailed,
    InvalidProperty,
    MissingProperty,
    PropertyIsNotInt,
    PropertyIsNotFloat,
    InvalidRotation,
    MemoryAllocationFailed,
    GpuError,
}

impl ErrorCode {
    const ALL: [ErrorCode; 24] = [
        ErrorCode::DetectionSuccess,
        ErrorCode::OtherDetectionErrorType,
        ErrorCode::DetectionNotInitialized,
        ErrorCode::UnrecognizedDataType,
        ErrorCode::UnsupportedDataType,
        ErrorCode::InvalidDatafileUri,
        ErrorCode::CouldNotOpenDatafile,
        ErrorCode::CouldNotReadDatafile,
        ErrorCode::FileWriteError,
        ErrorCode::ImageReadError,
        ErrorCode::BadFrameSize,
        ErrorCode::BoundingBoxSizeError,
        ErrorCode::InvalidFrameInterval,
        ErrorCode::InvalidStartFrame,
        ErrorCode::InvalidStopFrame,
        ErrorCode::DetectionFailed,
        ErrorCode::DetectionTrackingFailed,
        ErrorCode::InvalidProperty,
        ErrorCode::MissingProperty,
        ErrorCode::PropertyIsNotInt,
        ErrorCode::PropertyIsNotFloat,
        ErrorCode::InvalidRotation,
        ErrorCode::MemoryAllocationFailed,
        ErrorCode::GpuError,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a wire value back to a code. Unknown values become
    /// `OtherDetectionErrorType`.
    pub fn from_i32(value: i32) -> Self {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .unwrap_or(ErrorCode::OtherDetectionErrorType)
    }

    /// Upper snake case name, as used in logs and component replies.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::DetectionSuccess => "DETECTION_SUCCESS",
            ErrorCode::OtherDetectionErrorType => "OTHER_DETECTION_ERROR_TYPE",
            ErrorCode::DetectionNotInitialized => "DETECTION_NOT_INITIALIZED",
            ErrorCode::UnrecognizedDataType => "UNRECOGNIZED_DATA_TYPE",
            ErrorCode::UnsupportedDataType => "UNSUPPORTED_DATA_TYPE",
            ErrorCode::InvalidDatafileUri => "INVALID_DATAFILE_URI",
            ErrorCode::CouldNotOpenDatafile => "COULD_NOT_OPEN_DATAFILE",
            ErrorCode::CouldNotReadDatafile => "COULD_NOT_READ_DATAFILE",
            ErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            ErrorCode::ImageReadError => "IMAGE_READ_ERROR",
            ErrorCode::BadFrameSize => "BAD_FRAME_SIZE",
            ErrorCode::BoundingBoxSizeError => "BOUNDING_BOX_SIZE_ERROR",
            ErrorCode::InvalidFrameInterval => "INVALID_FRAME_INTERVAL",
            ErrorCode::InvalidStartFrame => "INVALID_START_FRAME",
            ErrorCode::InvalidStopFrame => "INVALID_STOP_FRAME",
            ErrorCode::DetectionFailed => "DETECTION_FAILED",
            ErrorCode::DetectionTrackingFailed => "DETECTION_TRACKING_FAILED",
            ErrorCode::InvalidProperty => "INVALID_PROPERTY",
            ErrorCode::MissingProperty => "MISSING_PROPERTY",
            ErrorCode::PropertyIsNotInt => "PROPERTY_IS_NOT_INT",
            ErrorCode::PropertyIsNotFloat => "PROPERTY_IS_NOT_FLOAT",
            ErrorCode::InvalidRotation => "INVALID_ROTATION",
            ErrorCode::MemoryAllocationFailed => "MEMORY_ALLOCATION_FAILED",
            ErrorCode::GpuError => "GPU_ERROR",
        }
    }

    /// Inverse of [`ErrorCode::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure raised by a detection component while processing a job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct DetectionError {
    pub code: ErrorCode,
    pub message: String,
}

impl DetectionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OtherDetectionErrorType, message)
    }

    pub fn missing_property(name: &str) -> Self {
        Self::new(
            ErrorCode::MissingProperty,
            format!("The \"{name}\" property was not set."),
        )
    }

    pub fn invalid_property(name: &str, value: &str) -> Self {
        Self::new(
            ErrorCode::InvalidProperty,
            format!("The \"{name}\" property has an invalid value of \"{value}\"."),
        )
    }
}

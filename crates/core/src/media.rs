//! Media classification and property maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// String-to-string properties attached to jobs, media and detections.
///
/// Ordered so that encoded envelopes and logs are deterministic.
pub type Properties = BTreeMap<String, String>;

/// Media classification assigned upstream by the workflow manager.
///
/// `Unknown` media is dispatched to the generic detection entry point.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Unknown,
    Video,
    Image,
    Audio,
}

impl DataType {
    pub const ALL: [DataType; 4] = [
        DataType::Video,
        DataType::Image,
        DataType::Audio,
        DataType::Unknown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DataType::Unknown => "UNKNOWN",
            DataType::Video => "VIDEO",
            DataType::Image => "IMAGE",
            DataType::Audio => "AUDIO",
        }
    }

    /// Case-insensitive parse. `GENERIC` is accepted as an alias for
    /// `UNKNOWN`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "VIDEO" => Some(DataType::Video),
            "IMAGE" => Some(DataType::Image),
            "AUDIO" => Some(DataType::Audio),
            "UNKNOWN" | "GENERIC" => Some(DataType::Unknown),
            _ => None,
        }
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(DataType::parse(" iMaGe "), Some(DataType::Image));
        assert_eq!(DataType::parse("generic"), Some(DataType::Unknown));
        assert_eq!(DataType::parse("HELLO"), None);
    }
}

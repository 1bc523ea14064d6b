//! Media-type restriction for the request consumer.

use batchexec_core::DataType;

use crate::broker::BrokerMessage;

/// Name of the environment variable holding the allow-list.
pub const RESTRICT_MEDIA_TYPES_ENV: &str = "RESTRICT_MEDIA_TYPES";

/// Broker property the workflow manager stamps on every request.
pub const MEDIA_TYPE_PROPERTY: &str = "MediaType";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Expected the {RESTRICT_MEDIA_TYPES_ENV} environment variable contain a comma-separated list \
     containing one or more of: VIDEO, IMAGE, AUDIO, UNKNOWN. Invalid entry: \"{token}\""
)]
pub struct SelectorError {
    pub token: String,
}

/// Optional allow-list of media types a consumer accepts.
///
/// An empty filter accepts everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaTypeFilter {
    types: Vec<DataType>,
}

impl MediaTypeFilter {
    /// Filter that accepts every message.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn only(types: impl IntoIterator<Item = DataType>) -> Self {
        let mut filter = Self::default();
        for t in types {
            if !filter.types.contains(&t) {
                filter.types.push(t);
            }
        }
        filter
    }

    /// Parse a comma-separated list such as `" VIDEO,  IMaGe ,  audio,"`.
    ///
    /// Entries are trimmed and upper-cased, blank entries are skipped, and
    /// an absent or blank value yields an empty filter.
    pub fn parse(value: Option<&str>) -> Result<Self, SelectorError> {
        let Some(value) = value else {
            return Ok(Self::any());
        };

        let mut types = Vec::new();
        for raw in value.split(',') {
            let token = raw.trim().to_ascii_uppercase();
            if token.is_empty() {
                continue;
            }
            let data_type = match token.as_str() {
                "VIDEO" => DataType::Video,
                "IMAGE" => DataType::Image,
                "AUDIO" => DataType::Audio,
                "UNKNOWN" => DataType::Unknown,
                _ => return Err(SelectorError { token }),
            };
            types.push(data_type);
        }
        Ok(Self::only(types))
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn media_types(&self) -> &[DataType] {
        &self.types
    }

    /// Broker selector expression, e.g. `MediaType in ('VIDEO', 'IMAGE')`.
    pub fn selector(&self) -> Option<String> {
        if self.types.is_empty() {
            return None;
        }
        let quoted: Vec<String> = self
            .types
            .iter()
            .map(|t| format!("'{}'", t.name()))
            .collect();
        Some(format!("{MEDIA_TYPE_PROPERTY} in ({})", quoted.join(", ")))
    }

    pub fn accepts(&self, data_type: DataType) -> bool {
        self.types.is_empty() || self.types.contains(&data_type)
    }

    /// Evaluate the selector against a message. Messages without a
    /// `MediaType` property never match a non-empty filter.
    pub fn matches(&self, message: &BrokerMessage) -> bool {
        if self.types.is_empty() {
            return true;
        }
        message
            .string_property(MEDIA_TYPE_PROPERTY)
            .is_some_and(|value| self.types.iter().any(|t| t.name() == value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mixed_case_and_whitespace_are_normalized() {
        let filter = MediaTypeFilter::parse(Some(" VIDEO,  IMaGe ,  audio,")).unwrap();
        assert_eq!(
            filter.selector().as_deref(),
            Some("MediaType in ('VIDEO', 'IMAGE', 'AUDIO')")
        );
    }

    #[test]
    fn unknown_token_is_rejected() {
        let err = MediaTypeFilter::parse(Some("HELLO")).unwrap_err();
        assert_eq!(err.token, "HELLO");
        assert!(err.to_string().contains("VIDEO, IMAGE, AUDIO, UNKNOWN"));
    }

    #[test]
    fn generic_is_not_an_accepted_token() {
        assert!(MediaTypeFilter::parse(Some("GENERIC")).is_err());
    }

    #[test]
    fn blank_values_disable_filtering() {
        for value in [None, Some(""), Some(" , ,, "), Some(",")] {
            let filter = MediaTypeFilter::parse(value).unwrap();
            assert!(filter.is_empty());
            assert_eq!(filter.selector(), None);
        }
    }

    #[test]
    fn matches_on_media_type_property() {
        let filter = MediaTypeFilter::only([DataType::Video]);
        let video = BrokerMessage::bytes(Vec::new()).with_string_property("MediaType", "VIDEO");
        let image = BrokerMessage::bytes(Vec::new()).with_string_property("MediaType", "IMAGE");
        let untagged = BrokerMessage::bytes(Vec::new());

        assert!(filter.matches(&video));
        assert!(!filter.matches(&image));
        assert!(!filter.matches(&untagged));
        assert!(MediaTypeFilter::any().matches(&untagged));
    }

    fn token() -> impl Strategy<Value = (DataType, String)> {
        (
            prop::sample::select(DataType::ALL.to_vec()),
            prop::collection::vec(any::<bool>(), 7),
            "[ \t]{0,3}",
            "[ \t]{0,3}",
        )
            .prop_map(|(t, upper, pre, post)| {
                let cased: String = t
                    .name()
                    .chars()
                    .zip(upper.iter().cycle())
                    .map(|(c, up)| if *up { c } else { c.to_ascii_lowercase() })
                    .collect();
                (t, format!("{pre}{cased}{post}"))
            })
    }

    proptest! {
        #[test]
        fn selector_lists_each_parsed_type_once(tokens in prop::collection::vec(token(), 1..8)) {
            let raw = tokens.iter().map(|(_, s)| s.as_str()).collect::<Vec<_>>().join(",");
            let filter = MediaTypeFilter::parse(Some(&raw)).unwrap();

            let mut expected = Vec::new();
            for (t, _) in &tokens {
                if !expected.contains(t) {
                    expected.push(*t);
                }
            }
            prop_assert_eq!(filter.media_types(), expected.as_slice());

            let selector = filter.selector().unwrap();
            for t in &expected {
                let needle = format!("'{}'", t.name());
                prop_assert_eq!(selector.matches(needle.as_str()).count(), 1);
            }
        }
    }
}

//! Dotted hierarchical topic names and wildcard filters.
//!
//! A topic is a non-empty string of at most 250 characters, split on `.` into
//! segments of at most 128 characters each. In a filter pattern, a segment
//! consisting of the single character `*` matches exactly one segment of the
//! subject topic, and a trailing `>` matches all remaining segments
//! (including none). A segment longer than one character may not contain
//! either wildcard character.

use std::fmt::{Display, Formatter};

use crate::error::{BusError, BusResult};

pub const MAX_TOPIC_LEN: usize = 250;
pub const MAX_SEGMENT_LEN: usize = 128;

/// Split a topic into its segments, validating the segmenter rules.
pub fn segments(topic: &str) -> BusResult<Vec<&str>> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(BusError::MalformedTopic(format!(
            "length {} is outside 1..={}", topic.len(), MAX_TOPIC_LEN
        )));
    }

    let segments: Vec<&str> = topic.split('.').collect();
    for segment in &segments {
        if segment.len() > MAX_SEGMENT_LEN {
            return Err(BusError::MalformedTopic(format!(
                "segment {:?} is longer than {} characters", segment, MAX_SEGMENT_LEN
            )));
        }
        if segment.len() > 1 && (segment.contains('*') || segment.contains('>')) {
            return Err(BusError::MalformedTopic(format!(
                "wildcard inside multi-character segment {:?}", segment
            )));
        }
    }
    Ok(segments)
}

/// Check that a topic names a single concrete channel, i.e. contains no
/// wildcard segments. Publishing requires this; subscribing does not.
pub fn require_concrete(topic: &str) -> BusResult<Vec<&str>> {
    let segments = segments(topic)?;
    if segments.iter().any(|s| *s == "*" || *s == ">") {
        return Err(BusError::MalformedTopic(format!(
            "topic {:?} contains wildcard segments", topic
        )));
    }
    Ok(segments)
}

#[derive(Clone, Eq, PartialEq, Debug)]
enum FilterSegment {
    Literal(String),
    /// `*` - exactly one segment
    AnyOne,
    /// `>` - all remaining segments, including none
    Rest,
}

/// A compiled topic pattern. Immutable after construction.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct TopicFilter {
    segments: Vec<FilterSegment>,
}

impl TopicFilter {
    pub fn parse(pattern: &str) -> BusResult<TopicFilter> {
        let raw = segments(pattern)?;

        let mut compiled = Vec::with_capacity(raw.len());
        for (i, segment) in raw.iter().enumerate() {
            let compiled_segment = match *segment {
                "*" => FilterSegment::AnyOne,
                ">" => {
                    if i + 1 != raw.len() {
                        return Err(BusError::MalformedTopic(format!(
                            "'>' is only valid as the last segment of {:?}", pattern
                        )));
                    }
                    FilterSegment::Rest
                }
                literal => FilterSegment::Literal(literal.to_owned()),
            };
            compiled.push(compiled_segment);
        }

        Ok(TopicFilter { segments: compiled })
    }

    /// Match against a pre-segmented subject topic. This is the dispatch hot
    /// path - a plain left-to-right array scan, no allocation.
    pub fn matches(&self, subject: &[&str]) -> bool {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                FilterSegment::Rest => return true,
                FilterSegment::AnyOne => {
                    if i >= subject.len() {
                        return false;
                    }
                }
                FilterSegment::Literal(literal) => {
                    if i >= subject.len() || literal != subject[i] {
                        return false;
                    }
                }
            }
        }
        subject.len() == self.segments.len()
    }

    /// Convenience for callers holding an unsegmented topic.
    pub fn matches_topic(&self, topic: &str) -> bool {
        match segments(topic) {
            Ok(subject) => self.matches(&subject),
            Err(_) => false,
        }
    }
}

impl Display for TopicFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match segment {
                FilterSegment::Literal(literal) => write!(f, "{}", literal)?,
                FilterSegment::AnyOne => write!(f, "*")?,
                FilterSegment::Rest => write!(f, ">")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a", vec!["a"])]
    #[case("a.b.c", vec!["a", "b", "c"])]
    #[case("metrics.cpu", vec!["metrics", "cpu"])]
    #[case("a..b", vec!["a", "", "b"])]
    #[case("*.b", vec!["*", "b"])]
    #[case("a.>", vec!["a", ">"])]
    fn test_segments(#[case] topic: &str, #[case] expected: Vec<&str>) {
        assert_eq!(segments(topic).unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::too_long(&"x".repeat(251))]
    #[case::wildcard_in_segment("a.too*long")]
    #[case::terminal_in_segment("a.ste>")]
    #[case::segment_too_long(&format!("a.{}", "y".repeat(129)))]
    fn test_segments_malformed(#[case] topic: &str) {
        assert!(matches!(segments(topic), Err(BusError::MalformedTopic(_))));
    }

    #[test]
    fn test_segments_accepts_max_lengths() {
        // a 250-character topic with a 128-character segment is still legal
        let long_segment = "s".repeat(128);
        assert!(segments(&long_segment).is_ok());
        let topic = format!("{}.{}", "t".repeat(121), long_segment);
        assert_eq!(topic.len(), 250);
        assert!(segments(&topic).is_ok());
    }

    #[rstest]
    #[case("a.b.c")]
    #[case("a..c")]
    fn test_segments_roundtrip(#[case] topic: &str) {
        assert_eq!(segments(topic).unwrap().join("."), topic);
    }

    #[rstest]
    #[case("metrics.cpu")]
    #[case("a.b")]
    fn test_require_concrete_ok(#[case] topic: &str) {
        assert!(require_concrete(topic).is_ok());
    }

    #[rstest]
    #[case("a.*")]
    #[case(">")]
    fn test_require_concrete_rejects_wildcards(#[case] topic: &str) {
        assert!(matches!(require_concrete(topic), Err(BusError::MalformedTopic(_))));
    }

    #[rstest]
    #[case("a.b.c", ">", true)]
    #[case("a.b.c", "a.*.c", true)]
    #[case("a.b.c", "a.*.d", false)]
    #[case("a.b", "a.b.c", false)]
    #[case("a.b.c.d", "a.b.>", true)]
    #[case("a.b.c", "a.b.c", true)]
    #[case("a.b.c", "a.b", false)]
    #[case("a.b.c", "*.*.*", true)]
    #[case("a.b.c", "*.*", false)]
    // '>' matches zero remaining segments as well
    #[case("a", "a.>", true)]
    #[case("a.b", "a.>", true)]
    #[case("b", "a.>", false)]
    fn test_matches(#[case] topic: &str, #[case] pattern: &str, #[case] expected: bool) {
        let filter = TopicFilter::parse(pattern).unwrap();
        assert_eq!(filter.matches_topic(topic), expected, "{:?} vs {:?}", topic, pattern);
    }

    #[test]
    fn test_parse_rejects_inner_terminal_wildcard() {
        assert!(matches!(TopicFilter::parse("a.>.b"), Err(BusError::MalformedTopic(_))));
    }

    #[rstest]
    #[case("a.b.c")]
    #[case("a.*.>")]
    #[case("*")]
    fn test_display_roundtrip(#[case] pattern: &str) {
        let filter = TopicFilter::parse(pattern).unwrap();
        assert_eq!(filter.to_string(), pattern);
    }
}

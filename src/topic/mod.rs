//! Topic patterns
//!
//! Subscription filters are parsed once, at subscribe time, into a validated
//! [`TopicPattern`]. Matching against concrete topics then walks the parsed
//! segments without re-validating the filter string.

pub mod validation;

use std::fmt;
use std::str::FromStr;

pub use validation::{validate_topic_filter, validate_topic_name};

use crate::error::BridgeError;

/// One level of a topic pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Must equal the topic level exactly
    Literal(String),
    /// Single-level wildcard (+), matches exactly one level
    SingleLevel,
    /// Multi-level wildcard (#), matches all remaining levels (zero or more)
    MultiLevel,
}

/// A validated subscription filter
///
/// Invariant: [`Segment::MultiLevel`] only ever appears as the last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    filter: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse and validate a filter string such as `sensors/+/temp` or `#`
    pub fn parse(filter: &str) -> Result<Self, BridgeError> {
        validation::validate_topic_filter(filter).map_err(|reason| {
            BridgeError::InvalidPattern {
                pattern: filter.to_string(),
                reason,
            }
        })?;

        let segments = filter
            .split('/')
            .map(|level| match level {
                "+" => Segment::SingleLevel,
                "#" => Segment::MultiLevel,
                s => Segment::Literal(s.to_string()),
            })
            .collect();

        Ok(Self {
            filter: filter.to_string(),
            segments,
        })
    }

    /// Pattern matching every topic (`#`)
    pub fn match_all() -> Self {
        Self {
            filter: "#".to_string(),
            segments: vec![Segment::MultiLevel],
        }
    }

    /// Original filter string, as sent to the transport
    pub fn as_str(&self) -> &str {
        &self.filter
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Check whether a concrete topic matches this pattern
    ///
    /// - a literal segment must equal the topic level
    /// - `+` consumes exactly one topic level
    /// - `#` matches the remainder, including nothing
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');

        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }

        // Both must be exhausted for a match
        levels.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter)
    }
}

impl FromStr for TopicPattern {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn matches(filter: &str, topic: &str) -> bool {
        TopicPattern::parse(filter).unwrap().matches(topic)
    }

    #[test]
    fn test_parse_segments() {
        let pattern = TopicPattern::parse("dwm/+/uplink/#").unwrap();
        assert_eq!(
            pattern.segments(),
            &[
                Segment::Literal("dwm".to_string()),
                Segment::SingleLevel,
                Segment::Literal("uplink".to_string()),
                Segment::MultiLevel,
            ]
        );
        assert_eq!(pattern.as_str(), "dwm/+/uplink/#");
        assert!(pattern.has_wildcards());
        assert!(!TopicPattern::parse("a/b").unwrap().has_wildcards());
    }

    #[test]
    fn test_parse_rejects_non_final_multi_level() {
        let err = TopicPattern::parse("a/#/b").unwrap_err();
        assert_eq!(
            err,
            BridgeError::InvalidPattern {
                pattern: "a/#/b".to_string(),
                reason: "multi-level wildcard must be last level",
            }
        );
        assert!(TopicPattern::parse("#/a").is_err());
        assert!(TopicPattern::parse("").is_err());
    }

    #[test]
    fn test_topic_matches() {
        // Exact matches
        assert!(matches("test", "test"));
        assert!(matches("test/topic", "test/topic"));
        assert!(!matches("test/topic", "test"));
        assert!(!matches("test", "test/topic"));

        // Single-level wildcard
        assert!(matches("test/+", "test/topic"));
        assert!(matches("+/topic", "test/topic"));
        assert!(matches("+/b/+", "a/b/c"));
        assert!(matches("a/+", "a/"));
        assert!(!matches("+/+", "test"));
        assert!(!matches("test/+", "test/topic/extra"));

        // Multi-level wildcard
        assert!(matches("#", "a/b/c"));
        assert!(matches("#", "test"));
        assert!(matches("test/#", "test"));
        assert!(matches("test/#", "test/topic/more"));
        assert!(!matches("test/#", "other/topic"));
    }

    #[test]
    fn test_match_all() {
        let all = TopicPattern::match_all();
        assert_eq!(all, TopicPattern::parse("#").unwrap());
        assert!(all.matches("a/b/c"));
        assert!(all.matches("/leading/slash"));
    }

    /// Reference rule written over level slices, independent of the parser
    fn reference_match(filter: &[&str], topic: &[&str]) -> bool {
        match (filter.split_first(), topic.split_first()) {
            (Some((&"#", _)), _) => true,
            (Some((&"+", f_rest)), Some((_, t_rest))) => reference_match(f_rest, t_rest),
            (Some((f, f_rest)), Some((t, t_rest))) => f == t && reference_match(f_rest, t_rest),
            (None, None) => true,
            _ => false,
        }
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof!["[ab]{0,1}", Just("c".to_string())]
    }

    fn filter_level() -> impl Strategy<Value = String> {
        prop_oneof![level(), Just("+".to_string())]
    }

    proptest! {
        #[test]
        fn prop_matches_agrees_with_rule(
            mut filter in prop::collection::vec(filter_level(), 1..5),
            multi in any::<bool>(),
            topic in prop::collection::vec(level(), 1..6),
        ) {
            if multi {
                filter.push("#".to_string());
            }
            let filter_str = filter.join("/");
            prop_assume!(!filter_str.is_empty());
            let topic_str = topic.join("/");
            let filter_levels: Vec<&str> = filter.iter().map(String::as_str).collect();
            let topic_levels: Vec<&str> = topic.iter().map(String::as_str).collect();

            let pattern = TopicPattern::parse(&filter_str).unwrap();
            prop_assert_eq!(
                pattern.matches(&topic_str),
                reference_match(&filter_levels, &topic_levels)
            );
        }

        #[test]
        fn prop_non_final_multi_level_rejected(
            prefix in prop::collection::vec(filter_level(), 0..3),
            suffix in prop::collection::vec(filter_level(), 1..3),
        ) {
            let mut levels = prefix;
            levels.push("#".to_string());
            levels.extend(suffix);
            prop_assert!(TopicPattern::parse(&levels.join("/")).is_err());
        }
    }
}

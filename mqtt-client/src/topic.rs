use std::error::Error as StdError;

use derive_more::Display;

/// A topic filter that cannot be compiled: a wildcard does not occupy a
/// whole level, or `#` is not the last level.
#[derive(Debug, Display, PartialEq)]
#[display(fmt = "invalid topic filter `{}`", _0)]
pub struct InvalidTopicFilter(pub String);

impl StdError for InvalidTopicFilter {}

#[derive(Debug, Clone, PartialEq)]
enum FilterLevel {
    Literal(String),
    /// `+` matches exactly one level, captured.
    Single,
    /// A trailing `#` matches the remainder, captured.
    Multi,
}

/// A topic filter compiled for repeated matching against topic names.
///
/// A `$share/<group>/` prefix is stripped before compilation; the group
/// takes no part in matching.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMatcher {
    filter: String,
    levels: Vec<FilterLevel>,
}

impl TopicMatcher {
    pub fn new(filter: &str) -> Result<Self, InvalidTopicFilter> {
        let pattern = strip_shared_prefix(filter);
        let segments: Vec<&str> = pattern.split('/').collect();
        let mut levels = Vec::with_capacity(segments.len());

        for (pos, segment) in segments.iter().enumerate() {
            match *segment {
                "+" => levels.push(FilterLevel::Single),
                "#" if pos + 1 == segments.len() => levels.push(FilterLevel::Multi),
                s if s.contains('+') || s.contains('#') => {
                    return Err(InvalidTopicFilter(filter.to_owned()));
                }
                s => levels.push(FilterLevel::Literal(s.to_owned())),
            }
        }

        Ok(TopicMatcher {
            filter: filter.to_owned(),
            levels,
        })
    }

    /// The filter this matcher was compiled from, shared-subscription prefix
    /// included.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Whether the topic name matches, anchored at both ends.
    pub fn matches(&self, topic_name: &str) -> bool {
        self.captures(topic_name).is_some()
    }

    /// The level(s) each wildcard consumed, in filter order. Empty for
    /// filters without wildcards or for non-matching topic names.
    pub fn matched_wildcards(&self, topic_name: &str) -> Vec<String> {
        self.captures(topic_name).unwrap_or_default()
    }

    fn captures(&self, topic_name: &str) -> Option<Vec<String>> {
        let mut captures = Vec::new();
        let mut segments = topic_name.split('/');

        for level in &self.levels {
            match level {
                FilterLevel::Literal(literal) => match segments.next() {
                    Some(segment) if segment == literal => {}
                    _ => return None,
                },
                FilterLevel::Single => match segments.next() {
                    Some(segment) => captures.push(segment.to_owned()),
                    None => return None,
                },
                FilterLevel::Multi => {
                    // the separator in front of `#` must be present in the
                    // topic, so at least one (possibly empty) level remains
                    let remainder: Vec<&str> = segments.collect();
                    if remainder.is_empty() {
                        return None;
                    }
                    captures.push(remainder.join("/"));
                    return Some(captures);
                }
            }
        }

        if segments.next().is_some() {
            None
        } else {
            Some(captures)
        }
    }
}

fn strip_shared_prefix(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.splitn(2, '/').nth(1))
        .unwrap_or(filter)
}

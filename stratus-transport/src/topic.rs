//! Topic filter normalization and wildcard matching.
//!
//! Filters follow MQTT rules: `+` matches exactly one level, `#` matches
//! the parent level and everything below it and must be the last level.

use stratus_core::TransportError;

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Trim trailing separators and validate wildcard placement.
pub fn normalize_filter(filter: &str) -> Result<String, TransportError> {
    let trimmed = filter.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(TransportError::InvalidTopic(filter.to_string()));
    }

    let levels: Vec<&str> = trimmed.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let wildcard = *level == SINGLE_LEVEL || *level == MULTI_LEVEL;
        if !wildcard && (level.contains('+') || level.contains('#')) {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
        if *level == MULTI_LEVEL && i + 1 != levels.len() {
            return Err(TransportError::InvalidTopic(filter.to_string()));
        }
    }
    Ok(trimmed.to_string())
}

/// Check that a topic is publishable: non-empty and free of wildcards.
pub fn validate_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(TransportError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Whether a concrete topic matches a (normalized) filter.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

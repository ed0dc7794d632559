//! Per-call context.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Key-value pairs carried as transport user properties.
pub type Metadata = HashMap<String, String>;

/// Transport property carrying [`Context::correlation_id`] on requests.
pub const CONTEXT_ID_PROPERTY: &str = "context-id";

/// Context shared by the calls of one logical operation.
///
/// Provides:
/// - A correlation id published with every request made under the
///   context; each call still gets a fresh request id of its own
/// - An optional deadline; an expired call is cancelled and its
///   response subscription released
/// - Custom metadata, published alongside the request
#[derive(Debug, Clone)]
pub struct Context {
    /// Id of the operation, sent as [`CONTEXT_ID_PROPERTY`].
    pub correlation_id: Uuid,

    /// Absolute deadline. `None` waits until cancelled.
    pub deadline: Option<Instant>,

    /// Custom key-value metadata.
    pub metadata: Metadata,
}

impl Context {
    /// Create a new context with a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            deadline: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a context with a timeout from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }

    /// Create a context with an absolute deadline.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new().deadline(deadline)
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a timeout from now.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Remaining time until the deadline.
    /// Returns `None` if no deadline is set or the deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .and_then(|d| d.checked_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Context for a nested call: fresh id, inherited deadline and metadata.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let ctx = Context::new();
        assert!(!ctx.correlation_id.is_nil());
        assert!(ctx.deadline.is_none());
        assert!(!ctx.is_expired());
    }

    #[test]
    fn test_context_with_timeout() {
        let ctx = Context::with_timeout(Duration::from_secs(10));
        assert!(ctx.deadline.is_some());
        assert!(!ctx.is_expired());
        assert!(ctx.remaining().is_some());
    }

    #[test]
    fn test_expired_deadline() {
        let ctx = Context::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.is_expired());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_child_context() {
        let parent = Context::with_timeout(Duration::from_secs(5)).with_metadata("tenant", "a");
        let child = parent.child();

        assert_ne!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.deadline, parent.deadline);
        assert_eq!(child.get_metadata("tenant"), Some("a"));
        assert_eq!(child.get_metadata("missing"), None);
    }
}

//! Hierarchical scopes and the topics derived from them.

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Suffix of the base request topic of an RPC service.
pub const RPC_SUFFIX: &str = "rpc";

/// A hierarchical address such as `/home/kitchen/light/`.
///
/// Scopes compose by concatenation. The topic string is the components
/// joined by `/` without leading or trailing separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Scope {
    components: Vec<String>,
}

impl Scope {
    /// The root scope `/`.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a scope from its components.
    pub fn new<I, S>(components: I) -> Result<Self, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components = components
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>();
        for component in &components {
            validate_component(component)?;
        }
        Ok(Self { components })
    }

    /// Parse the `/a/b/` string form. Empty segments are skipped.
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        Self::new(s.split('/').filter(|c| !c.is_empty()))
    }

    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.components
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Append `other` below this scope.
    #[must_use]
    pub fn concat(&self, other: &Scope) -> Self {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Self { components }
    }

    /// Append a single component.
    pub fn child(&self, component: impl Into<String>) -> Result<Self, TransportError> {
        let component = component.into();
        validate_component(&component)?;
        let mut components = self.components.clone();
        components.push(component);
        Ok(Self { components })
    }

    /// Topic for plain publish/subscribe on this scope.
    #[must_use]
    pub fn topic(&self) -> String {
        self.components.join("/")
    }

    /// Base request topic of an RPC service on this scope.
    #[must_use]
    pub fn rpc_topic(&self) -> String {
        join_topic(&self.topic(), RPC_SUFFIX)
    }

    /// Per-call response topic for a correlation id.
    #[must_use]
    pub fn response_topic(&self, id: &uuid::Uuid) -> String {
        join_topic(&self.rpc_topic(), &id.to_string())
    }
}

fn join_topic(base: &str, leaf: &str) -> String {
    if base.is_empty() {
        leaf.to_string()
    } else {
        format!("{base}/{leaf}")
    }
}

fn validate_component(component: &str) -> Result<(), TransportError> {
    if component.is_empty() {
        return Err(TransportError::InvalidTopic(
            "scope component must not be empty".into(),
        ));
    }
    if let Some(c) = component
        .chars()
        .find(|c| matches!(c, '/' | '+' | '#' | '\0'))
    {
        return Err(TransportError::InvalidTopic(format!(
            "scope component {component:?} contains reserved character {c:?}"
        )));
    }
    Ok(())
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        for component in &self.components {
            write!(f, "{component}/")?;
        }
        Ok(())
    }
}

impl FromStr for Scope {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

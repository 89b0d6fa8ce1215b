//! Endpoint-to-capability classification.
//!
//! A capability is a named quota bucket that upstream enforces per user,
//! independent of the literal path that spends it.

use std::fmt;

use crate::endpoints::PathPattern;
use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Like,
    Superlike,
    Boost,
    Custom(String),
}

impl Capability {
    pub fn name(&self) -> &str {
        match self {
            Capability::Like => "like",
            Capability::Superlike => "superlike",
            Capability::Boost => "boost",
            Capability::Custom(name) => name,
        }
    }

    /// Human-facing label used in rejection messages.
    pub fn label(&self) -> &str {
        match self {
            Capability::Like => "Like",
            Capability::Superlike => "Super like",
            Capability::Boost => "Boost",
            Capability::Custom(name) => name,
        }
    }

    pub fn exceeded_message(&self) -> String {
        format!("{} rate limit exceeded", self.label())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered list of `(pattern, capability)` pairs; the first match wins.
#[derive(Debug, Clone)]
pub struct CapabilityClassifier {
    rules: Vec<(PathPattern, Capability)>,
}

impl CapabilityClassifier {
    pub fn new(rules: &[(&str, Capability)]) -> Result<Self, GatewayError> {
        let rules = rules
            .iter()
            .map(|(template, capability)| Ok((PathPattern::new(template)?, capability.clone())))
            .collect::<Result<Vec<_>, GatewayError>>()?;
        Ok(Self { rules })
    }

    pub fn classify(&self, endpoint: &str) -> Option<Capability> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(endpoint))
            .map(|(_, capability)| capability.clone())
    }
}

impl Default for CapabilityClassifier {
    fn default() -> Self {
        let rules = [
            ("/like/{id}/super", Capability::Superlike),
            ("/like/{id}", Capability::Like),
            ("/boost", Capability::Boost),
        ];
        Self::new(&rules).unwrap_or(Self { rules: Vec::new() })
    }
}

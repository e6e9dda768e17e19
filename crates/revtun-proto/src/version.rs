//! Agent version handling

use std::cmp::Ordering;
use thiserror::Error;

/// First agent version that answers `tunnel_allowed` requests
pub const POLICY_CHECK_MIN_VERSION: &str = "0.6.4";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid agent version: {0}")]
pub struct VersionError(pub String);

/// Dotted numeric version; pre-release and build suffixes are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentVersion {
    parts: Vec<u64>,
}

impl AgentVersion {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim().trim_start_matches('v');
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        if core.is_empty() {
            return Err(VersionError(input.to_string()));
        }

        let parts = core
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VersionError(input.to_string()))?;

        Ok(Self { parts })
    }

    /// Whether the agent can be asked about tunnel policies
    pub fn supports_policy_check(&self) -> bool {
        match AgentVersion::parse(POLICY_CHECK_MIN_VERSION) {
            Ok(min) => *self >= min,
            Err(_) => false,
        }
    }
}

impl PartialOrd for AgentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

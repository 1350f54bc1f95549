//! Common identifier types used across the ingest crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MrtError;

/// Prefix carried by every locally minted job identifier.
pub const JOB_ID_PREFIX: &str = "jid-";

/// Prefix carried by every locally minted batch identifier.
pub const BATCH_ID_PREFIX: &str = "bid-";

/// Scope an identifier is valid in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdNamespace {
    /// Persistent identifier minted by an external service (ARK, DOI, ...)
    Global,
    /// Identifier meaningful only inside one owner's collection
    Local,
}

/// Opaque object identifier scoped to a namespace.
///
/// # Examples
///
/// ```rust
/// use mrt_common::types::{Identifier, IdNamespace};
///
/// let id = Identifier::global("ark:/13030/m5test");
/// assert_eq!(id.namespace, IdNamespace::Global);
/// assert_eq!(id.to_string(), "ark:/13030/m5test");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub namespace: IdNamespace,
    pub value: String,
}

impl Identifier {
    pub fn global(value: impl Into<String>) -> Self {
        Self {
            namespace: IdNamespace::Global,
            value: value.into(),
        }
    }

    pub fn local(value: impl Into<String>) -> Self {
        Self {
            namespace: IdNamespace::Local,
            value: value.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

fn mint(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4().simple())
}

fn parse_prefixed(s: &str, prefix: &str) -> Result<String, MrtError> {
    match s.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
            Ok(s.to_string())
        },
        _ => Err(MrtError::InvalidIdentifier(format!(
            "expected identifier with prefix '{}', got '{}'",
            prefix, s
        ))),
    }
}

/// Locally minted job identifier (`jid-...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh, never reused job identifier
    pub fn generate() -> Self {
        Self(mint(JOB_ID_PREFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = MrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, JOB_ID_PREFIX).map(Self)
    }
}

impl TryFrom<String> for JobId {
    type Error = MrtError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locally minted batch identifier (`bid-...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchId(String);

impl BatchId {
    /// Mint a fresh, never reused batch identifier
    pub fn generate() -> Self {
        Self(mint(BATCH_ID_PREFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BatchId {
    type Err = MrtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, BATCH_ID_PREFIX).map(Self)
    }
}

impl TryFrom<String> for BatchId {
    type Error = MrtError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BatchId> for String {
    fn from(id: BatchId) -> Self {
        id.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_carry_role_prefix() {
        assert!(JobId::generate().as_str().starts_with(JOB_ID_PREFIX));
        assert!(BatchId::generate().as_str().starts_with(BATCH_ID_PREFIX));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<JobId> = (0..1000).map(|_| JobId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        assert!("bid-001".parse::<JobId>().is_err());
        assert!("jid-".parse::<JobId>().is_err());
        assert_eq!("jid-a".parse::<JobId>().unwrap().as_str(), "jid-a");
        assert_eq!("bid-001".parse::<BatchId>().unwrap().as_str(), "bid-001");
    }

    #[test]
    fn test_serde_validates_prefix() {
        let id: BatchId = serde_json::from_str("\"bid-001\"").unwrap();
        assert_eq!(id.to_string(), "bid-001");
        assert!(serde_json::from_str::<BatchId>("\"jid-001\"").is_err());
    }
}

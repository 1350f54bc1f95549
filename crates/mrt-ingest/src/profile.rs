//! Ingest profiles
//!
//! A profile is a properties-style text file named by its profile ID inside
//! the profile directory. Lines are `key: value` or `key=value`; `#` and `!`
//! start comments. Handler chains are numbered keys, one chain per stage:
//!
//! ```text
//! ProfileID: merritt_demo
//! StorageService: http://store.example.org:35121
//! StorageNode: 7777
//! Type: MRT-curatorial
//! Role: MRT-content
//! Aggregate:
//! Priority: 03
//! Notification.1: ops@example.org
//! HandlerInitialize.1: handler-initialize
//! HandlerNotify.1: handler-notify
//! HandlerBatchReport.1: handler-batch-notify
//! ```
//!
//! Handler names are not resolved here; an unknown name only fails when a
//! pipeline tries to run it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::queue::{DEFAULT_PRIORITY, MAX_PRIORITY};

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Invalid profile id: {0:?}")]
    InvalidId(String),

    #[error("Failed to read profile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Storage endpoint {value:?} is not a network location: {reason}")]
    InvalidEndpoint { value: String, reason: String },
}

pub type ProfileResult<T> = std::result::Result<T, ProfileError>;

/// What a stage's handlers operate on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTarget {
    Job,
    Batch,
}

/// Named pipeline phase, each with its own handler chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Ingest,
    QueuePost,
    BatchProcess,
    BatchReport,
    Estimate,
    Provision,
    Download,
    Process,
    Record,
    Notify,
    Initialize,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Ingest,
        Stage::QueuePost,
        Stage::BatchProcess,
        Stage::BatchReport,
        Stage::Estimate,
        Stage::Provision,
        Stage::Download,
        Stage::Process,
        Stage::Record,
        Stage::Notify,
        Stage::Initialize,
    ];

    /// Stages a consumed job runs through when the profile has no
    /// `ingest` chain
    pub const JOB_SEQUENCE: [Stage; 7] = [
        Stage::Initialize,
        Stage::Estimate,
        Stage::Provision,
        Stage::Download,
        Stage::Process,
        Stage::Record,
        Stage::Notify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::QueuePost => "queue-post",
            Stage::BatchProcess => "batch-process",
            Stage::BatchReport => "batch-report",
            Stage::Estimate => "estimate",
            Stage::Provision => "provision",
            Stage::Download => "download",
            Stage::Process => "process",
            Stage::Record => "record",
            Stage::Notify => "notify",
            Stage::Initialize => "initialize",
        }
    }

    /// Key prefix used in profile files
    pub fn profile_key(self) -> &'static str {
        match self {
            Stage::Ingest => "HandlerIngest",
            Stage::QueuePost => "HandlerQueue",
            Stage::BatchProcess => "HandlerBatchProcess",
            Stage::BatchReport => "HandlerBatchReport",
            Stage::Estimate => "HandlerEstimate",
            Stage::Provision => "HandlerProvision",
            Stage::Download => "HandlerDownload",
            Stage::Process => "HandlerProcess",
            Stage::Record => "HandlerRecord",
            Stage::Notify => "HandlerNotify",
            Stage::Initialize => "HandlerInitialize",
        }
    }

    pub fn target(self) -> StageTarget {
        match self {
            Stage::BatchProcess | Stage::BatchReport => StageTarget::Batch,
            _ => StageTarget::Job,
        }
    }

    fn from_profile_key(key: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.profile_key() == key)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! closed_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ProfileError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ProfileError::InvalidValue {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

closed_enum!(
    /// Kind of object a profile ingests
    ObjectType, "Type" {
        Curatorial => "MRT-curatorial",
        System => "MRT-system",
    }
);

closed_enum!(
    ObjectRole, "Role" {
        Content => "MRT-content",
        Class => "MRT-class",
    }
);

closed_enum!(
    AggregateType, "Aggregate" {
        Collection => "MRT-collection",
        Owner => "MRT-owner",
        ServiceLevelAgreement => "MRT-service-level-agreement",
    }
);

/// Ordered handler names keyed by sequence number
pub type HandlerChain = BTreeMap<u32, String>;

/// Loaded profile; immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileState {
    pub profile_id: String,
    pub description: Option<String>,
    pub storage_endpoint: Url,
    pub storage_node: Option<u32>,
    pub identifier_scheme: Option<String>,
    pub identifier_namespace: Option<String>,
    pub object_type: Option<ObjectType>,
    pub role: Option<ObjectRole>,
    pub aggregate: Option<AggregateType>,
    pub owner: Option<String>,
    pub collections: Vec<String>,
    pub priority: u8,
    pub notification_contacts: Vec<String>,
    pub callback_url: Option<Url>,
    pub handlers: BTreeMap<Stage, HandlerChain>,
    /// Keys the loader does not interpret, kept for handlers
    pub properties: BTreeMap<String, String>,
}

impl ProfileState {
    /// Handler chain for a stage; empty if the profile defines none
    pub fn chain(&self, stage: Stage) -> HandlerChain {
        self.handlers.get(&stage).cloned().unwrap_or_default()
    }

    pub fn has_chain(&self, stage: Stage) -> bool {
        self.handlers.get(&stage).is_some_and(|c| !c.is_empty())
    }

    /// Parse profile text
    pub fn parse(content: &str) -> ProfileResult<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        let mut handlers: BTreeMap<Stage, HandlerChain> = BTreeMap::new();
        let mut collections = BTreeMap::new();
        let mut contacts = BTreeMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split_at = line.find([':', '=']).ok_or_else(|| ProfileError::Syntax {
                line: line_no,
                message: format!("expected 'key: value', found {:?}", line),
            })?;
            let key = line[..split_at].trim();
            let value = line[split_at + 1..].trim().to_string();
            if key.is_empty() {
                return Err(ProfileError::Syntax {
                    line: line_no,
                    message: "empty key".to_string(),
                });
            }

            if let Some((base, seq)) = key.rsplit_once('.') {
                let numbered = |map: &mut BTreeMap<u32, String>| -> ProfileResult<()> {
                    let seq: u32 = seq.parse().map_err(|_| ProfileError::Syntax {
                        line: line_no,
                        message: format!("bad sequence number in {:?}", key),
                    })?;
                    if map.insert(seq, value.clone()).is_some() {
                        return Err(ProfileError::Syntax {
                            line: line_no,
                            message: format!("duplicate key {:?}", key),
                        });
                    }
                    Ok(())
                };
                if let Some(stage) = Stage::from_profile_key(base) {
                    numbered(handlers.entry(stage).or_default())?;
                    continue;
                }
                match base {
                    "Collection" => {
                        numbered(&mut collections)?;
                        continue;
                    },
                    "Notification" => {
                        numbered(&mut contacts)?;
                        continue;
                    },
                    _ => {},
                }
            }
            fields.insert(key.to_string(), value);
        }

        let mut take = |key: &str| fields.remove(key).filter(|v| !v.is_empty());

        let profile_id = take("ProfileID").ok_or(ProfileError::MissingField("ProfileID"))?;
        let endpoint = take("StorageService").ok_or(ProfileError::MissingField("StorageService"))?;
        let storage_endpoint = parse_endpoint(&endpoint)?;

        let storage_node = take("StorageNode")
            .map(|v| {
                v.parse().map_err(|_| ProfileError::InvalidValue {
                    field: "StorageNode",
                    value: v,
                })
            })
            .transpose()?;
        let priority = match take("Priority") {
            Some(v) => match v.parse::<u8>() {
                Ok(p) if p <= MAX_PRIORITY => p,
                _ => {
                    return Err(ProfileError::InvalidValue {
                        field: "Priority",
                        value: v,
                    })
                },
            },
            None => DEFAULT_PRIORITY,
        };
        let callback_url = take("CallbackURL")
            .map(|v| parse_endpoint(&v))
            .transpose()?;

        let object_type = take("Type").map(|v| v.parse()).transpose()?;
        let role = take("Role").map(|v| v.parse()).transpose()?;
        let aggregate = take("Aggregate").map(|v| v.parse()).transpose()?;

        let description = take("ProfileDescription");
        let identifier_scheme = take("Identifier-scheme");
        let identifier_namespace = take("Identifier-namespace");
        let owner = take("Owner");

        Ok(Self {
            profile_id,
            description,
            storage_endpoint,
            storage_node,
            identifier_scheme,
            identifier_namespace,
            object_type,
            role,
            aggregate,
            owner,
            collections: collections.into_values().filter(|v| !v.is_empty()).collect(),
            priority,
            notification_contacts: contacts.into_values().filter(|v| !v.is_empty()).collect(),
            callback_url,
            handlers,
            properties: fields,
        })
    }
}

fn parse_endpoint(value: &str) -> ProfileResult<Url> {
    let url = Url::parse(value).map_err(|e| ProfileError::InvalidEndpoint {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ProfileError::InvalidEndpoint {
            value: value.to_string(),
            reason: "expected an http(s) URL with a host".to_string(),
        });
    }
    Ok(url)
}

/// Directory of profile files keyed by profile ID
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load and validate one profile. Reads only; safe to call concurrently.
    pub fn load(&self, profile_id: &str) -> ProfileResult<ProfileState> {
        if profile_id.is_empty()
            || profile_id.starts_with('.')
            || profile_id.contains(['/', '\\'])
        {
            return Err(ProfileError::InvalidId(profile_id.to_string()));
        }
        let path = self.dir.join(profile_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound(profile_id.to_string()))
            },
            Err(e) => return Err(ProfileError::Io { path, source: e }),
        };
        let profile = ProfileState::parse(&content)?;
        debug!(
            profile_id,
            stages = profile.handlers.len(),
            "Loaded profile"
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = "\
# demo profile
ProfileID: merritt_demo
ProfileDescription: Demo collection
StorageService: http://store.example.org:35121
StorageNode: 7777
Identifier-scheme: ARK
Identifier-namespace: 99999
Type: MRT-curatorial
Role: MRT-content
Aggregate:
Collection.1: ark:/13030/m5demo
Priority: 03
Notification.2: second@example.org
Notification.1: first@example.org
HandlerInitialize.1: handler-initialize
HandlerNotify.2: handler-callback
HandlerNotify.1: handler-notify
HandlerBatchReport.1=handler-batch-notify
Context: demo_context
";

    #[test]
    fn test_parse_demo_profile() {
        let profile = ProfileState::parse(DEMO).unwrap();
        assert_eq!(profile.profile_id, "merritt_demo");
        assert_eq!(profile.storage_endpoint.host_str(), Some("store.example.org"));
        assert_eq!(profile.storage_node, Some(7777));
        assert_eq!(profile.object_type, Some(ObjectType::Curatorial));
        assert_eq!(profile.role, Some(ObjectRole::Content));
        assert_eq!(profile.aggregate, None);
        assert_eq!(profile.priority, 3);
        assert_eq!(profile.notification_contacts, vec!["first@example.org", "second@example.org"]);
        assert_eq!(profile.properties.get("Context").map(String::as_str), Some("demo_context"));

        let notify: Vec<_> = profile.chain(Stage::Notify).into_values().collect();
        assert_eq!(notify, vec!["handler-notify", "handler-callback"]);
        assert!(profile.has_chain(Stage::BatchReport));
        assert!(!profile.has_chain(Stage::Ingest));
    }

    #[test]
    fn test_unknown_enumeration_value_fails_closed() {
        let content = DEMO.replace("Role: MRT-content", "Role: MRT-other");
        let err = ProfileState::parse(&content).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidValue { field: "Role", .. }));
    }

    #[test]
    fn test_bad_storage_endpoint() {
        let content = DEMO.replace("http://store.example.org:35121", "not a url");
        assert!(matches!(ProfileState::parse(&content), Err(ProfileError::InvalidEndpoint { .. })));

        let content = DEMO.replace("http://store.example.org:35121", "file:///tmp/store");
        assert!(matches!(ProfileState::parse(&content), Err(ProfileError::InvalidEndpoint { .. })));
    }

    #[test]
    fn test_missing_required_fields() {
        let content = DEMO.replace("ProfileID: merritt_demo\n", "");
        assert!(matches!(ProfileState::parse(&content), Err(ProfileError::MissingField("ProfileID"))));
    }

    #[test]
    fn test_duplicate_handler_sequence_rejected() {
        let content = format!("{}HandlerNotify.1: other\n", DEMO);
        assert!(matches!(ProfileState::parse(&content), Err(ProfileError::Syntax { .. })));
    }

    #[test]
    fn test_unresolvable_handler_names_load() {
        let content = format!("{}HandlerDownload.1: handler-does-not-exist\n", DEMO);
        let profile = ProfileState::parse(&content).unwrap();
        assert_eq!(profile.chain(Stage::Download).get(&1).map(String::as_str), Some("handler-does-not-exist"));
    }

    #[test]
    fn test_store_load_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("merritt_demo"), DEMO).unwrap();
        let store = ProfileStore::new(dir.path());

        assert_eq!(store.load("merritt_demo").unwrap(), store.load("merritt_demo").unwrap());
        assert!(matches!(store.load("missing"), Err(ProfileError::NotFound(_))));
        assert!(matches!(store.load("../etc"), Err(ProfileError::InvalidId(_))));
    }
}

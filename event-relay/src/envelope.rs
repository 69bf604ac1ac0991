//! Canonical notification envelope.
//!
//! Every source is normalized into an [`Envelope`] before it reaches an action chain.
//! The wire shape follows the Event Grid event schema. The correlation id is assigned
//! once when the envelope is built and travels with it through every action.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Data version of filesystem envelopes.
pub const FILE_SYSTEM_DATA_VERSION: &str = "v1";

/// Event type prefix of filesystem envelopes.
pub const FILE_SYSTEM_EVENT_PREFIX: &str = "Local.FileSystem";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    subject: String,
    event_type: String,
    id: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    data_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_version: Option<String>,
    event_time: DateTime<Utc>,
}

/// A normalized, immutable notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    event: WireEvent,
    correlation_id: Uuid,
}

impl Envelope {
    /// Build an envelope with a fresh id, the current time and a fresh correlation id.
    pub fn new(
        subject: impl Into<String>,
        event_type: impl Into<String>,
        data_version: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            event: WireEvent {
                topic: None,
                subject: subject.into(),
                event_type: event_type.into(),
                id: Uuid::new_v4().to_string(),
                data,
                data_version: data_version.into(),
                metadata_version: None,
                event_time: Utc::now(),
            },
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Build a filesystem envelope. The correlation id is taken from the metadata.
    pub fn file_system(change: ChangeType, metadata: &FileMetadata) -> Result<Self> {
        let mut envelope = Self::new(
            metadata.full_file_path.clone(),
            change.event_type(),
            FILE_SYSTEM_DATA_VERSION,
            serde_json::to_value(metadata)?,
        );
        envelope.correlation_id = metadata.correlation_id;
        Ok(envelope)
    }

    /// Parse a transport payload holding either one event object or an array of them.
    ///
    /// Each envelope gets its own correlation id. An empty array yields no envelopes.
    pub fn parse_batch(payload: &[u8]) -> Result<Vec<Self>> {
        let value: Value = serde_json::from_slice(payload)?;
        let events: Vec<WireEvent> = match value {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<std::result::Result<_, _>>()?,
            Value::Object(_) => vec![serde_json::from_value(value)?],
            other => {
                return Err(Error::Serialization(<serde_json::Error as serde::de::Error>::custom(
                    format!("expected an event object or array, found {}", json_kind(&other)),
                )));
            }
        };

        Ok(events
            .into_iter()
            .map(|event| Self {
                event,
                correlation_id: Uuid::new_v4(),
            })
            .collect())
    }

    pub fn topic(&self) -> Option<&str> {
        self.event.topic.as_deref()
    }

    pub fn subject(&self) -> &str {
        &self.event.subject
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn data_version(&self) -> &str {
        &self.event.data_version
    }

    pub fn metadata_version(&self) -> Option<&str> {
        self.event.metadata_version.as_deref()
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.event.event_time
    }

    pub fn data(&self) -> &Value {
        &self.event.data
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Serialize in wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.event)?)
    }

    /// Container and blob name addressed by the subject
    /// (`.../containers/{container}/blobs/{blob}`).
    pub fn blob_ref(&self) -> Result<BlobRef> {
        BlobRef::from_subject(self.subject())
    }

    /// Decode the payload of a filesystem envelope.
    pub fn file_metadata(&self) -> Result<FileMetadata> {
        Ok(serde_json::from_value(self.event.data.clone())?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Location of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub container: String,
    pub name: String,
}

impl BlobRef {
    pub fn from_subject(subject: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::Other(format!("subject '{subject}' does not address a blob: {reason}"))
        };

        let rest = subject
            .strip_prefix("containers/")
            .or_else(|| subject.split_once("/containers/").map(|(_, rest)| rest))
            .ok_or_else(|| invalid("missing '/containers/'"))?;
        let (container, name) = rest
            .split_once("/blobs/")
            .ok_or_else(|| invalid("missing '/blobs/'"))?;

        if container.is_empty() {
            return Err(invalid("empty container name"));
        }
        if name.is_empty() {
            return Err(invalid("empty blob name"));
        }

        Ok(Self {
            container: container.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Kind of local filesystem change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "PascalCase")]
pub enum ChangeType {
    Created,
    Deleted,
    Changed,
    Renamed,
}

impl ChangeType {
    /// `Local.FileSystem.{ChangeType}`.
    pub fn event_type(self) -> String {
        format!("{FILE_SYSTEM_EVENT_PREFIX}.{self}")
    }
}

/// Payload of filesystem envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Name of the receiver that observed the change.
    pub name: String,
    pub file_name: String,
    pub directory_name: String,
    pub full_file_path: String,
    /// Path below the watch root, `/`-separated with a leading `/`.
    pub relative_file_path: String,
    /// Size in bytes, absent when the file no longer exists.
    #[serde(default)]
    pub content_length: Option<u64>,
    pub path_to_watch: String,
    pub include_sub_directories: bool,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub allowed_event_types: Vec<String>,
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_full_path: Option<String>,
}

/// Relative path of `path` below `root` in `/a/b.txt` form.
pub fn relative_file_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    (!out.is_empty()).then_some(out)
}

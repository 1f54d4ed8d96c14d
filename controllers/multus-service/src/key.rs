//! Work-item keys.
//!
//! A queued item is identified by `namespace/name/event/resource`. Only the
//! identity travels through the queue: handlers re-read the object from the
//! cache, so coalescing repeated keys loses nothing.
//!
//! No escaping is performed. Namespace and object names are DNS labels or
//! subdomains and never contain `/`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const KEY_FIELDS: usize = 4;

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

/// Which kind of object the key refers to.
///
/// Names follow the plural resource names of the core API group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    Pod,
    Endpoints,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Service => "services",
            ResourceKind::Pod => "pods",
            ResourceKind::Endpoints => "endpoints",
        }
    }
}

/// Errors from decoding a key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("expected {KEY_FIELDS} '/'-separated fields, got {0}")]
    FieldCount(usize),

    #[error("unknown event type {0:?}")]
    UnknownEvent(String),

    #[error("unknown resource kind {0:?}")]
    UnknownResource(String),
}

impl FromStr for EventType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(EventType::Add),
            "update" => Ok(EventType::Update),
            "delete" => Ok(EventType::Delete),
            other => Err(KeyError::UnknownEvent(other.to_string())),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "services" => Ok(ResourceKind::Service),
            "pods" => Ok(ResourceKind::Pod),
            "endpoints" => Ok(ResourceKind::Endpoints),
            other => Err(KeyError::UnknownResource(other.to_string())),
        }
    }
}

/// A decoded work item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub namespace: String,
    pub name: String,
    pub event: EventType,
    pub resource: ResourceKind,
}

impl WorkItem {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        event: EventType,
        resource: ResourceKind,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            event,
            resource,
        }
    }

    /// Encodes the item as a queue key.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes a queue key. Anything other than exactly four fields is rejected.
    pub fn decode(key: &str) -> Result<Self, KeyError> {
        let fields: Vec<&str> = key.split('/').collect();
        let [namespace, name, event, resource] = fields.as_slice() else {
            return Err(KeyError::FieldCount(fields.len()));
        };
        Ok(Self {
            namespace: (*namespace).to_string(),
            name: (*name).to_string(),
            event: event.parse()?,
            resource: resource.parse()?,
        })
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace,
            self.name,
            self.event.as_str(),
            self.resource.as_str()
        )
    }
}

impl FromStr for WorkItem {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkItem::decode(s)
    }
}

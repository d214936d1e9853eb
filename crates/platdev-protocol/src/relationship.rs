//! Resolved relationship endpoint records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A runtime-resolved endpoint of a definition.
///
/// Records are produced by the open handshake of the target container and handed
/// to every definition that declares a relationship pointing at it. Fields the
/// orchestrator does not know about are carried through untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Name of the definition that produced the record.
    #[serde(default)]
    pub service: String,

    /// Endpoint name within that definition (e.g. `mysql`).
    #[serde(default)]
    pub rel: String,

    /// Connection scheme (e.g. `mysql`, `http`).
    #[serde(default)]
    pub scheme: String,

    /// Host reachable from other containers on the shared network.
    #[serde(default)]
    pub host: String,

    /// Hostname of the producing container.
    #[serde(default)]
    pub hostname: String,

    /// IP address of the producing container.
    #[serde(default)]
    pub ip: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default)]
    pub query: Map<String, Value>,

    #[serde(default)]
    pub public: bool,

    /// Engine specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelationshipRecord {
    /// Create an empty record with a scheme and default port.
    pub fn template(scheme: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            port,
            ..Default::default()
        }
    }
}

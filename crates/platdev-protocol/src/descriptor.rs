//! Documents uploaded into containers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::relationship::RelationshipRecord;

/// Runtime descriptor uploaded to [`crate::DESCRIPTOR_PATH`] before a container starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub project: String,
    pub name: String,
    /// Object kind (`app`, `worker`, `service`).
    pub kind: String,
    /// Declared `engine:version` type.
    #[serde(rename = "type")]
    pub runtime_type: String,
    pub slot: u32,
    /// Disk size in MB, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u64>,
    /// Unprivileged user services run as.
    pub user: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Declared relationships, alias to `target:endpoint`.
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
    /// Declared mounts keyed by container path.
    #[serde(default)]
    pub mounts: BTreeMap<String, DescriptorMount>,
    /// Definition specific configuration passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub configuration: serde_json::Value,
}

/// How a declared mount was realized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorMount {
    pub source: String,
    pub source_path: String,
    /// Mount strategy (`none`, `symlink`, `volume`).
    pub strategy: String,
}

/// Payload uploaded to [`crate::BUILD_PAYLOAD_PATH`] for the build entrypoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPayload {
    pub name: String,
    #[serde(rename = "type")]
    pub runtime_type: String,
    /// Shell script of the build hook.
    pub hook: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Relationships resolved during open, keyed by alias.
    #[serde(default)]
    pub relationships: BTreeMap<String, Vec<RelationshipRecord>>,
}

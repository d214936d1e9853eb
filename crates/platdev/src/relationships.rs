//! Relationship records harvested during open.

use std::collections::BTreeMap;

use platdev_protocol::{ProtocolError, RelationshipRecord};
use serde_json::{Map, Value};

use crate::address::{ObjectAddress, ObjectKind};
use crate::definition::RelationshipTarget;

/// A record produced by one definition's open handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRelationship {
    /// Definition that produced the record.
    pub service: String,
    /// Endpoint name the record was published under.
    pub endpoint: String,
    pub record: RelationshipRecord,
}

/// Ordered, append-only list of resolved records for one run.
///
/// Only the orchestrating task writes to it, always in startup order, so a lookup
/// sees exactly the records of definitions that were opened earlier.
#[derive(Debug, Clone, Default)]
pub struct RelationshipLedger {
    entries: Vec<ResolvedRelationship>,
}

impl RelationshipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything. Called at the beginning of a fresh start.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn append(&mut self, entries: impl IntoIterator<Item = ResolvedRelationship>) {
        self.entries.extend(entries);
    }

    pub fn entries(&self) -> &[ResolvedRelationship] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records matching a target, in the order they were appended.
    pub fn records_for(&self, target: &RelationshipTarget) -> Vec<RelationshipRecord> {
        self.entries
            .iter()
            .filter(|entry| target.matches(&entry.service, &entry.endpoint))
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Resolve declared aliases against what is known so far.
    ///
    /// Aliases whose target has not been opened yet are omitted.
    pub fn resolve(
        &self,
        relationships: &BTreeMap<String, RelationshipTarget>,
    ) -> BTreeMap<String, Vec<RelationshipRecord>> {
        relationships
            .iter()
            .filter_map(|(alias, target)| {
                let records = self.records_for(target);
                (!records.is_empty()).then(|| (alias.clone(), records))
            })
            .collect()
    }
}

/// Empty record a handshake entry is merged into.
pub fn template_for(kind: ObjectKind, engine: &str) -> RelationshipRecord {
    match kind {
        ObjectKind::Service => {
            let (scheme, port) = match engine {
                "mysql" | "mariadb" | "oracle-mysql" => ("mysql", 3306),
                "postgresql" | "pgsql" | "postgres" => ("pgsql", 5432),
                "redis" | "redis-persistent" | "valkey" => ("redis", 6379),
                "memcached" => ("memcached", 11211),
                "mongodb" => ("mongodb", 27017),
                "rabbitmq" => ("amqp", 5672),
                "elasticsearch" | "opensearch" => ("http", 9200),
                "solr" => ("solr", 8080),
                "influxdb" => ("http", 8086),
                "kafka" => ("kafka", 9092),
                _ => ("tcp", 0),
            };
            RelationshipRecord::template(scheme, port)
        }
        ObjectKind::App | ObjectKind::Worker | ObjectKind::Router => {
            RelationshipRecord::template("http", 80)
        }
    }
}

/// Turn raw handshake fields into a record owned by `address`.
///
/// Fields override the template; the network identity is always overwritten with
/// the producing container's.
pub fn materialize(
    address: &ObjectAddress,
    engine: &str,
    endpoint: &str,
    fields: Map<String, Value>,
    ip: Option<&str>,
) -> Result<ResolvedRelationship, ProtocolError> {
    let invalid = |source| ProtocolError::InvalidRecord {
        endpoint: endpoint.to_string(),
        source,
    };

    let template = template_for(address.kind, engine);
    let mut merged = match serde_json::to_value(template).map_err(invalid)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    merged.extend(fields);

    let mut record: RelationshipRecord =
        serde_json::from_value(Value::Object(merged)).map_err(invalid)?;

    let container = address.container_name();
    record.service = address.name.clone();
    if record.rel.is_empty() {
        record.rel = endpoint.to_string();
    }
    record.host = container.clone();
    record.hostname = container;
    record.ip = ip.unwrap_or_default().to_string();

    Ok(ResolvedRelationship {
        service: address.name.clone(),
        endpoint: endpoint.to_string(),
        record,
    })
}

//! Open handshake encoding and output parsing.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::relationship::RelationshipRecord;
use crate::{READY_MARKER, READY_POLL_SECS};

/// Input of the open command: the relationships currently known for a definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenPayload {
    pub relationships: BTreeMap<String, Vec<RelationshipRecord>>,
}

/// Encode an open payload as base64 JSON.
pub fn encode_open_payload(payload: &OpenPayload) -> Result<String, ProtocolError> {
    let json = serde_json::to_vec(payload)?;
    Ok(STANDARD.encode(json))
}

/// Decode a base64 JSON open payload. Surrounding whitespace is ignored.
pub fn decode_open_payload(encoded: &str) -> Result<OpenPayload, ProtocolError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Parse the output of the open command.
///
/// Only the final non-empty line is considered. It must be a JSON object mapping
/// endpoint name to an object of relationship fields.
pub fn parse_open_output(stdout: &str) -> Result<BTreeMap<String, Map<String, Value>>, ProtocolError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or(ProtocolError::EmptyOutput)?;

    let value: Value = serde_json::from_str(line).map_err(|source| ProtocolError::MalformedLine {
        line: line.to_string(),
        source,
    })?;

    let Value::Object(entries) = value else {
        return Err(ProtocolError::NotAMap);
    };

    entries
        .into_iter()
        .map(|(endpoint, fields)| match fields {
            Value::Object(fields) => Ok((endpoint, fields)),
            _ => Err(ProtocolError::NotAnObject(endpoint)),
        })
        .collect()
}

/// Shell script that blocks until the container reports it has booted.
///
/// There is no timeout inside the container; callers that want one wrap the exec.
pub fn readiness_script() -> String {
    format!("while [ ! -f {READY_MARKER} ]; do sleep {READY_POLL_SECS}; done")
}

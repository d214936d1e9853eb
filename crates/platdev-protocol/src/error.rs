//! Handshake error types.

use thiserror::Error;

/// Errors raised while encoding handshake payloads or parsing container output.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The open command printed nothing parseable.
    #[error("open command produced no output")]
    EmptyOutput,

    /// The final output line is not valid JSON.
    #[error("final output line is not valid JSON ({line:?}): {source}")]
    MalformedLine {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// The final output line is JSON but not an object of objects.
    #[error("expected an object for endpoint '{0}'")]
    NotAnObject(String),

    /// The final output line is JSON but not an object at the top level.
    #[error("expected a JSON object mapping endpoint to fields")]
    NotAMap,

    /// Endpoint fields could not be turned into a relationship record.
    #[error("invalid relationship fields for endpoint '{endpoint}': {source}")]
    InvalidRecord {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// Payload was not valid base64.
    #[error("payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Payload JSON could not be produced or read.
    #[error("payload JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

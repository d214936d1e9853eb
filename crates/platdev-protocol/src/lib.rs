//! Handshake protocol between the platdev orchestrator and the images it runs.
//!
//! Every image managed by platdev follows the same contract:
//!
//! ```text
//! orchestrator                                container
//! ------------                                ---------
//! upload  RuntimeDescriptor  ---------------> /run/platdev.json     (before start)
//! exec    readiness wait      --------------> blocks on /run/platdev.ready
//! exec    open  <stdin: base64(OpenPayload)>  /etc/platdev/open
//!         <----------------------------------  last stdout line: {endpoint: {fields}}
//! upload  BuildPayload        --------------> /run/platdev-build.json
//! exec    build                ------------->  /etc/platdev/build
//! exec    shutdown             ------------->  /etc/platdev/shutdown
//! ```
//!
//! The orchestrator never interprets anything else the container prints; only the
//! final non-empty line of the `open` command is parsed.

pub mod descriptor;
pub mod error;
pub mod handshake;
pub mod relationship;

pub use descriptor::{BuildPayload, DescriptorMount, RuntimeDescriptor};
pub use error::ProtocolError;
pub use handshake::{
    OpenPayload, decode_open_payload, encode_open_payload, parse_open_output, readiness_script,
};
pub use relationship::RelationshipRecord;

/// Path the runtime descriptor is uploaded to before the container starts.
pub const DESCRIPTOR_PATH: &str = "/run/platdev.json";

/// Marker file the container creates once its init has finished booting.
pub const READY_MARKER: &str = "/run/platdev.ready";

/// Path the build payload is uploaded to before the build entrypoint runs.
pub const BUILD_PAYLOAD_PATH: &str = "/run/platdev-build.json";

/// Log written by the build entrypoint.
pub const BUILD_LOG_PATH: &str = "/run/platdev-build.log";

/// Entrypoint that starts in-container services and prints resolved endpoints.
pub const OPEN_COMMAND: &str = "/etc/platdev/open";

/// Entrypoint that runs the application's build hook.
pub const BUILD_COMMAND: &str = "/etc/platdev/build";

/// Entrypoint that runs the application's deploy hook.
pub const DEPLOY_COMMAND: &str = "/etc/platdev/deploy";

/// Entrypoint that shuts in-container services down gracefully.
pub const SHUTDOWN_COMMAND: &str = "/etc/platdev/shutdown";

/// Directory in the router container holding one routes file per project.
pub const ROUTES_DIR: &str = "/run/routes";

/// Seconds between readiness marker polls inside the container.
pub const READY_POLL_SECS: u32 = 1;

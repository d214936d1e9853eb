//! Deterministic naming of containers, volumes and networks.
//!
//! Every engine object platdev creates is named from an [`ObjectAddress`]:
//!
//! ```text
//! platdev-{project}-{name}-{kind}[-{slot}]
//! ```
//!
//! The kind code sits after the object name, so a name that itself ends in
//! `-<digits>` is never mistaken for a slot suffix. Slot 1 is the canonical set and
//! carries no suffix. Container names are slot independent; volume names carry the
//! slot. The router is shared by every project on the host and has a fixed name.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prefix of every engine object managed by platdev.
pub const NAME_PREFIX: &str = "platdev";

/// Fixed container name of the host-wide router.
pub const ROUTER_CONTAINER: &str = "platdev-router";

/// Host-wide network every managed container is attached to.
pub const NETWORK_NAME: &str = "platdev";

/// The canonical volume set.
pub const CANONICAL_SLOT: u32 = 1;

static SLOT_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)-(\d+)$").unwrap());

/// Kind of object an address points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    #[default]
    App,
    Worker,
    Service,
    Router,
}

impl ObjectKind {
    /// Short code used in engine object names.
    pub fn code(&self) -> &'static str {
        match self {
            ObjectKind::App => "app",
            ObjectKind::Worker => "wrk",
            ObjectKind::Service => "svc",
            ObjectKind::Router => "rtr",
        }
    }

    /// Parse a name code. The router code is not part of any project address.
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "app" => Some(ObjectKind::App),
            "wrk" => Some(ObjectKind::Worker),
            "svc" => Some(ObjectKind::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::App => write!(f, "app"),
            ObjectKind::Worker => write!(f, "worker"),
            ObjectKind::Service => write!(f, "service"),
            ObjectKind::Router => write!(f, "router"),
        }
    }
}

/// Identity of one engine object.
///
/// Never persisted; always recomputed from the project and its definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAddress {
    pub project: String,
    pub kind: ObjectKind,
    pub name: String,
    pub slot: u32,
}

impl ObjectAddress {
    /// Address in the canonical slot.
    pub fn new(project: impl Into<String>, kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind,
            name: name.into(),
            slot: CANONICAL_SLOT,
        }
    }

    /// The host-wide router, identical for every project.
    pub fn router() -> Self {
        Self {
            project: String::new(),
            kind: ObjectKind::Router,
            name: "router".to_string(),
            slot: CANONICAL_SLOT,
        }
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = slot;
        self
    }

    /// Whether this is the zero value returned for undecodable names.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn is_valid(&self) -> bool {
        if self.kind == ObjectKind::Router {
            return *self == Self::router();
        }
        is_project_id(&self.project) && is_object_name(&self.name) && self.slot >= CANONICAL_SLOT
    }

    /// Full name including the slot suffix. Inverse of [`ObjectAddress::decode`].
    pub fn encode(&self) -> String {
        if self.kind == ObjectKind::Router {
            return ROUTER_CONTAINER.to_string();
        }
        let base = format!(
            "{NAME_PREFIX}-{}-{}-{}",
            self.project,
            self.name,
            self.kind.code()
        );
        with_slot(&base, self.slot)
    }

    /// Recover an address from an encoded name.
    ///
    /// Names that were not produced by [`ObjectAddress::encode`] decode to the zero
    /// address instead of failing.
    pub fn decode(encoded: &str) -> Self {
        if encoded == ROUTER_CONTAINER {
            return Self::router();
        }

        let Some((project, rest)) = encoded
            .strip_prefix(NAME_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.split_once('-'))
        else {
            return Self::default();
        };

        // A trailing number is a slot only when a kind code precedes it.
        let (body, slot) = match split_slot(rest) {
            Some((body, SlotSuffix::Slot(slot))) if slot > CANONICAL_SLOT && ends_with_kind(body) => {
                (body, slot)
            }
            Some((body, SlotSuffix::Overflow)) if ends_with_kind(body) => return Self::default(),
            _ => (rest, CANONICAL_SLOT),
        };

        let Some((name, code)) = body.rsplit_once('-') else {
            return Self::default();
        };
        let Some(kind) = ObjectKind::from_code(code) else {
            return Self::default();
        };

        let address = Self {
            project: project.to_string(),
            kind,
            name: name.to_string(),
            slot,
        };
        if address.is_valid() {
            address
        } else {
            Self::default()
        }
    }

    /// Container name. Containers are shared between slots.
    pub fn container_name(&self) -> String {
        self.clone().with_slot(CANONICAL_SLOT).encode()
    }

    /// Name of the object's data volume in its slot.
    pub fn volume_name(&self) -> String {
        self.encode()
    }

    /// Image a committed container is saved as.
    pub fn commit_image(&self) -> String {
        format!("{}-commit:latest", self.container_name())
    }

    /// Hostname inside the shared network.
    pub fn hostname(&self) -> String {
        self.name.replace('_', "-")
    }
}

impl std::fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Prefix shared by every engine object of a project.
pub fn project_prefix(project: &str) -> String {
    format!("{NAME_PREFIX}-{project}-")
}

/// Prefix shared by every engine object platdev manages.
pub fn global_prefix() -> String {
    format!("{NAME_PREFIX}-")
}

fn is_project_id(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Object names: lowercase alphanumerics, `-` and `_`, starting and ending alphanumeric.
pub fn is_object_name(value: &str) -> bool {
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    edge_ok(value.chars().next())
        && edge_ok(value.chars().last())
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn ends_with_kind(body: &str) -> bool {
    body.rsplit_once('-')
        .is_some_and(|(name, code)| !name.is_empty() && ObjectKind::from_code(code).is_some())
}

/// Numeric tail of a name. Digits too long for a `u32` still count as a suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotSuffix {
    Slot(u32),
    Overflow,
}

fn split_slot(name: &str) -> Option<(&str, SlotSuffix)> {
    let captures = SLOT_SUFFIX.captures(name)?;
    let base = captures.get(1)?.as_str();
    let suffix = captures
        .get(2)?
        .as_str()
        .parse::<u32>()
        .map_or(SlotSuffix::Overflow, SlotSuffix::Slot);
    Some((base, suffix))
}

// ============================================================================
// Slot primitives on raw names
// ============================================================================

/// Append the slot suffix to an unslotted base name. Slot 1 and below add nothing.
pub fn with_slot(name: &str, slot: u32) -> String {
    if slot <= CANONICAL_SLOT {
        name.to_string()
    } else {
        format!("{name}-{slot}")
    }
}

/// Slot encoded in a name; 1 when there is no numeric suffix. Suffixes past
/// `u32::MAX` saturate.
pub fn get_slot(name: &str) -> u32 {
    match split_slot(name) {
        None => CANONICAL_SLOT,
        Some((_, SlotSuffix::Slot(slot))) => slot,
        Some((_, SlotSuffix::Overflow)) => u32::MAX,
    }
}

/// Name without its numeric suffix.
pub fn strip_slot(name: &str) -> &str {
    split_slot(name).map_or(name, |(base, _)| base)
}

/// Whether `name` belongs to `slot`.
///
/// For slot 1 this means "has no numeric suffix at all", which is deliberately
/// stricter than the equality check used for higher slots.
pub fn belongs_to_slot(name: &str, slot: u32) -> bool {
    match split_slot(name) {
        None => slot <= CANONICAL_SLOT,
        Some((_, SlotSuffix::Slot(found))) => slot > CANONICAL_SLOT && found == slot,
        Some((_, SlotSuffix::Overflow)) => false,
    }
}

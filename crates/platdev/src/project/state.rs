//! Persisted per-project state.
//!
//! Only what cannot be recomputed from the definitions is stored: the project id,
//! project variables, flags, options and the active slot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::address::CANONICAL_SLOT;
use crate::error::{PlatformError, PlatformResult};

/// State file name at the project root.
pub const STATE_FILE: &str = ".platdev.json";

/// Start apps from their images even when a commit exists.
pub const FLAG_IGNORE_COMMITS: &str = "ignore-commits";

/// Do not start or update the router for this project.
pub const FLAG_NO_ROUTER: &str = "no-router";

/// Option overriding the configured mount strategy.
pub const OPTION_MOUNT_STRATEGY: &str = "mount_strategy";

const ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];
const ID_LENGTH: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    pub id: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default = "default_slot")]
    pub slot: u32,
}

fn default_slot() -> u32 {
    CANONICAL_SLOT
}

impl ProjectState {
    /// Fresh state with a newly generated id.
    pub fn generate() -> Self {
        Self {
            id: nanoid::nanoid!(ID_LENGTH, &ID_ALPHABET),
            variables: BTreeMap::new(),
            flags: BTreeSet::new(),
            options: BTreeMap::new(),
            slot: CANONICAL_SLOT,
        }
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(STATE_FILE)
    }

    /// Read the state file, creating it with a fresh id if absent.
    ///
    /// With `dry_run` a missing file is not written.
    pub fn load_or_init(root: &Path, dry_run: bool) -> PlatformResult<Self> {
        let path = Self::path(root);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let state: Self = serde_json::from_slice(&bytes)?;
                state.validate()?;
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = Self::generate();
                if dry_run {
                    info!("dry-run: would create {} for project {}", path.display(), state.id);
                } else {
                    state.save(root)?;
                    info!("initialized project {} at {}", state.id, root.display());
                }
                Ok(state)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, root: &Path) -> PlatformResult<()> {
        let mut body = serde_json::to_string_pretty(self)?;
        body.push('\n');
        std::fs::write(Self::path(root), body)?;
        Ok(())
    }

    fn validate(&self) -> PlatformResult<()> {
        let valid_id = !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !valid_id {
            return Err(PlatformError::Precondition(format!(
                "project id '{}' in {STATE_FILE} must be lowercase alphanumeric",
                self.id
            )));
        }
        if self.slot < CANONICAL_SLOT {
            return Err(PlatformError::Precondition(format!(
                "slot {} in {STATE_FILE} must be at least {CANONICAL_SLOT}",
                self.slot
            )));
        }
        Ok(())
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Set or clear a flag. Returns whether anything changed.
    pub fn set_flag(&mut self, flag: &str, enabled: bool) -> bool {
        if enabled {
            self.flags.insert(flag.to_string())
        } else {
            self.flags.remove(flag)
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

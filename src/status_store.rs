//! Persistence of the chosen visibility between runs.
//!
//! The file holds a bare token. Only `mobile` is remembered as such; anything
//! else, including a missing file, comes back as Offline so a fresh start
//! never leaks an Online status.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::relay::Visibility;

const APP_DIR: &str = "veil";
const STATUS_FILE: &str = "status";

#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the platform data directory
    /// (e.g. `~/.local/share/veil/status` on Linux).
    pub fn default_location() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(APP_DIR).join(STATUS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Visibility {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content == Visibility::Mobile.token() => Visibility::Mobile,
            Ok(_) => Visibility::Offline,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved status, defaulting to offline");
                Visibility::Offline
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read saved status");
                Visibility::Offline
            }
        }
    }

    pub fn save(&self, visibility: Visibility) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, visibility.token())
    }
}

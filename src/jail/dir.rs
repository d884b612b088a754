//! Jail root directories extracted from a base tarball

use crate::error::{Error, Result};
use crate::logbook::HistoryEntry;
use crate::sys::CommandRunner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk root filesystem of a jail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JailDir {
    pub name: String,
    pub dirpath: PathBuf,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl JailDir {
    pub fn new(name: &str, dirpath: PathBuf) -> Self {
        let now = Utc::now();
        JailDir {
            name: name.to_string(),
            dirpath,
            created: now,
            last_updated: now,
            iteration: 1,
            history: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.dirpath.is_dir()
    }

    /// Create the directory and extract `tarball` into it.
    /// The directory must not exist yet.
    pub fn create_from_tarball(&mut self, sys: &dyn CommandRunner, tarball: &Path) -> Result<()> {
        if self.dirpath.exists() {
            return Err(Error::AlreadyExists {
                kind: "Jail directory".into(),
                name: self.dirpath.display().to_string(),
            });
        }

        fs::create_dir_all(&self.dirpath)?;

        let tarball = tarball.display().to_string();
        let dest = self.dirpath.display().to_string();
        debug!(jail = %self.name, tarball = %tarball, dest = %dest, "extracting base");
        sys.run("tar", &["-xvf", &tarball, "-C", &dest])?;

        self.last_updated = Utc::now();
        self.history
            .push(HistoryEntry::new(format!("Create jail source directory {}", dest)));
        Ok(())
    }

    /// Clear immutable flags and delete the directory. Missing is fine.
    pub fn remove(&self, sys: &dyn CommandRunner) -> Result<()> {
        if !self.dirpath.exists() {
            debug!(jail = %self.name, "no jail directory to remove");
            return Ok(());
        }

        let dir = self.dirpath.display().to_string();
        if let Err(e) = sys.run("chflags", &["-R", "noschg", &dir]) {
            warn!(jail = %self.name, error = %e, "could not clear schg flags");
        }

        match fs::remove_dir_all(&self.dirpath) {
            Ok(()) => {
                debug!(jail = %self.name, path = %dir, "jail directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::RemoveDir {
                path: self.dirpath.clone(),
                source: e,
            }),
        }
    }
}

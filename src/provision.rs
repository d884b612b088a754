//! FreeBSD base releases
//!
//! A base is a release's `base.txz` kept under `<bases>/<release>/`. Jails
//! without their own `path` are extracted from it.
//!
//! Provides:
//! - Downloading `base.txz` from a mirror, verified against the release MANIFEST
//! - Importing a tarball that is already on disk
//! - Removing a base directory

use crate::error::{Error, Result};
use crate::logbook::HistoryEntry;
use crate::supply::{fetch, parse_manifest, sha256_file, verify_sha256};
use crate::sys::CommandRunner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const BASE_ARCHIVE: &str = "base.txz";
const MANIFEST: &str = "MANIFEST";

/// A downloaded or imported base release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub release: String,
    #[serde(default)]
    pub source_url: String,
    pub dirpath: PathBuf,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// SHA256 of `base.txz`
    #[serde(default)]
    pub checksum: Option<String>,
}

impl Base {
    pub fn new(release: &str, dirpath: PathBuf) -> Self {
        let now = Utc::now();
        Base {
            release: release.to_string(),
            source_url: String::new(),
            dirpath,
            created: now,
            last_updated: now,
            iteration: 1,
            history: Vec::new(),
            checksum: None,
        }
    }

    /// Path of the base tarball
    pub fn tarball(&self) -> PathBuf {
        self.dirpath.join(BASE_ARCHIVE)
    }

    fn record(&mut self, text: String) {
        self.last_updated = Utc::now();
        self.history.push(HistoryEntry::new(text));
    }

    /// Adopt a `base.txz` that is already present in the base directory
    pub fn import(&mut self) -> Result<()> {
        let tarball = self.tarball();
        if !tarball.is_file() {
            return Err(Error::NotFound {
                kind: "Base file".into(),
                name: tarball.display().to_string(),
            });
        }

        debug!(base = %self.release, "base tarball found, importing");
        self.checksum = Some(sha256_file(&tarball)?);
        self.record(format!("Import base {}", self.release));
        Ok(())
    }

    /// Remove the base directory. A missing directory is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dirpath) {
            Ok(()) => {
                debug!(path = %self.dirpath.display(), "base directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.dirpath.display(), "nothing to remove");
                Ok(())
            }
            Err(e) => Err(Error::RemoveDir {
                path: self.dirpath.clone(),
                source: e,
            }),
        }
    }
}

/// Builds base records and fetches release files from a mirror
#[derive(Debug, Clone)]
pub struct Provisioner {
    mirror_url: String,
    bases_dir: PathBuf,
    machine: String,
}

impl Provisioner {
    pub fn new(mirror_url: &str, bases_dir: &Path, machine: &str) -> Self {
        Provisioner {
            mirror_url: mirror_url.trim_end_matches('/').to_string(),
            bases_dir: bases_dir.to_path_buf(),
            machine: machine.to_string(),
        }
    }

    /// Get URL for a release file
    fn release_url(&self, release: &str, file: &str) -> String {
        format!("{}/{}/{}/{}", self.mirror_url, self.machine, release, file)
    }

    /// A fresh record for `release` rooted in the bases directory
    pub fn new_base(&self, release: &str) -> Base {
        Base::new(release, self.bases_dir.join(release))
    }

    /// Download `base.txz` into the base directory.
    ///
    /// An existing directory is an error unless `overwrite` is set, in which
    /// case it is removed and created again. The tarball is checked against
    /// the release MANIFEST when the mirror provides one.
    pub fn download(&self, sys: &dyn CommandRunner, base: &mut Base, overwrite: bool) -> Result<()> {
        let redownload = base.dirpath.exists();
        if redownload {
            if !overwrite {
                return Err(Error::AlreadyExists {
                    kind: "Base".into(),
                    name: base.release.clone(),
                });
            }
            debug!(base = %base.release, "removing existing base before downloading it again");
            fs::remove_dir_all(&base.dirpath)?;
        }
        fs::create_dir_all(&base.dirpath)?;

        if let Err(e) = self.fetch_verified(sys, base) {
            if let Err(cleanup) = fs::remove_dir_all(&base.dirpath) {
                warn!(path = %base.dirpath.display(), error = %cleanup, "failed to clean up after download error");
            }
            return Err(e);
        }

        if redownload {
            base.iteration += 1;
            base.record(format!("Download base {} again", base.release));
        } else {
            base.record(format!("Download base {}", base.release));
        }
        Ok(())
    }

    fn fetch_verified(&self, sys: &dyn CommandRunner, base: &mut Base) -> Result<()> {
        let url = self.release_url(&base.release, BASE_ARCHIVE);
        let tarball = base.tarball();

        info!(base = %base.release, url = %url, "downloading base");
        fetch(sys, &url, &tarball)?;

        let manifest_path = base.dirpath.join(MANIFEST);
        let expected = match fetch(sys, &self.release_url(&base.release, MANIFEST), &manifest_path) {
            Ok(()) => {
                let content = fs::read_to_string(&manifest_path)?;
                parse_manifest(&content).remove(BASE_ARCHIVE)
            }
            Err(e) => {
                warn!(base = %base.release, error = %e, "MANIFEST unavailable, checksum not verified");
                None
            }
        };

        let checksum = match expected {
            Some(expected) => {
                let actual = verify_sha256(&tarball, &expected)?;
                debug!(base = %base.release, "checksum verified");
                actual
            }
            None => sha256_file(&tarball)?,
        };

        base.source_url = url;
        base.checksum = Some(checksum);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::FakeRunner;

    /// A mirror that writes `payload` for base.txz and an optional MANIFEST
    fn mirror(payload: &'static [u8], manifest: Option<String>) -> FakeRunner {
        FakeRunner::new(move |program, args| {
            assert_eq!(program, "fetch");
            let (url, dest) = (args[0], args[2]);
            if url.ends_with("/base.txz") {
                fs::write(dest, payload).map_err(|e| e.to_string())?;
            } else if let Some(m) = &manifest {
                fs::write(dest, m).map_err(|e| e.to_string())?;
            } else {
                return Err("404 Not Found".into());
            }
            Ok(String::new())
        })
    }

    fn provisioner(dir: &Path) -> Provisioner {
        Provisioner::new("http://mirror/releases/", dir, "amd64")
    }

    #[test]
    fn test_release_url() {
        let p = provisioner(Path::new("/bases"));
        assert_eq!(
            p.release_url("13.2-RELEASE", "base.txz"),
            "http://mirror/releases/amd64/13.2-RELEASE/base.txz"
        );
        assert_eq!(
            p.new_base("13.2-RELEASE").tarball(),
            PathBuf::from("/bases/13.2-RELEASE/base.txz")
        );
    }

    #[test]
    fn test_download_verifies_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let sum = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";
        let sys = mirror(b"hello world\n", Some(format!("base.txz\t{}\t1\tbase\n", sum)));

        let mut base = p.new_base("13.2-RELEASE");
        p.download(&sys, &mut base, false).unwrap();

        assert!(base.tarball().is_file());
        assert_eq!(base.checksum.as_deref(), Some(sum));
        assert_eq!(base.source_url, "http://mirror/releases/amd64/13.2-RELEASE/base.txz");
        assert_eq!(base.iteration, 1);
        assert_eq!(base.history.len(), 1);
    }

    #[test]
    fn test_download_checksum_mismatch_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let sys = mirror(b"tampered", Some("base.txz\tdeadbeef\t1\tbase\n".to_string()));

        let mut base = p.new_base("13.2-RELEASE");
        let err = p.download(&sys, &mut base, false).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!base.dirpath.exists());
    }

    #[test]
    fn test_download_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let sys = mirror(b"hello world\n", None);

        let mut base = p.new_base("14.1-RELEASE");
        p.download(&sys, &mut base, false).unwrap();
        assert!(base.checksum.is_some());
    }

    #[test]
    fn test_download_existing_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let sys = mirror(b"hello world\n", None);

        let mut base = p.new_base("13.2-RELEASE");
        p.download(&sys, &mut base, false).unwrap();
        fs::write(base.dirpath.join("stale"), b"x").unwrap();

        assert!(matches!(
            p.download(&sys, &mut base, false),
            Err(Error::AlreadyExists { .. })
        ));

        p.download(&sys, &mut base, true).unwrap();
        assert_eq!(base.iteration, 2);
        assert!(!base.dirpath.join("stale").exists());
        assert!(base.tarball().is_file());
    }

    #[test]
    fn test_import_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let mut base = p.new_base("13.2-RELEASE");

        assert!(matches!(base.import(), Err(Error::NotFound { .. })));

        fs::create_dir_all(&base.dirpath).unwrap();
        fs::write(base.tarball(), b"hello world\n").unwrap();
        base.import().unwrap();
        assert!(base.checksum.is_some());

        base.remove().unwrap();
        assert!(!base.dirpath.exists());
        // Already gone
        base.remove().unwrap();
    }
}

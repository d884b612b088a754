//! The jail aggregate: config block, root directory and lifecycle state

use crate::bulkhead::HostPort;
use crate::error::{Error, Result};
use crate::jail::conf::JailConf;
use crate::jail::dir::JailDir;
use crate::jail::state::{JailEvent, JailState};
use crate::logbook::HistoryEntry;
use crate::sys::CommandRunner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Check `jls -Nn` for a running jail called `name`
pub fn exists_in_os(sys: &dyn CommandRunner, name: &str) -> Result<bool> {
    let out = sys.output("jls", &["-Nn"])?;
    let needle = format!("name={}", name);
    let found = out.split_whitespace().any(|token| token == needle);
    debug!(jail = %name, running = found, "checked jls");
    Ok(found)
}

/// A managed jail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jail {
    pub name: String,
    #[serde(default)]
    pub state: JailState,
    pub config: JailConf,
    /// Root directory owned by jailguard, if it extracted one
    #[serde(default)]
    pub dir: Option<JailDir>,
    /// Base release the root was extracted from
    #[serde(default)]
    pub release: Option<String>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Host interface and port to jail port, mirrored from the port forward records
    #[serde(default)]
    pub port_fwds: BTreeMap<HostPort, u16>,
    /// Gateway interface, mirrored from the NAT pass record
    #[serde(default)]
    pub nat_pass: Option<String>,
}

impl Jail {
    pub fn new(config: JailConf, dir: Option<JailDir>, release: Option<String>) -> Self {
        let now = Utc::now();
        Jail {
            name: config.name.clone(),
            state: JailState::Created,
            config,
            dir,
            release,
            created: now,
            last_updated: now,
            iteration: 1,
            history: Vec::new(),
            port_fwds: BTreeMap::new(),
            nat_pass: None,
        }
    }

    fn config_file(&self) -> Result<String> {
        self.config
            .filepath
            .as_ref()
            .map(|p| p.display().to_string())
            .ok_or_else(|| Error::NotFound {
                kind: "Jail config file".into(),
                name: self.name.clone(),
            })
    }

    fn record(&mut self, event: JailEvent, text: String) {
        self.state = self.state.next(event);
        self.iteration += 1;
        self.last_updated = Utc::now();
        self.history.push(HistoryEntry::new(text));
    }

    /// `jail -c -f <config>`. The attempt is recorded even when it fails.
    pub fn start(&mut self, sys: &dyn CommandRunner) -> Result<()> {
        let file = self.config_file()?;
        info!(jail = %self.name, "starting jail");

        match sys.run("jail", &["-c", "-f", &file]) {
            Ok(()) => {
                self.record(JailEvent::Started, format!("Start jail {}", self.name));
                Ok(())
            }
            Err(e) => {
                self.record(JailEvent::StartFailed, format!("Failed to start jail {}", self.name));
                Err(e)
            }
        }
    }

    /// `jail -r <name>`. The attempt is recorded even when it fails.
    pub fn stop(&mut self, sys: &dyn CommandRunner) -> Result<()> {
        info!(jail = %self.name, "stopping jail");

        match sys.run("jail", &["-r", &self.name]) {
            Ok(()) => {
                self.record(JailEvent::Stopped, format!("Stop jail {}", self.name));
                Ok(())
            }
            Err(e) => {
                self.record(JailEvent::StopFailed, format!("Failed to stop jail {}", self.name));
                Err(e)
            }
        }
    }

    /// Delete the root directory and the config file. Both are attempted;
    /// the first failure is returned.
    pub fn remove(&self, sys: &dyn CommandRunner) -> Result<()> {
        let dir_result = match &self.dir {
            Some(dir) => dir.remove(sys),
            None => Ok(()),
        };
        let conf_result = self.config.remove();
        dir_result.and(conf_result)
    }

    /// Best-effort [`Jail::remove`] after a failed create. A secondary
    /// failure is logged and handed back, never raised.
    pub fn clean_after_error(&self, sys: &dyn CommandRunner) -> Option<Error> {
        match self.remove(sys) {
            Ok(()) => None,
            Err(e) => {
                warn!(jail = %self.name, error = %e, "cleanup after failed create did not complete");
                Some(e)
            }
        }
    }

    /// Adopt a jail whose config file (and root, when `path` is set) already
    /// exist. A jail of the same name running in the OS is recorded as started.
    pub fn import(&mut self, sys: &dyn CommandRunner) -> Result<()> {
        let file = self.config_file()?;
        if !PathBuf::from(&file).is_file() {
            return Err(Error::NotFound {
                kind: "Jail config file".into(),
                name: file,
            });
        }
        if let Some(path) = self.config.get("path")
            && !PathBuf::from(path).is_dir()
        {
            return Err(Error::NotFound {
                kind: "Jail directory".into(),
                name: path.to_string(),
            });
        }

        self.state = if exists_in_os(sys, &self.name)? {
            JailState::Started
        } else {
            JailState::Stopped
        };
        self.last_updated = Utc::now();
        self.history
            .push(HistoryEntry::new(format!("Import jail {}", self.name)));
        debug!(jail = %self.name, state = %self.state, "jail imported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::FakeRunner;
    use std::fs;

    fn jail_in(tmp: &std::path::Path) -> Jail {
        let mut conf = JailConf::new("web");
        conf.set("host.hostname", "web");
        conf.write(&tmp.join("configs/web.jail")).unwrap();
        let dir = JailDir::new("web", tmp.join("jails/web"));
        fs::create_dir_all(&dir.dirpath).unwrap();
        Jail::new(conf, Some(dir), Some("13.2-RELEASE".into()))
    }

    #[test]
    fn test_exists_in_os_matches_whole_token() {
        let sys = FakeRunner::new(|_, _| {
            Ok("devfs_ruleset=0 name=webapp host.hostname=webapp\nname=db persist\n".into())
        });
        assert!(exists_in_os(&sys, "db").unwrap());
        assert!(exists_in_os(&sys, "webapp").unwrap());
        assert!(!exists_in_os(&sys, "web").unwrap());
    }

    #[test]
    fn test_start_and_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let sys = FakeRunner::ok();
        let mut jail = jail_in(tmp.path());

        jail.start(&sys).unwrap();
        assert_eq!(jail.state, JailState::Started);
        assert!(sys.ran(&format!(
            "jail -c -f {}",
            tmp.path().join("configs/web.jail").display()
        )));
        assert_eq!(jail.history.last().unwrap().text, "Start jail web");

        jail.stop(&sys).unwrap();
        assert_eq!(jail.state, JailState::Stopped);
        assert!(sys.ran("jail -r web"));
        assert_eq!(jail.iteration, 3);
    }

    #[test]
    fn test_failed_start_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let sys = FakeRunner::new(|_, _| Err("jail: web: path does not exist".into()));
        let mut jail = jail_in(tmp.path());

        assert!(jail.start(&sys).is_err());
        assert_eq!(jail.state, JailState::ErrorStarting);
        assert_eq!(jail.iteration, 2);

        jail.state = JailState::Started;
        assert!(jail.stop(&sys).is_err());
        assert_eq!(jail.state, JailState::ErrorStopping);
    }

    #[test]
    fn test_remove_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let sys = FakeRunner::ok();
        let jail = jail_in(tmp.path());

        assert!(jail.clean_after_error(&sys).is_none());
        assert!(!tmp.path().join("jails/web").exists());
        assert!(!tmp.path().join("configs/web.jail").exists());

        // Already gone
        jail.remove(&sys).unwrap();
    }

    #[test]
    fn test_cleanup_reports_secondary_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let sys = FakeRunner::ok();
        let mut jail = jail_in(tmp.path());
        // A directory where the config file should be cannot be removed as a file
        let bogus = tmp.path().join("configs/bogus.jail");
        fs::create_dir_all(&bogus).unwrap();
        jail.config.filepath = Some(bogus);

        assert!(jail.clean_after_error(&sys).is_some());
        assert!(!tmp.path().join("jails/web").exists());
    }

    #[test]
    fn test_import() {
        let tmp = tempfile::tempdir().unwrap();
        let running = FakeRunner::new(|_, _| Ok("name=web host.hostname=web\n".into()));
        let idle = FakeRunner::ok();

        let mut jail = jail_in(tmp.path());
        jail.import(&running).unwrap();
        assert_eq!(jail.state, JailState::Started);

        let mut jail = jail_in(tmp.path());
        jail.import(&idle).unwrap();
        assert_eq!(jail.state, JailState::Stopped);

        jail.config.set("path", "/nonexistent/jailguard/web");
        assert!(matches!(jail.import(&idle), Err(Error::NotFound { .. })));

        let mut jail = jail_in_without_file(tmp.path());
        assert!(matches!(jail.import(&idle), Err(Error::NotFound { .. })));
    }

    fn jail_in_without_file(tmp: &std::path::Path) -> Jail {
        let mut conf = JailConf::new("web");
        conf.filepath = Some(tmp.join("configs/missing.jail"));
        Jail::new(conf, None, None)
    }
}

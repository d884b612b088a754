//! Bridge between operator commands and the managed resources
//!
//! Each operation loads nothing on its own: the logbook is read once when the
//! bridge is opened, then every command runs the same sequence of
//! descriptor operation, logbook update, save and, where PF records changed,
//! regeneration of the jail's rules.

use crate::bulkhead::{BulkheadManager, HostPort, NatPass, PortForward, PortFwdKey};
use crate::error::{Error, Result};
use crate::jail::{Jail, JailConf, JailDir, exists_in_os};
use crate::logbook::{ItemKind, Logbook};
use crate::manifest::JailguardConfig;
use crate::network::{AliasRange, Netif, interface_exists};
use crate::provision::{Base, Provisioner};
use crate::sys::{CommandRunner, HostInfo, OsRelease, validate_name};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, warn};

/// Bridge for managing bases, jails, interfaces and PF records
pub struct Bridge<'a> {
    /// Loaded configuration
    config: JailguardConfig,

    /// Runs every OS command
    sys: &'a dyn CommandRunner,

    /// Persisted state
    logbook: Logbook,

    /// PF anchor management
    bulkhead: BulkheadManager,
}

impl<'a> Bridge<'a> {
    /// Open the state file named by `config`
    pub fn open(config: JailguardConfig, sys: &'a dyn CommandRunner) -> Result<Self> {
        let logbook = Logbook::load(&config.state_file())?;
        let bulkhead = BulkheadManager::new(&config.pf_anchor);
        Ok(Bridge {
            config,
            sys,
            logbook,
            bulkhead,
        })
    }

    pub fn logbook(&self) -> &Logbook {
        &self.logbook
    }

    fn host_release(&self) -> Result<String> {
        Ok(HostInfo::detect(self.sys)?.release.without_patch().to_string())
    }

    fn drift(name: &str) -> Error {
        Error::Drift {
            name: name.to_string(),
            message: format!(
                "exists in the OS but not in state. Remove it manually or run 'jailguard state import jail {}'",
                name
            ),
        }
    }

    fn jail_not_found(name: &str) -> Error {
        Error::NotFound {
            kind: "Jail".into(),
            name: name.to_string(),
        }
    }

    // Bases

    /// Download a base release. Without `release` the host release is used.
    /// A base already in state is left alone unless `overwrite` is set.
    pub fn download_base(&mut self, release: Option<&str>, overwrite: bool) -> Result<()> {
        let host = HostInfo::detect(self.sys)?;
        let release = match release {
            Some(release) => {
                OsRelease::parse(release)?;
                release.to_string()
            }
            None => host.release.without_patch().to_string(),
        };

        let existing = self.logbook.base(&release).cloned();
        if existing.is_some() && !overwrite {
            info!(base = %release, "base already downloaded, use overwrite to fetch it again");
            return Ok(());
        }

        let provisioner = Provisioner::new(
            &self.config.mirror_url,
            &self.config.bases_dir(),
            &host.machine,
        );
        let mut base = existing.unwrap_or_else(|| provisioner.new_base(&release));
        provisioner.download(self.sys, &mut base, overwrite)?;

        info!(base = %release, "base downloaded");
        self.logbook.add_base(base);
        self.logbook.save()
    }

    /// Adopt a base directory that already holds `base.txz`
    pub fn import_base(&mut self, release: &str) -> Result<()> {
        OsRelease::parse(release)?;
        if self.logbook.base(release).is_some() {
            return Err(Error::AlreadyExists {
                kind: "Base".into(),
                name: release.to_string(),
            });
        }

        let mut base = Base::new(release, self.config.base_dir(release));
        base.import()?;
        info!(base = %release, "base imported");
        self.logbook.add_base(base);
        self.logbook.save()
    }

    pub fn remove_base(&mut self, release: &str) -> Result<()> {
        let base = self.logbook.base(release).ok_or_else(|| Error::NotFound {
            kind: "Base".into(),
            name: release.to_string(),
        })?;
        base.remove()?;
        self.logbook.remove_item("base", release)?;
        info!(base = %release, "base removed");
        Ok(())
    }

    pub fn list_bases(&self) -> Vec<String> {
        self.logbook.describe(Some(ItemKind::Base))
    }

    // Jails

    /// Create a jail from a config file. A jail without `path` gets a root
    /// extracted from `base` (the host release when not given).
    pub fn create_jail(&mut self, file: &Path, base: Option<&str>, start: bool) -> Result<()> {
        let mut conf = JailConf::from_file(file)?;
        conf.validate()?;
        conf.apply_defaults();
        let name = conf.name.clone();

        if self.logbook.jail(&name).is_some() {
            return Err(Error::AlreadyExists {
                kind: "Jail".into(),
                name,
            });
        }
        if exists_in_os(self.sys, &name)? {
            return Err(Self::drift(&name));
        }

        let mut tarball = None;
        let mut release = None;
        if conf.get("path").is_none() {
            let rls = match base {
                Some(rls) => rls.to_string(),
                None => self.host_release()?,
            };
            let base = self.logbook.base(&rls).ok_or_else(|| Error::NotFound {
                kind: "Base".into(),
                name: rls.clone(),
            })?;
            let dirpath = self.config.jail_dir(&name);
            if dirpath.exists() {
                return Err(Error::AlreadyExists {
                    kind: "Jail directory".into(),
                    name: dirpath.display().to_string(),
                });
            }
            tarball = Some(base.tarball());
            release = Some(rls);
        }

        let dir = tarball
            .as_ref()
            .map(|_| JailDir::new(&name, self.config.jail_dir(&name)));
        let mut jail = Jail::new(conf, dir, release);

        if let Err(e) = self.materialize(&mut jail, tarball.as_deref()) {
            jail.clean_after_error(self.sys);
            return Err(e);
        }

        info!(jail = %name, "jail created");
        self.logbook.add_jail(jail);
        self.logbook.save()?;

        if start {
            self.start_jail(&name)?;
        }
        Ok(())
    }

    /// Extract the root, if the jail owns one, and write the config file
    fn materialize(&self, jail: &mut Jail, tarball: Option<&Path>) -> Result<()> {
        if let (Some(dir), Some(tarball)) = (jail.dir.as_mut(), tarball) {
            dir.create_from_tarball(self.sys, tarball)?;
            let path = dir.dirpath.display().to_string();
            jail.config.set("path", &path);
        }
        jail.config.write(&self.config.jail_conf_file(&jail.name))
    }

    pub fn start_jail(&mut self, name: &str) -> Result<()> {
        let live = exists_in_os(self.sys, name)?;
        let Some(jail) = self.logbook.jail_mut(name) else {
            return Err(if live {
                Self::drift(name)
            } else {
                Self::jail_not_found(name)
            });
        };
        if live {
            info!(jail = %name, "jail is already running");
            return Ok(());
        }
        if jail.state.is_error() {
            warn!(jail = %name, state = %jail.state, "previous attempt failed, trying again");
        }

        let started = jail.start(self.sys);
        let saved = self.logbook.save();
        started.and(saved)
    }

    pub fn stop_jail(&mut self, name: &str) -> Result<()> {
        let live = exists_in_os(self.sys, name)?;
        let Some(jail) = self.logbook.jail_mut(name) else {
            return Err(if live {
                Self::drift(name)
            } else {
                Self::jail_not_found(name)
            });
        };
        if !live {
            info!(jail = %name, "jail is not running");
            return Ok(());
        }

        let stopped = jail.stop(self.sys);
        let saved = self.logbook.save();
        stopped.and(saved)
    }

    /// Remove a jail, its root, its config file and its PF records.
    /// A running jail is only stopped when `stop` is set.
    pub fn remove_jail(&mut self, name: &str, stop: bool) -> Result<()> {
        let live = exists_in_os(self.sys, name)?;
        let Some(jail) = self.logbook.jail_mut(name) else {
            if live {
                return Err(Self::drift(name));
            }
            info!(jail = %name, "jail not in state, nothing to remove");
            return Ok(());
        };

        if live {
            if !stop {
                return Err(Error::Validation(format!(
                    "Jail {} is running, stop it first or remove it with --stop",
                    name
                )));
            }
            if let Err(e) = jail.stop(self.sys) {
                self.logbook.save()?;
                return Err(e);
            }
        }

        let keys: Vec<PortFwdKey> = self
            .logbook
            .port_fwds_for(name)
            .iter()
            .map(|fwd| fwd.key())
            .collect();
        for key in &keys {
            self.logbook.take_port_fwd(key);
        }
        let had_nat = self.logbook.take_nat_pass(name).is_some();

        // The sub-anchor may hold rules even when the file is gone
        let rules = self.config.jail_rules_file(name);
        if (had_nat || !keys.is_empty() || rules.exists())
            && let Err(e) = self.bulkhead.flush(self.sys, name, &rules)
        {
            warn!(jail = %name, error = %e, "failed to flush pf rules");
        }

        let jail = self
            .logbook
            .jail(name)
            .cloned()
            .ok_or_else(|| Self::jail_not_found(name))?;
        if let Err(e) = jail.remove(self.sys) {
            self.logbook.save()?;
            return Err(e);
        }

        self.logbook.remove_item("jail", name)?;
        info!(jail = %name, "jail removed");
        Ok(())
    }

    /// Adopt a jail whose config file is already in the configs directory
    pub fn import_jail(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.logbook.jail(name).is_some() {
            return Err(Error::AlreadyExists {
                kind: "Jail".into(),
                name: name.to_string(),
            });
        }

        let file = self.config.jail_conf_file(name);
        let mut conf = JailConf::from_file(&file)?;
        if conf.name != name {
            return Err(Error::Validation(format!(
                "{} defines jail {}, not {}",
                file.display(),
                conf.name,
                name
            )));
        }
        conf.filepath = Some(file);

        let jail_dir = self.config.jail_dir(name);
        let dir = (conf.get("path").map(Path::new) == Some(jail_dir.as_path()))
            .then(|| JailDir::new(name, jail_dir.clone()));

        let mut jail = Jail::new(conf, dir, None);
        jail.import(self.sys)?;
        info!(jail = %name, state = %jail.state, "jail imported");
        self.logbook.add_jail(jail);
        self.logbook.save()
    }

    pub fn list_jails(&self) -> Vec<String> {
        self.logbook.describe(Some(ItemKind::Jail))
    }

    // State

    pub fn state_list(&self, kind: Option<&str>) -> Result<Vec<String>> {
        let filter = kind.map(str::parse::<ItemKind>).transpose()?;
        Ok(self.logbook.describe(filter))
    }

    pub fn state_remove(&mut self, kind: &str, name: &str) -> Result<()> {
        if !self.logbook.remove_item(kind, name)? {
            info!(kind, name, "not in state");
        }
        Ok(())
    }

    pub fn state_import(&mut self, kind: &str, name: &str) -> Result<()> {
        match kind.parse::<ItemKind>()? {
            ItemKind::Base => self.import_base(name),
            ItemKind::Jail => self.import_jail(name),
            other => Err(Error::Validation(format!(
                "Items of kind {} cannot be imported",
                other
            ))),
        }
    }

    // Network interfaces

    pub fn create_netif(
        &mut self,
        name: &str,
        begin: Ipv4Addr,
        end: Ipv4Addr,
        system_name: Option<&str>,
    ) -> Result<()> {
        validate_name(name)?;
        if self.logbook.netif(name).is_some() {
            return Err(Error::AlreadyExists {
                kind: "Network interface".into(),
                name: name.to_string(),
            });
        }

        let range = AliasRange::new(begin, end)?;
        let mut netif = Netif::new(name, range);
        netif.create(self.sys, system_name)?;
        self.logbook.add_netif(netif);
        self.logbook.save()
    }

    pub fn destroy_netif(&mut self, name: &str) -> Result<()> {
        let netif = self.netif(name)?;
        netif.destroy(self.sys)?;
        self.logbook.remove_item("netif", name)?;
        info!(netif = %name, "network interface destroyed");
        Ok(())
    }

    pub fn list_netifs(&self) -> Vec<String> {
        self.logbook.describe(Some(ItemKind::Netif))
    }

    fn netif(&self, name: &str) -> Result<&Netif> {
        self.logbook
            .netif(name)
            .ok_or_else(|| Self::netif_not_found(name))
    }

    fn netif_not_found(name: &str) -> Error {
        Error::NotFound {
            kind: "Network interface".into(),
            name: name.to_string(),
        }
    }

    /// Bind an alias, picking the lowest free address when `ip` is not given
    pub fn add_alias(&mut self, name: &str, ip: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let netif = self
            .logbook
            .netif_mut(name)
            .ok_or_else(|| Self::netif_not_found(name))?;
        let ip = netif.add_alias(self.sys, ip)?;
        self.logbook.save()?;
        Ok(ip)
    }

    pub fn delete_alias(&mut self, name: &str, ip: Ipv4Addr) -> Result<()> {
        let netif = self
            .logbook
            .netif_mut(name)
            .ok_or_else(|| Self::netif_not_found(name))?;
        netif.delete_alias(self.sys, ip)?;
        self.logbook.save()
    }

    pub fn list_aliases(&self, name: &str) -> Result<Vec<String>> {
        let netif = self.netif(name)?;
        Ok(netif
            .aliases
            .iter()
            .map(|ip| format!("netif {} alias {}", netif.name, ip))
            .collect())
    }

    // PF

    pub fn check_pf_anchor(&self) -> Result<()> {
        self.bulkhead.check_anchors(self.sys)
    }

    /// Regenerate, write and load the rules of one jail
    fn apply_rules(&self, name: &str) -> Result<()> {
        let jail = self
            .logbook
            .jail(name)
            .ok_or_else(|| Self::jail_not_found(name))?;
        let forwards = self.logbook.port_fwds_for(name);
        let nat = self.logbook.nat_pass(name);
        debug!(jail = %name, forwards = forwards.len(), nat = nat.is_some(), "applying pf rules");
        self.bulkhead.apply(
            self.sys,
            &jail.config,
            nat,
            &forwards,
            &self.config.jail_rules_file(name),
        )
    }

    /// Anchors present and the jail known to the logbook
    fn pf_target(&self, jail: &str) -> Result<()> {
        self.bulkhead.check_anchors(self.sys)?;
        if self.logbook.jail(jail).is_none() {
            return Err(Self::jail_not_found(jail));
        }
        Ok(())
    }

    // Port forwards

    pub fn add_port_fwd(&mut self, fwd: PortForward) -> Result<()> {
        self.pf_target(&fwd.dst_jail)?;

        let src: HostPort = fwd.host_port();
        if self.logbook.port_fwd_from(&src).is_some() {
            return Err(Error::AlreadyExists {
                kind: "Port forward".into(),
                name: src.to_string(),
            });
        }

        let jail = fwd.dst_jail.clone();
        info!(jail = %jail, forward = %fwd.key(), "adding port forward");
        self.logbook.add_port_fwd(fwd);
        self.apply_rules(&jail)?;
        self.logbook.save()
    }

    /// Delete a forward. An unknown forward is not an error.
    pub fn delete_port_fwd(&mut self, key: &PortFwdKey) -> Result<()> {
        self.pf_target(&key.dst_jail)?;

        if self.logbook.take_port_fwd(key).is_none() {
            debug!(forward = %key, "no such port forward");
            return Ok(());
        }
        self.apply_rules(&key.dst_jail)?;
        self.logbook.save()
    }

    pub fn flush_port_fwds(&mut self, jail: &str) -> Result<()> {
        self.pf_target(jail)?;

        let keys: Vec<PortFwdKey> = self
            .logbook
            .port_fwds_for(jail)
            .iter()
            .map(|fwd| fwd.key())
            .collect();
        for key in &keys {
            self.logbook.take_port_fwd(key);
        }
        self.apply_rules(jail)?;
        self.logbook.save()
    }

    pub fn list_port_fwds(&self, jail: &str) -> Vec<String> {
        self.logbook
            .port_fwds_for(jail)
            .iter()
            .map(|fwd| {
                format!(
                    "jailportfwd srcif {} srcport {} dstjail {} dstport {}",
                    fwd.src_if, fwd.src_port, fwd.dst_jail, fwd.dst_port
                )
            })
            .collect()
    }

    // NAT passes

    pub fn add_nat_pass(&mut self, jail: &str, gw_if: &str) -> Result<()> {
        self.pf_target(jail)?;

        if self.logbook.nat_pass(jail).is_some() {
            return Err(Error::AlreadyExists {
                kind: "NAT pass for jail".into(),
                name: jail.to_string(),
            });
        }
        if !interface_exists(self.sys, gw_if)? {
            return Err(Error::InterfaceNotFound(gw_if.to_string()));
        }

        self.logbook.add_nat_pass(NatPass::new(jail, gw_if));
        self.apply_rules(jail)?;
        self.logbook.save()
    }

    pub fn remove_nat_pass(&mut self, jail: &str) -> Result<()> {
        self.pf_target(jail)?;

        if self.logbook.take_nat_pass(jail).is_none() {
            return Err(Error::NotFound {
                kind: "NAT pass for jail".into(),
                name: jail.to_string(),
            });
        }
        self.apply_rules(jail)?;
        self.logbook.save()
    }

    pub fn show_nat_pass(&self, jail: &str) -> Option<String> {
        self.logbook
            .nat_pass(jail)
            .map(|nat| format!("jailnatpass jail {} gwif {}", nat.jail_name, nat.gw_if))
    }
}

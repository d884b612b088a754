//! Persisted state of every resource jailguard manages
//!
//! The logbook is a single JSON document holding bases, jails, network
//! interfaces, port forwards and NAT passes, plus an append-only history.
//! It is loaded at the start of a command and saved after each mutation.

use crate::bulkhead::{HostPort, NatPass, PortForward, PortFwdKey};
use crate::error::{Error, Result};
use crate::jail::Jail;
use crate::network::Netif;
use crate::provision::Base;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Schema version written to the state file
pub const STATE_VERSION: &str = "2";

/// One line of an item's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl HistoryEntry {
    pub fn new(text: impl Into<String>) -> Self {
        HistoryEntry {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }
}

/// Kinds of items held in the logbook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Base,
    Jail,
    Netif,
    JailPortFwd,
    JailNatPass,
}

impl ItemKind {
    pub const ALL: [ItemKind; 5] = [
        ItemKind::Base,
        ItemKind::Jail,
        ItemKind::Netif,
        ItemKind::JailPortFwd,
        ItemKind::JailNatPass,
    ];
}

impl FromStr for ItemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "base" => Ok(ItemKind::Base),
            "jail" => Ok(ItemKind::Jail),
            "netif" => Ok(ItemKind::Netif),
            "jailportfwd" => Ok(ItemKind::JailPortFwd),
            "jailnatpass" => Ok(ItemKind::JailNatPass),
            _ => Err(Error::InvalidKind(s.to_string())),
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemKind::Base => "base",
            ItemKind::Jail => "jail",
            ItemKind::Netif => "netif",
            ItemKind::JailPortFwd => "jailportfwd",
            ItemKind::JailNatPass => "jailnatpass",
        };
        write!(f, "{}", s)
    }
}

/// The state document as found on disk. Maps and entries may be null.
#[derive(Deserialize)]
struct StoredLogbook {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    software: Option<String>,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    iteration: u64,
    #[serde(default)]
    history: Option<Vec<HistoryEntry>>,
    #[serde(default)]
    bases: Option<BTreeMap<String, Option<Base>>>,
    #[serde(default)]
    jails: Option<BTreeMap<String, Option<Jail>>>,
    #[serde(default)]
    network_interfaces: Option<BTreeMap<String, Option<Netif>>>,
    #[serde(default)]
    jail_port_fwds: Option<BTreeMap<String, Option<PortForward>>>,
    #[serde(default)]
    jail_nat_passes: Option<BTreeMap<String, Option<NatPass>>>,
}

/// Present entries of a possibly-null map
fn present<V>(map: Option<BTreeMap<String, Option<V>>>) -> impl Iterator<Item = (String, V)> {
    map.unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
}

impl From<StoredLogbook> for Logbook {
    fn from(stored: StoredLogbook) -> Self {
        let now = Utc::now();
        let mut logbook = Logbook {
            version: stored.version.unwrap_or_else(|| STATE_VERSION.to_string()),
            software: stored.software.unwrap_or_else(software_tag),
            created: stored.created.unwrap_or(now),
            last_updated: stored.last_updated.unwrap_or(now),
            iteration: stored.iteration,
            history: stored.history.unwrap_or_default(),
            bases: present(stored.bases).collect(),
            jails: present(stored.jails)
                .map(|(_, jail)| (jail.name.clone(), jail))
                .collect(),
            network_interfaces: present(stored.network_interfaces).collect(),
            jail_port_fwds: present(stored.jail_port_fwds)
                .map(|(_, fwd)| (fwd.key(), fwd))
                .collect(),
            jail_nat_passes: present(stored.jail_nat_passes)
                .map(|(_, nat)| (nat.jail_name.clone(), nat))
                .collect(),
            path: PathBuf::new(),
        };
        logbook.relink();
        logbook
    }
}

fn software_tag() -> String {
    format!("jailguard {}", env!("CARGO_PKG_VERSION"))
}

/// The entity store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredLogbook")]
pub struct Logbook {
    pub version: String,
    pub software: String,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub iteration: u64,
    pub history: Vec<HistoryEntry>,
    bases: BTreeMap<String, Base>,
    jails: BTreeMap<String, Jail>,
    network_interfaces: BTreeMap<String, Netif>,
    jail_port_fwds: BTreeMap<PortFwdKey, PortForward>,
    jail_nat_passes: BTreeMap<String, NatPass>,
    #[serde(skip)]
    path: PathBuf,
}

impl Logbook {
    /// An empty logbook that will be saved to `path`
    pub fn new(path: &Path) -> Self {
        let now = Utc::now();
        Logbook {
            version: STATE_VERSION.to_string(),
            software: software_tag(),
            created: now,
            last_updated: now,
            iteration: 0,
            history: Vec::new(),
            bases: BTreeMap::new(),
            jails: BTreeMap::new(),
            network_interfaces: BTreeMap::new(),
            jail_port_fwds: BTreeMap::new(),
            jail_nat_passes: BTreeMap::new(),
            path: path.to_path_buf(),
        }
    }

    /// Read the state file. A missing file gives an empty logbook.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file yet, starting empty");
                return Ok(Logbook::new(path));
            }
            Err(e) => {
                return Err(Error::StateRead {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };

        let mut logbook: Logbook = serde_json::from_str(&content).map_err(|e| Error::StateRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        logbook.path = path.to_path_buf();
        debug!(path = %path.display(), iteration = logbook.iteration, "state loaded");
        Ok(logbook)
    }

    /// Rebuild every jail's port forward and NAT pass view from the records
    fn relink(&mut self) {
        for jail in self.jails.values_mut() {
            jail.port_fwds = self
                .jail_port_fwds
                .values()
                .filter(|fwd| fwd.dst_jail == jail.name)
                .map(|fwd| (fwd.host_port(), fwd.dst_port))
                .collect::<BTreeMap<HostPort, u16>>();
            jail.nat_pass = self
                .jail_nat_passes
                .get(&jail.name)
                .map(|nat| nat.gw_if.clone());
        }
    }

    fn record(&mut self, text: String) {
        debug!(entry = %text, "state history");
        self.history.push(HistoryEntry::new(text));
    }

    /// Persist to the state file through a temporary sibling and a rename
    pub fn save(&mut self) -> Result<()> {
        self.relink();
        self.version = STATE_VERSION.to_string();
        self.software = software_tag();
        self.iteration += 1;
        self.last_updated = Utc::now();

        let persistence = |message: String| Error::Persistence {
            path: self.path.clone(),
            message,
        };

        let json = serde_json::to_string_pretty(self).map_err(|e| persistence(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| persistence(e.to_string()))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(|e| persistence(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| persistence(e.to_string()))?;

        debug!(path = %self.path.display(), iteration = self.iteration, "state saved");
        Ok(())
    }

    // Bases

    pub fn base(&self, release: &str) -> Option<&Base> {
        self.bases.get(release)
    }

    pub fn add_base(&mut self, base: Base) {
        self.record(format!("Add base {}", base.release));
        self.bases.insert(base.release.clone(), base);
    }

    // Jails

    pub fn jail(&self, name: &str) -> Option<&Jail> {
        self.jails.get(name)
    }

    pub fn jail_mut(&mut self, name: &str) -> Option<&mut Jail> {
        self.jails.get_mut(name)
    }

    pub fn add_jail(&mut self, mut jail: Jail) {
        self.record(format!("Add jail {}", jail.name));
        jail.port_fwds = BTreeMap::new();
        jail.nat_pass = None;
        self.jails.insert(jail.name.clone(), jail);
        self.relink();
    }

    // Network interfaces

    pub fn netif(&self, name: &str) -> Option<&Netif> {
        self.network_interfaces.get(name)
    }

    pub fn netif_mut(&mut self, name: &str) -> Option<&mut Netif> {
        self.network_interfaces.get_mut(name)
    }

    pub fn add_netif(&mut self, netif: Netif) {
        self.record(format!("Add network interface {}", netif.name));
        self.network_interfaces.insert(netif.name.clone(), netif);
    }

    // Port forwards

    /// Forwards whose destination is `jail`, in key order
    pub fn port_fwds_for(&self, jail: &str) -> Vec<&PortForward> {
        self.jail_port_fwds
            .values()
            .filter(|fwd| fwd.dst_jail == jail)
            .collect()
    }

    /// The forward already using a host interface and port, if any
    pub fn port_fwd_from(&self, src: &HostPort) -> Option<&PortForward> {
        self.jail_port_fwds
            .values()
            .find(|fwd| fwd.src_if == src.src_if && fwd.src_port == src.src_port)
    }

    pub fn add_port_fwd(&mut self, fwd: PortForward) {
        let key = fwd.key();
        self.record(format!("Add port forward {}", key));
        self.jail_port_fwds.insert(key, fwd);
        self.relink();
    }

    /// Drop a forward from memory without saving
    pub fn take_port_fwd(&mut self, key: &PortFwdKey) -> Option<PortForward> {
        let fwd = self.jail_port_fwds.remove(key)?;
        self.record(format!("Remove item jailportfwd {}", key));
        self.relink();
        Some(fwd)
    }

    // NAT passes

    pub fn nat_pass(&self, jail: &str) -> Option<&NatPass> {
        self.jail_nat_passes.get(jail)
    }

    pub fn add_nat_pass(&mut self, nat: NatPass) {
        self.record(format!(
            "Add NAT pass for jail {} through {}",
            nat.jail_name, nat.gw_if
        ));
        self.jail_nat_passes.insert(nat.jail_name.clone(), nat);
        self.relink();
    }

    /// Drop a NAT pass from memory without saving
    pub fn take_nat_pass(&mut self, jail: &str) -> Option<NatPass> {
        let nat = self.jail_nat_passes.remove(jail)?;
        self.record(format!("Remove item jailnatpass {}", jail));
        self.relink();
        Some(nat)
    }

    /// Delete an item and save right away. Returns whether anything was removed;
    /// an absent name changes nothing and writes nothing.
    pub fn remove_item(&mut self, kind: &str, name: &str) -> Result<bool> {
        if name.is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        let kind: ItemKind = kind.parse()?;

        let removed = match kind {
            ItemKind::Base => self.bases.remove(name).is_some(),
            ItemKind::Jail => self.jails.remove(name).is_some(),
            ItemKind::Netif => self.network_interfaces.remove(name).is_some(),
            ItemKind::JailPortFwd => match name.parse::<PortFwdKey>() {
                Ok(key) => self.jail_port_fwds.remove(&key).is_some(),
                Err(_) => false,
            },
            ItemKind::JailNatPass => self.jail_nat_passes.remove(name).is_some(),
        };

        if !removed {
            debug!(kind = %kind, name, "nothing to remove");
            return Ok(false);
        }

        info!(kind = %kind, name, "item removed from state");
        self.record(format!("Remove item {} {}", kind, name));
        self.save()?;
        Ok(true)
    }

    /// One line per item, optionally restricted to one kind
    pub fn describe(&self, filter: Option<ItemKind>) -> Vec<String> {
        let kinds: &[ItemKind] = match &filter {
            Some(kind) => std::slice::from_ref(kind),
            None => &ItemKind::ALL,
        };

        let mut lines = Vec::new();
        for kind in kinds {
            match kind {
                ItemKind::Base => {
                    lines.extend(self.bases.keys().map(|rls| format!("base {}", rls)));
                }
                ItemKind::Jail => {
                    lines.extend(
                        self.jails
                            .values()
                            .map(|jail| format!("jail {} {}", jail.name, jail.state)),
                    );
                }
                ItemKind::Netif => {
                    lines.extend(
                        self.network_interfaces
                            .values()
                            .map(|netif| format!("netif {} {}", netif.name, netif.system_name)),
                    );
                }
                ItemKind::JailPortFwd => {
                    lines.extend(self.jail_port_fwds.values().map(|fwd| {
                        format!(
                            "jailportfwd srcif {} srcport {} dstjail {} dstport {}",
                            fwd.src_if, fwd.src_port, fwd.dst_jail, fwd.dst_port
                        )
                    }));
                }
                ItemKind::JailNatPass => {
                    lines.extend(self.jail_nat_passes.values().map(|nat| {
                        format!("jailnatpass jail {} gwif {}", nat.jail_name, nat.gw_if)
                    }));
                }
            }
        }
        lines
    }
}

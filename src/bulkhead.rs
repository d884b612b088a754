//! Firewall management for jail NAT and port forwarding
//!
//! Uses PF (Packet Filter) anchors so jail rules never touch the host's
//! pf.conf beyond three anchor lines. Each jail owns the sub-anchor
//! `<anchor>/<jail>`, loaded from a generated `<jail>.pf` file.

use crate::error::{Error, Result};
use crate::jail::JailConf;
use crate::network::interface_exists;
use crate::sys::CommandRunner;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Host side of a port forward: interface and port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPort {
    pub src_if: String,
    pub src_port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.src_if, self.src_port)
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (src_if, src_port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidName(s.to_string()))?;
        Ok(HostPort {
            src_if: src_if.to_string(),
            src_port: parse_port(src_port)?,
        })
    }
}

/// Unique identity of a port forward
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortFwdKey {
    pub src_if: String,
    pub src_port: u16,
    pub dst_jail: String,
    pub dst_port: u16,
}

impl fmt::Display for PortFwdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.src_if, self.src_port, self.dst_jail, self.dst_port
        )
    }
}

impl FromStr for PortFwdKey {
    type Err = Error;

    /// Accepts `if:port:jail:port` and the older `if__port__jail__port`
    fn from_str(s: &str) -> Result<Self> {
        // Names may contain `__`, so the legacy split is only a fallback
        key_from_parts(s, s.split(':').collect())
            .or_else(|err| key_from_parts(s, s.split("__").collect()).map_err(|_| err))
    }
}

fn key_from_parts(s: &str, parts: Vec<&str>) -> Result<PortFwdKey> {
    match parts.as_slice() {
        [src_if, src_port, dst_jail, dst_port] if !src_if.is_empty() && !dst_jail.is_empty() => {
            Ok(PortFwdKey {
                src_if: src_if.to_string(),
                src_port: parse_port(src_port)?,
                dst_jail: dst_jail.to_string(),
                dst_port: parse_port(dst_port)?,
            })
        }
        _ => Err(Error::InvalidName(s.to_string())),
    }
}

/// Serialize through Display and FromStr so structured keys can be JSON map keys
macro_rules! string_keyed {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_keyed!(HostPort);
string_keyed!(PortFwdKey);

fn parse_port(s: &str) -> Result<u16> {
    match s.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::Validation(format!("Invalid port '{}'", s))),
    }
}

/// Redirect of a host interface/port to a jail port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub src_if: String,
    pub src_port: u16,
    pub dst_jail: String,
    pub dst_port: u16,
}

impl PortForward {
    pub fn new(src_if: &str, src_port: u16, dst_jail: &str, dst_port: u16) -> Self {
        PortForward {
            src_if: src_if.to_string(),
            src_port,
            dst_jail: dst_jail.to_string(),
            dst_port,
        }
    }

    pub fn key(&self) -> PortFwdKey {
        PortFwdKey {
            src_if: self.src_if.clone(),
            src_port: self.src_port,
            dst_jail: self.dst_jail.clone(),
            dst_port: self.dst_port,
        }
    }

    pub fn host_port(&self) -> HostPort {
        HostPort {
            src_if: self.src_if.clone(),
            src_port: self.src_port,
        }
    }

    /// Generate the PF rdr rule
    pub fn to_pf_rule(&self, jail_ip: &str) -> String {
        format!(
            "rdr pass on {} inet proto tcp from any to ({}:0) port {} -> {} port {}",
            self.src_if, self.src_if, self.src_port, jail_ip, self.dst_port
        )
    }
}

impl From<&PortFwdKey> for PortForward {
    fn from(key: &PortFwdKey) -> Self {
        PortForward::new(&key.src_if, key.src_port, &key.dst_jail, key.dst_port)
    }
}

/// Outbound NAT for a jail through a gateway interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatPass {
    pub jail_name: String,
    pub gw_if: String,
}

impl NatPass {
    pub fn new(jail_name: &str, gw_if: &str) -> Self {
        NatPass {
            jail_name: jail_name.to_string(),
            gw_if: gw_if.to_string(),
        }
    }

    /// Generate the PF nat rule
    pub fn to_pf_rule(&self, jail_ip: &str) -> String {
        format!(
            "nat pass on {} from {}/32 to any -> ({}:0)",
            self.gw_if, jail_ip, self.gw_if
        )
    }
}

/// First address of an `ip4.addr` value, without `iface|` prefix or `/mask`
pub fn jail_address(ip4_addr: &str) -> Option<&str> {
    let first = ip4_addr.split(',').next()?.trim();
    let addr = first.rsplit_once('|').map_or(first, |(_, a)| a);
    let addr = addr.split_once('/').map_or(addr, |(a, _)| a).trim();
    (!addr.is_empty()).then_some(addr)
}

/// Render the rules of one jail. Nothing is emitted when the jail has no
/// `ip4.addr`. Forwards are emitted in the order given.
pub fn render_rules(
    sys: &dyn CommandRunner,
    conf: &JailConf,
    nat: Option<&NatPass>,
    forwards: &[&PortForward],
) -> Result<String> {
    let Some(ip) = conf.get("ip4.addr").and_then(jail_address) else {
        debug!(jail = %conf.name, "no ip4.addr, no pf rules");
        return Ok(String::new());
    };

    let mut rules = String::new();
    if let Some(nat) = nat {
        if !interface_exists(sys, &nat.gw_if)? {
            return Err(Error::InterfaceNotFound(nat.gw_if.clone()));
        }
        rules.push_str(&nat.to_pf_rule(ip));
        rules.push('\n');
    }
    for fwd in forwards {
        rules.push_str(&fwd.to_pf_rule(ip));
        rules.push('\n');
    }
    Ok(rules)
}

/// Bulkhead manager for the jailguard PF anchor
#[derive(Debug, Clone)]
pub struct BulkheadManager {
    anchor: String,
}

impl BulkheadManager {
    pub fn new(anchor: &str) -> Self {
        BulkheadManager {
            anchor: anchor.to_string(),
        }
    }

    /// The anchor lines pf.conf must carry
    pub fn anchor_lines(&self) -> [String; 3] {
        [
            format!("nat-anchor \"{}/*\"", self.anchor),
            format!("rdr-anchor \"{}/*\"", self.anchor),
            format!("anchor \"{}/*\"", self.anchor),
        ]
    }

    /// Anchor lines missing from the loaded PF configuration
    pub fn missing_anchors(&self, sys: &dyn CommandRunner) -> Result<Vec<String>> {
        let out = sys.output("pfctl", &["-s", "all"])?;
        let missing = self
            .anchor_lines()
            .into_iter()
            .filter(|wanted| {
                !out.lines()
                    .any(|line| line.trim_start().starts_with(wanted.as_str()))
            })
            .collect();
        Ok(missing)
    }

    /// Check that PF has the jailguard anchors, explaining how to add them if not
    pub fn check_anchors(&self, sys: &dyn CommandRunner) -> Result<()> {
        let missing = self.missing_anchors(sys)?;
        if missing.is_empty() {
            debug!(anchor = %self.anchor, "pf anchors present");
            return Ok(());
        }
        Err(Error::MissingAnchors(self.help()))
    }

    fn help(&self) -> String {
        let [nat, rdr, filter] = self.anchor_lines();
        format!(
            "Add the following lines to /etc/pf.conf:\n{}\n{}\n{}\nThen run 'pfctl -f /etc/pf.conf' to reload. \
             This replaces all loaded rules with the ones from the file.",
            nat, rdr, filter
        )
    }

    /// Write the jail rules file. An empty ruleset still produces a file.
    pub fn write_rules(&self, jail: &str, path: &Path, rules: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, rules)?;
        debug!(jail, path = %path.display(), "pf rules written");
        Ok(())
    }

    /// Load a jail rules file into `<anchor>/<jail>`.
    /// A missing file is skipped; a directory in its place is an error.
    pub fn load_rules(&self, sys: &dyn CommandRunner, jail: &str, path: &Path) -> Result<()> {
        match fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(jail, "jail has no pf rules file");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
            Ok(meta) if meta.is_dir() => {
                return Err(Error::Validation(format!(
                    "PF rules path {} is a directory, fix it manually",
                    path.display()
                )));
            }
            Ok(_) => {}
        }

        let anchor = format!("{}/{}", self.anchor, jail);
        let file = path.display().to_string();
        sys.run("pfctl", &["-a", &anchor, "-f", &file])?;
        debug!(jail, anchor = %anchor, "pf rules loaded");
        Ok(())
    }

    /// Render, write and load the rules of one jail
    pub fn apply(
        &self,
        sys: &dyn CommandRunner,
        conf: &JailConf,
        nat: Option<&NatPass>,
        forwards: &[&PortForward],
        path: &Path,
    ) -> Result<()> {
        let rules = render_rules(sys, conf, nat, forwards)?;
        self.write_rules(&conf.name, path, &rules)?;
        self.load_rules(sys, &conf.name, path)
    }

    /// Empty the jail sub-anchor and delete its rules file
    pub fn flush(&self, sys: &dyn CommandRunner, jail: &str, path: &Path) -> Result<()> {
        self.write_rules(jail, path, "")?;
        self.load_rules(sys, jail, path)?;
        fs::remove_file(path)?;
        Ok(())
    }
}

//! Loopback interfaces carrying jail addresses
//!
//! Each managed interface is a cloned `loN` with a range of alias addresses
//! that jails bind their `ip4.addr` to.

use crate::error::{Error, Result};
use crate::logbook::HistoryEntry;
use crate::network::interface_exists;
use crate::network::ip::AliasRange;
use crate::sys::CommandRunner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Highest `loN` probed when picking a free interface
const MAX_LOOPBACK: u32 = 2999;

/// Check a system interface name: `lo` followed by one to three digits
pub fn is_valid_system_name(name: &str) -> bool {
    name.strip_prefix("lo")
        .is_some_and(|n| (1..=3).contains(&n.len()) && n.chars().all(|c| c.is_ascii_digit()))
}

/// A managed loopback interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Netif {
    /// jailguard name
    pub name: String,
    /// OS interface name, e.g. `lo1`
    pub system_name: String,
    pub ip_addr_begin: Ipv4Addr,
    pub ip_addr_end: Ipv4Addr,
    #[serde(default)]
    pub aliases: Vec<Ipv4Addr>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub iteration: u64,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Netif {
    pub fn new(name: &str, range: AliasRange) -> Self {
        let now = Utc::now();
        Netif {
            name: name.to_string(),
            system_name: String::new(),
            ip_addr_begin: range.begin,
            ip_addr_end: range.end,
            aliases: Vec::new(),
            created: now,
            last_updated: now,
            iteration: 1,
            history: Vec::new(),
        }
    }

    pub fn range(&self) -> Result<AliasRange> {
        AliasRange::new(self.ip_addr_begin, self.ip_addr_end)
    }

    fn record(&mut self, text: String) {
        self.iteration += 1;
        self.last_updated = Utc::now();
        self.history.push(HistoryEntry::new(text));
    }

    fn ifconfig(&self, sys: &dyn CommandRunner, args: &[&str]) -> Result<()> {
        let mut full = vec![self.system_name.as_str()];
        full.extend_from_slice(args);
        sys.run("ifconfig", &full)
    }

    fn free_system_name(sys: &dyn CommandRunner) -> Result<String> {
        for i in 1..=MAX_LOOPBACK {
            let candidate = format!("lo{}", i);
            if !interface_exists(sys, &candidate)? {
                debug!(interface = %candidate, "found free interface name");
                return Ok(candidate);
            }
        }
        Err(Error::NoFreeInterface)
    }

    /// Create and bring up the interface. With `requested` the name must be a
    /// valid `loN` that does not exist yet, otherwise the first free one is used.
    pub fn create(&mut self, sys: &dyn CommandRunner, requested: Option<&str>) -> Result<()> {
        self.system_name = match requested {
            Some(name) => {
                if !is_valid_system_name(name) {
                    return Err(Error::Validation(format!(
                        "Interface name '{}' should be 'lo' followed by a number",
                        name
                    )));
                }
                if interface_exists(sys, name)? {
                    return Err(Error::AlreadyExists {
                        kind: "Network interface".into(),
                        name: name.to_string(),
                    });
                }
                name.to_string()
            }
            None => Self::free_system_name(sys)?,
        };

        self.ifconfig(sys, &["create"])?;
        self.ifconfig(sys, &["up"])?;
        info!(netif = %self.name, interface = %self.system_name, "interface created");
        self.record(format!("Create interface {}", self.system_name));
        Ok(())
    }

    /// Whether the OS already has `ip` bound on this interface
    pub fn alias_bound(&self, sys: &dyn CommandRunner, ip: Ipv4Addr) -> Result<bool> {
        let out = sys.output("ifconfig", &[&self.system_name])?;
        Ok(out.contains(&format!("inet {} netmask", ip)))
    }

    /// Bind an alias and track it. Without `ip` the lowest untracked address of
    /// the range is used. An address that is already tracked is returned as is.
    pub fn add_alias(&mut self, sys: &dyn CommandRunner, ip: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let range = self.range()?;
        let ip = match ip {
            None => range.next_free(&self.aliases)?,
            Some(ip) if self.aliases.contains(&ip) => return Ok(ip),
            Some(ip) if !range.contains(ip) => {
                return Err(Error::Validation(format!(
                    "Address {} is outside of {} - {}",
                    ip, range.begin, range.end
                )));
            }
            Some(ip) => ip,
        };

        if self.alias_bound(sys, ip)? {
            return Err(Error::AddressInUse(ip.to_string()));
        }

        let cidr = format!("{}/{}", ip, range.subnet().prefix_len());
        self.ifconfig(sys, &["inet", &cidr, "alias"])?;
        self.aliases.push(ip);
        self.record(format!("Add alias {}", ip));
        debug!(netif = %self.name, alias = %ip, "alias added");
        Ok(ip)
    }

    /// Unbind an alias if the OS has it and stop tracking it.
    /// An unknown alias is ignored.
    pub fn delete_alias(&mut self, sys: &dyn CommandRunner, ip: Ipv4Addr) -> Result<()> {
        if !self.aliases.contains(&ip) {
            return Ok(());
        }

        if self.alias_bound(sys, ip)? {
            let cidr = format!("{}/{}", ip, self.range()?.subnet().prefix_len());
            self.ifconfig(sys, &["inet", &cidr, "-alias"])?;
        }

        self.aliases.retain(|a| *a != ip);
        self.record(format!("Delete alias {}", ip));
        debug!(netif = %self.name, alias = %ip, "alias deleted");
        Ok(())
    }

    /// Destroy the OS interface if it is still there
    pub fn destroy(&self, sys: &dyn CommandRunner) -> Result<()> {
        if self.system_name.is_empty() || !interface_exists(sys, &self.system_name)? {
            debug!(netif = %self.name, "interface already gone");
            return Ok(());
        }
        self.ifconfig(sys, &["destroy"])?;
        info!(netif = %self.name, interface = %self.system_name, "interface destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::FakeRunner;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet};
    use std::rc::Rc;

    /// Loopbacks and their bound aliases, driven by ifconfig calls
    #[derive(Default)]
    struct Host {
        ifaces: BTreeMap<String, BTreeSet<String>>,
    }

    fn ifconfig_runner(host: Rc<RefCell<Host>>) -> FakeRunner {
        FakeRunner::new(move |program, args| {
            assert_eq!(program, "ifconfig");
            let mut host = host.borrow_mut();
            let iface = args[0].to_string();
            match &args[1..] {
                [] => match host.ifaces.get(&iface) {
                    Some(aliases) => {
                        let mut out = format!("{}: flags=8049<UP,LOOPBACK,RUNNING,MULTICAST>\n", iface);
                        for a in aliases {
                            out.push_str(&format!("\tinet {} netmask 0xffffff00\n", a));
                        }
                        Ok(out)
                    }
                    None => Err(format!("interface {} does not exist", iface)),
                },
                ["create"] => {
                    host.ifaces.insert(iface, BTreeSet::new());
                    Ok(String::new())
                }
                ["up"] => Ok(String::new()),
                ["destroy"] => {
                    host.ifaces.remove(&iface);
                    Ok(String::new())
                }
                ["inet", cidr, op] => {
                    let ip = cidr.trim_end_matches("/24").to_string();
                    let aliases = host.ifaces.get_mut(&iface).ok_or("no such interface")?;
                    if *op == "alias" {
                        aliases.insert(ip);
                    } else {
                        aliases.remove(&ip);
                    }
                    Ok(String::new())
                }
                other => Err(format!("unexpected ifconfig args {:?}", other)),
            }
        })
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn netif() -> Netif {
        Netif::new(
            "jails",
            AliasRange::new(ip("10.0.0.2"), ip("10.0.0.5")).unwrap(),
        )
    }

    #[test]
    fn test_system_name_pattern() {
        assert!(is_valid_system_name("lo1"));
        assert!(is_valid_system_name("lo999"));
        assert!(!is_valid_system_name("lo"));
        assert!(!is_valid_system_name("lo1000"));
        assert!(!is_valid_system_name("em0"));
        assert!(!is_valid_system_name("lo1a"));
    }

    #[test]
    fn test_create_picks_first_free() {
        let host = Rc::new(RefCell::new(Host::default()));
        host.borrow_mut().ifaces.insert("lo1".into(), BTreeSet::new());
        let sys = ifconfig_runner(host.clone());

        let mut ni = netif();
        ni.create(&sys, None).unwrap();
        assert_eq!(ni.system_name, "lo2");
        assert!(sys.ran("ifconfig lo2 create"));
        assert!(sys.ran("ifconfig lo2 up"));
        assert!(host.borrow().ifaces.contains_key("lo2"));
    }

    #[test]
    fn test_create_with_requested_name() {
        let host = Rc::new(RefCell::new(Host::default()));
        host.borrow_mut().ifaces.insert("lo1".into(), BTreeSet::new());
        let sys = ifconfig_runner(host);

        let mut ni = netif();
        assert!(matches!(
            ni.create(&sys, Some("lo1")),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(matches!(ni.create(&sys, Some("em0")), Err(Error::Validation(_))));

        ni.create(&sys, Some("lo7")).unwrap();
        assert_eq!(ni.system_name, "lo7");
    }

    #[test]
    fn test_add_alias_allocates_from_range() {
        let host = Rc::new(RefCell::new(Host::default()));
        let sys = ifconfig_runner(host.clone());
        let mut ni = netif();
        ni.create(&sys, Some("lo1")).unwrap();

        assert_eq!(ni.add_alias(&sys, None).unwrap(), ip("10.0.0.2"));
        assert_eq!(ni.add_alias(&sys, Some(ip("10.0.0.3"))).unwrap(), ip("10.0.0.3"));
        assert_eq!(ni.add_alias(&sys, None).unwrap(), ip("10.0.0.4"));
        assert!(sys.ran("ifconfig lo1 inet 10.0.0.4/24 alias"));

        // Tracked alias comes back unchanged, no new ifconfig call
        let calls = sys.calls().len();
        assert_eq!(ni.add_alias(&sys, Some(ip("10.0.0.3"))).unwrap(), ip("10.0.0.3"));
        assert_eq!(sys.calls().len(), calls);

        assert!(matches!(
            ni.add_alias(&sys, Some(ip("10.0.0.9"))),
            Err(Error::Validation(_))
        ));

        assert_eq!(ni.add_alias(&sys, None).unwrap(), ip("10.0.0.5"));
        assert!(matches!(
            ni.add_alias(&sys, None),
            Err(Error::AddressExhausted { .. })
        ));
        assert_eq!(host.borrow().ifaces["lo1"].len(), 4);
    }

    #[test]
    fn test_add_alias_bound_outside_tracking() {
        let host = Rc::new(RefCell::new(Host::default()));
        host.borrow_mut()
            .ifaces
            .insert("lo1".into(), BTreeSet::from(["10.0.0.2".to_string()]));
        let sys = ifconfig_runner(host);

        let mut ni = netif();
        ni.system_name = "lo1".into();
        assert!(matches!(
            ni.add_alias(&sys, None),
            Err(Error::AddressInUse(_))
        ));
        assert!(ni.aliases.is_empty());
    }

    #[test]
    fn test_delete_alias() {
        let host = Rc::new(RefCell::new(Host::default()));
        let sys = ifconfig_runner(host.clone());
        let mut ni = netif();
        ni.create(&sys, Some("lo1")).unwrap();
        ni.add_alias(&sys, None).unwrap();
        ni.add_alias(&sys, None).unwrap();

        ni.delete_alias(&sys, ip("10.0.0.2")).unwrap();
        assert_eq!(ni.aliases, vec![ip("10.0.0.3")]);
        assert!(sys.ran("ifconfig lo1 inet 10.0.0.2/24 -alias"));
        assert!(!host.borrow().ifaces["lo1"].contains("10.0.0.2"));

        // Unknown alias is a no-op
        let calls = sys.calls().len();
        ni.delete_alias(&sys, ip("10.0.0.4")).unwrap();
        assert_eq!(sys.calls().len(), calls);

        // The freed address is handed out again
        assert_eq!(ni.add_alias(&sys, None).unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn test_destroy() {
        let host = Rc::new(RefCell::new(Host::default()));
        let sys = ifconfig_runner(host.clone());
        let mut ni = netif();
        ni.create(&sys, None).unwrap();

        ni.destroy(&sys).unwrap();
        assert!(host.borrow().ifaces.is_empty());
        assert!(sys.ran("ifconfig lo1 destroy"));

        // Gone already
        let calls = sys.calls().len();
        ni.destroy(&sys).unwrap();
        assert_eq!(sys.calls().len(), calls + 1);
    }
}

//! Command-line interface for jailguard
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::manifest::DEFAULT_CONFIG_PATH;
use crate::sys::validate_name;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// jailguard - keeps FreeBSD jails, bases, interfaces and PF rules in check
#[derive(Parser)]
#[command(name = "jailguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable debug output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and repair the state file
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Manage FreeBSD base releases
    Base {
        #[command(subcommand)]
        action: BaseAction,
    },

    /// Manage jails
    Jail {
        #[command(subcommand)]
        action: JailAction,
    },

    /// Manage loopback interfaces and their aliases
    Netif {
        #[command(subcommand)]
        action: NetifAction,
    },

    /// Manage port forwards to jails
    Portfwd {
        #[command(subcommand)]
        action: PortFwdAction,
    },

    /// Manage outbound NAT for jails
    Natpass {
        #[command(subcommand)]
        action: NatPassAction,
    },

    /// Packet filter checks
    Pf {
        #[command(subcommand)]
        action: PfAction,
    },

    /// Show or change the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Check a jail or interface name
fn parse_name(s: &str) -> Result<String, String> {
    validate_name(s).map_err(|e| e.to_string())?;
    Ok(s.to_string())
}

/// Actions for the state command
#[derive(Subcommand)]
pub enum StateAction {
    /// List items, optionally of one kind
    List {
        /// base, jail, netif, jailportfwd or jailnatpass
        kind: Option<String>,
    },

    /// Drop an item from the state without touching the OS
    Remove {
        /// Item kind
        kind: String,

        /// Item name (a port forward is SRC_IF:SRC_PORT:JAIL:DST_PORT)
        name: String,
    },

    /// Add an existing base or jail to the state
    Import {
        /// base or jail
        kind: String,

        /// Release or jail name
        name: String,
    },
}

/// Actions for the base command
#[derive(Subcommand)]
pub enum BaseAction {
    /// Download base.txz of a release (default: the host release)
    Download {
        /// Release to download (e.g., 14.1-RELEASE)
        release: Option<String>,

        /// Download again even if the base exists
        #[arg(short = 'w', long)]
        overwrite: bool,
    },

    /// Add a base directory that already holds base.txz
    Import {
        /// Release name
        release: String,
    },

    /// Delete a base and its directory
    Remove {
        /// Release name
        release: String,
    },

    /// List bases
    List,
}

/// Actions for the jail command
#[derive(Subcommand)]
pub enum JailAction {
    /// Create a jail from a jail config file
    Create {
        /// File with a jail config block
        file: PathBuf,

        /// Base release to extract when the config has no path
        #[arg(short, long)]
        base: Option<String>,

        /// Start the jail once created
        #[arg(short, long)]
        start: bool,
    },

    /// Start a jail
    Start {
        #[arg(value_parser = parse_name)]
        jail: String,
    },

    /// Stop a jail
    Stop {
        #[arg(value_parser = parse_name)]
        jail: String,
    },

    /// Remove a jail, its root directory and config file
    Remove {
        #[arg(value_parser = parse_name)]
        jail: String,

        /// Stop the jail first if it is running
        #[arg(short, long)]
        stop: bool,
    },

    /// List jails
    List,
}

/// Actions for the netif command
#[derive(Subcommand)]
pub enum NetifAction {
    /// Create a loopback interface handing out aliases from a range
    Create {
        /// Interface name in jailguard
        #[arg(value_parser = parse_name)]
        name: String,

        /// First alias address
        begin: Ipv4Addr,

        /// Last alias address (same /24 as BEGIN)
        end: Ipv4Addr,

        /// System interface to use (e.g., lo5), first free loN if omitted
        ifname: Option<String>,
    },

    /// Destroy an interface
    Destroy {
        #[arg(value_parser = parse_name)]
        name: String,
    },

    /// List interfaces
    List,

    /// Manage aliases of an interface
    Alias {
        #[command(subcommand)]
        action: AliasAction,
    },
}

/// Actions for the netif alias command
#[derive(Subcommand)]
pub enum AliasAction {
    /// Bind an alias (lowest free address if IP is omitted)
    Add {
        #[arg(value_parser = parse_name)]
        name: String,

        ip: Option<Ipv4Addr>,
    },

    /// Unbind an alias
    Delete {
        #[arg(value_parser = parse_name)]
        name: String,

        ip: Ipv4Addr,
    },

    /// List aliases of an interface
    List {
        #[arg(value_parser = parse_name)]
        name: String,
    },
}

/// Actions for the portfwd command
#[derive(Subcommand)]
pub enum PortFwdAction {
    /// Forward a host interface port to a jail port
    Add {
        /// Host interface (e.g., em0)
        src_if: String,

        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        src_port: u16,

        #[arg(value_parser = parse_name)]
        jail: String,

        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        dst_port: u16,
    },

    /// Delete a port forward
    Delete {
        src_if: String,

        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        src_port: u16,

        #[arg(value_parser = parse_name)]
        jail: String,

        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        dst_port: u16,
    },

    /// Delete every port forward of a jail
    Flush {
        #[arg(value_parser = parse_name)]
        jail: String,
    },

    /// List port forwards of a jail
    List {
        #[arg(value_parser = parse_name)]
        jail: String,
    },
}

/// Actions for the natpass command
#[derive(Subcommand)]
pub enum NatPassAction {
    /// NAT outbound traffic of a jail through a gateway interface
    Add {
        #[arg(value_parser = parse_name)]
        jail: String,

        /// Gateway interface (e.g., em0)
        gw_if: String,
    },

    /// Remove the NAT pass of a jail
    Remove {
        #[arg(value_parser = parse_name)]
        jail: String,
    },

    /// Show the NAT pass of a jail
    Show {
        #[arg(value_parser = parse_name)]
        jail: String,
    },
}

/// Actions for the pf command
#[derive(Subcommand)]
pub enum PfAction {
    /// Check that pf.conf has the jailguard anchors
    Check,
}

/// Actions for the config command
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print one value
    Get { key: String },

    /// Change one value and write the configuration file
    Set { key: String, value: String },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "jailguard", &mut std::io::stdout());
    }
}

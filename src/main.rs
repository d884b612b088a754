//! jailguard - FreeBSD jail state keeper
//!
//! Tracks bases, jails, loopback interfaces, port forwards and NAT passes
//! in a JSON state file and keeps the OS and PF anchors in line with it.

mod bridge;
mod bulkhead;
mod cli;
mod error;
mod jail;
mod logbook;
mod manifest;
mod network;
mod provision;
mod supply;
mod sys;

use bridge::Bridge;
use bulkhead::{PortForward, PortFwdKey};
use cli::{
    AliasAction, BaseAction, Cli, Commands, ConfigAction, JailAction, NatPassAction,
    NetifAction, PfAction, PortFwdAction, StateAction,
};
use error::Result;
use sys::SystemRunner;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

fn print_state(bridge: &Bridge<'_>, jail: &str) {
    if let Some(jail) = bridge.logbook().jail(jail) {
        println!("jail {} {}", jail.name, jail.state);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose, cli.quiet);

    let mut config = manifest::load(&cli.config)?;

    let action = match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            return Ok(());
        }
        Commands::Config { action } => {
            match action {
                ConfigAction::Show => print!("{}", config.to_toml()?),
                ConfigAction::Get { key } => println!("{}", config.get(&key)?),
                ConfigAction::Set { key, value } => {
                    config.set(&key, &value)?;
                    config.save(&cli.config)?;
                    tracing::info!(key = %key, path = %cli.config.display(), "config updated");
                }
            }
            return Ok(());
        }
        other => other,
    };

    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("Not running as root. Jail, interface and PF operations require root privileges.");
    }

    let sys = SystemRunner;
    let mut bridge = Bridge::open(config, &sys)?;

    match action {
        Commands::State { action } => match action {
            StateAction::List { kind } => print_lines(&bridge.state_list(kind.as_deref())?),
            StateAction::Remove { kind, name } => bridge.state_remove(&kind, &name)?,
            StateAction::Import { kind, name } => bridge.state_import(&kind, &name)?,
        },

        Commands::Base { action } => match action {
            BaseAction::Download { release, overwrite } => {
                bridge.download_base(release.as_deref(), overwrite)?
            }
            BaseAction::Import { release } => bridge.import_base(&release)?,
            BaseAction::Remove { release } => bridge.remove_base(&release)?,
            BaseAction::List => print_lines(&bridge.list_bases()),
        },

        Commands::Jail { action } => match action {
            JailAction::Create { file, base, start } => {
                bridge.create_jail(&file, base.as_deref(), start)?
            }
            JailAction::Start { jail } => {
                bridge.start_jail(&jail)?;
                print_state(&bridge, &jail);
            }
            JailAction::Stop { jail } => {
                bridge.stop_jail(&jail)?;
                print_state(&bridge, &jail);
            }
            JailAction::Remove { jail, stop } => bridge.remove_jail(&jail, stop)?,
            JailAction::List => print_lines(&bridge.list_jails()),
        },

        Commands::Netif { action } => match action {
            NetifAction::Create {
                name,
                begin,
                end,
                ifname,
            } => bridge.create_netif(&name, begin, end, ifname.as_deref())?,
            NetifAction::Destroy { name } => bridge.destroy_netif(&name)?,
            NetifAction::List => print_lines(&bridge.list_netifs()),
            NetifAction::Alias { action } => match action {
                AliasAction::Add { name, ip } => {
                    let ip = bridge.add_alias(&name, ip)?;
                    println!("netif {} alias {}", name, ip);
                }
                AliasAction::Delete { name, ip } => bridge.delete_alias(&name, ip)?,
                AliasAction::List { name } => print_lines(&bridge.list_aliases(&name)?),
            },
        },

        Commands::Portfwd { action } => match action {
            PortFwdAction::Add {
                src_if,
                src_port,
                jail,
                dst_port,
            } => bridge.add_port_fwd(PortForward::new(&src_if, src_port, &jail, dst_port))?,
            PortFwdAction::Delete {
                src_if,
                src_port,
                jail,
                dst_port,
            } => bridge.delete_port_fwd(&PortFwdKey {
                src_if,
                src_port,
                dst_jail: jail,
                dst_port,
            })?,
            PortFwdAction::Flush { jail } => bridge.flush_port_fwds(&jail)?,
            PortFwdAction::List { jail } => print_lines(&bridge.list_port_fwds(&jail)),
        },

        Commands::Natpass { action } => match action {
            NatPassAction::Add { jail, gw_if } => bridge.add_nat_pass(&jail, &gw_if)?,
            NatPassAction::Remove { jail } => bridge.remove_nat_pass(&jail)?,
            NatPassAction::Show { jail } => {
                if let Some(line) = bridge.show_nat_pass(&jail) {
                    println!("{}", line);
                }
            }
        },

        Commands::Pf { action } => match action {
            PfAction::Check => {
                bridge.check_pf_anchor()?;
                println!("PF anchors are in place");
            }
        },

        Commands::Completion { .. } | Commands::Config { .. } => {}
    }

    Ok(())
}

//! vpr-fwctl: inspect and drive VPR firewall policies
//!
//! `render` compiles a policy and prints it without touching the host.
//! `block` and `reset` drive the nftables backend; with `--dry-run` the
//! nft commands are printed instead of executed.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use vpr_firewall::filter::evaluation_order;
use vpr_firewall::nft::{render_table, RecordedCommand};
use vpr_firewall::{
    compile, CleanupPolicy, CommandRunner, DryRunRunner, Firewall, FirewallConfig, NftEngine,
    PingableHosts, Policy, Protocol, Relay, Settings, SystemRunner, TunnelContext,
};

#[derive(Parser, Debug)]
#[command(name = "vpr-fwctl", about = "VPR firewall policy tool")]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Seconds to wait for the transaction lock (0 = engine default)
    #[arg(long, global = true)]
    lock_timeout: Option<u32>,
    /// nftables table owned by the firewall
    #[arg(long, global = true)]
    table: Option<String>,
    /// Path to the nft binary
    #[arg(long, global = true)]
    nft: Option<String>,
    /// Print nft commands instead of running them
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a policy and print its filters
    Render {
        #[arg(value_enum)]
        policy: PolicyArg,
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
        #[command(flatten)]
        args: PolicyArgs,
    },
    /// Install the blocked policy and leave it in place
    Block {
        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Remove every object the firewall owns
    Reset,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyArg {
    Blocked,
    Connecting,
    Connected,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Table,
    Json,
    Nft,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    #[arg(long)]
    permit_dhcp: bool,
    #[arg(long)]
    permit_lan: bool,
}

impl SettingsArgs {
    fn settings(&self) -> Settings {
        Settings::new(self.permit_dhcp, self.permit_lan)
    }
}

#[derive(Args, Debug)]
struct PolicyArgs {
    #[command(flatten)]
    settings: SettingsArgs,
    /// Relay IP address
    #[arg(long)]
    relay: Option<String>,
    #[arg(long)]
    relay_port: Option<u16>,
    #[arg(long, default_value_t = Protocol::Udp)]
    relay_protocol: Protocol,
    /// Process allowed to reach the relay
    #[arg(long, default_value = "vpr-client")]
    relay_client: String,
    #[arg(long)]
    tunnel_alias: Option<String>,
    #[arg(long)]
    dns_v4: Option<String>,
    #[arg(long)]
    dns_v6: Option<String>,
    /// Host that must answer ping while connecting (repeatable)
    #[arg(long = "ping-host")]
    ping_hosts: Vec<String>,
    /// Restrict ping exemptions to this interface
    #[arg(long)]
    ping_alias: Option<String>,
}

impl PolicyArgs {
    fn relay(&self, policy: PolicyArg) -> Result<Relay> {
        let Some(address) = &self.relay else {
            bail!("--relay is required for the {policy:?} policy");
        };
        let Some(port) = self.relay_port else {
            bail!("--relay-port is required for the {policy:?} policy");
        };
        Ok(Relay::new(address.clone(), port, self.relay_protocol))
    }

    fn policy(&self, kind: PolicyArg) -> Result<Policy> {
        let settings = self.settings.settings();
        Ok(match kind {
            PolicyArg::Blocked => Policy::Blocked { settings },
            PolicyArg::Connecting => {
                let mut pingable_hosts = PingableHosts::new(self.ping_hosts.iter().cloned());
                if let Some(alias) = &self.ping_alias {
                    pingable_hosts = pingable_hosts.on_interface(alias.clone());
                }
                Policy::Connecting {
                    settings,
                    relay: self.relay(kind)?,
                    relay_client: self.relay_client.clone(),
                    pingable_hosts,
                }
            }
            PolicyArg::Connected => {
                let Some(alias) = &self.tunnel_alias else {
                    bail!("--tunnel-alias is required for the connected policy");
                };
                let mut tunnel = TunnelContext::new(alias.clone());
                tunnel.dns_v4 = self.dns_v4.clone();
                tunnel.dns_v6 = self.dns_v6.clone();
                Policy::Connected {
                    settings,
                    relay: self.relay(kind)?,
                    relay_client: self.relay_client.clone(),
                    tunnel,
                }
            }
        })
    }
}

fn load_config(cli: &Cli) -> Result<FirewallConfig> {
    let mut config = match &cli.config {
        Some(path) => FirewallConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FirewallConfig::default(),
    };
    if let Some(secs) = cli.lock_timeout {
        config.lock_timeout_secs = secs;
    }
    if let Some(table) = &cli.table {
        config.nft.table = table.clone();
    }
    if let Some(binary) = &cli.nft {
        config.nft.binary = binary.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn render(config: &FirewallConfig, policy: &Policy, format: Format) -> Result<String> {
    let filters = compile(policy).context("compiling policy")?;
    Ok(match format {
        Format::Json => serde_json::to_string_pretty(&filters)?,
        Format::Nft => render_table(&config.nft, &filters),
        Format::Table => {
            let mut out = format!("{} policy, {} filters\n", policy.kind(), filters.len());
            for filter in evaluation_order(&filters) {
                out.push_str(&format!(
                    "{:>3}  {:<6} {:<13} {}\n",
                    filter.weight.value(),
                    filter.action.to_string(),
                    format!("{:?}", filter.layer),
                    filter.name
                ));
            }
            out
        }
    })
}

fn block<R: CommandRunner>(
    engine: NftEngine<R>,
    config: &FirewallConfig,
    settings: &Settings,
) -> Result<()> {
    let fw = Firewall::initialize_blocked(engine, config, settings)
        .context("installing blocked policy")?;
    fw.deinitialize(CleanupPolicy::ContinueBlocking)
        .context("closing firewall session")?;
    info!(table = %config.nft.table, "blocked policy left in place");
    Ok(())
}

fn reset<R: CommandRunner>(engine: NftEngine<R>, config: &FirewallConfig) -> Result<()> {
    let fw = Firewall::initialize(engine, config).context("opening firewall")?;
    fw.deinitialize(CleanupPolicy::ResetFirewall)
        .context("removing firewall objects")?;
    info!(table = %config.nft.table, "firewall reset");
    Ok(())
}

fn print_commands(commands: &[RecordedCommand]) {
    for command in commands {
        println!("$ {} {}", command.program, command.args.join(" "));
        if let Some(script) = &command.stdin {
            print!("{script}");
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.cmd {
        Command::Render {
            policy,
            format,
            args,
        } => {
            let policy = args.policy(*policy)?;
            print!("{}", render(&config, &policy, *format)?);
        }
        Command::Block { settings } => {
            let settings = settings.settings();
            if cli.dry_run {
                let runner = DryRunRunner::new();
                block(NftEngine::new(config.nft.clone(), runner.clone()), &config, &settings)?;
                print_commands(&runner.commands());
            } else {
                block(NftEngine::new(config.nft.clone(), SystemRunner), &config, &settings)?;
                println!("blocked policy active in table {}", config.nft.table);
            }
        }
        Command::Reset => {
            if cli.dry_run {
                let runner = DryRunRunner::new();
                reset(NftEngine::new(config.nft.clone(), runner.clone()), &config)?;
                print_commands(&runner.commands());
            } else {
                reset(NftEngine::new(config.nft.clone(), SystemRunner), &config)?;
                println!("firewall reset");
            }
        }
    }
    Ok(())
}

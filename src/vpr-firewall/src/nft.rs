//! nftables filter engine
//!
//! Drives the Linux packet filter through the `nft` command. Mutations are
//! staged in an [`ObjectStore`] like any other engine; commit renders the
//! whole staged view as one script and loads it with `nft -f -`, which the
//! kernel applies in a single transaction. No window exists in which a
//! partially written table is active.
//!
//! # Table layout
//! - one `inet` table owned exclusively by the firewall
//! - `output` and `input` base chains at the configured priority,
//!   `policy accept` so an empty filter set lets traffic through
//! - rules in [`evaluation_order`], each ending in `accept` or `drop`,
//!   so first match gives the same verdict as weight arbitration
//! - no connection-tracking shortcut: every inbound packet, including
//!   replies on flows opened before a block, goes through the same rules.
//!   Each outbound exemption carries its own inbound counterpart.
//!
//! # Limits
//! Application identity has no nftables equivalent; such conditions are
//! dropped from the rule and the filter name is kept as a comment.

use parking_lot::Mutex;
use std::fmt::Write as _;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::NftConfig;
use crate::engine::{
    next_holder_id, FilterEngine, FilterId, LockTimeout, ObjectStore, Owner, Provider, Sublayer,
    TransactionLock,
};
use crate::error::EngineError;
use crate::filter::{evaluation_order, Action, Condition, Direction, FilterSpec, IpFamily, Transport};

/// Lock wait used when the caller asks for the engine default
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const CHAIN_OUT: &str = "output";
const CHAIN_IN: &str = "input";

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs on behalf of the engine.
pub trait CommandRunner: Send {
    fn run(
        &mut self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, EngineError>;
}

/// Executes commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &mut self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, EngineError> {
        debug!(cmd = %program, args = ?args, "executing");
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success {
            debug!(cmd = %program, stderr = %result.stderr.trim(), "command failed");
        }
        Ok(result)
    }
}

/// A command seen by [`DryRunRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

/// Records commands instead of running them. Clones share one record.
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner {
    log: Arc<Mutex<Vec<RecordedCommand>>>,
    fail_next: Arc<Mutex<Option<String>>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.log.lock().clone()
    }

    /// The last script piped to a command, if any.
    pub fn last_script(&self) -> Option<String> {
        self.log.lock().iter().rev().find_map(|c| c.stdin.clone())
    }

    /// Make the next command report failure with `stderr`.
    pub fn fail_next(&self, stderr: impl Into<String>) {
        *self.fail_next.lock() = Some(stderr.into());
    }
}

impl CommandRunner for DryRunRunner {
    fn run(
        &mut self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, EngineError> {
        trace!(cmd = %program, args = ?args, "dry run");
        self.log.lock().push(RecordedCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: stdin.map(str::to_string),
        });
        Ok(match self.fail_next.lock().take() {
            Some(stderr) => CommandOutput {
                success: false,
                stdout: String::new(),
                stderr,
            },
            None => CommandOutput {
                success: true,
                ..CommandOutput::default()
            },
        })
    }
}

/// Filter engine backed by an nftables table.
pub struct NftEngine<R: CommandRunner> {
    config: NftConfig,
    runner: R,
    lock: TransactionLock,
    holder: u64,
    default_timeout: Duration,
    open: bool,
    next_id: u64,
    committed: ObjectStore,
    pending: Option<ObjectStore>,
}

impl NftEngine<SystemRunner> {
    pub fn system(config: NftConfig) -> Self {
        Self::new(config, SystemRunner)
    }
}

impl<R: CommandRunner> NftEngine<R> {
    pub fn new(config: NftConfig, runner: R) -> Self {
        Self {
            config,
            runner,
            lock: TransactionLock::new(),
            holder: next_holder_id(),
            default_timeout: DEFAULT_LOCK_TIMEOUT,
            open: false,
            next_id: 0,
            committed: ObjectStore::default(),
            pending: None,
        }
    }

    pub fn config(&self) -> &NftConfig {
        &self.config
    }

    /// Committed view of the table.
    pub fn committed(&self) -> &ObjectStore {
        &self.committed
    }

    fn require_open(&self) -> Result<(), EngineError> {
        if !self.open {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }

    fn pending(&mut self) -> Result<&mut ObjectStore, EngineError> {
        self.require_open()?;
        self.pending.as_mut().ok_or(EngineError::NoTransaction)
    }

    fn exec_require(&mut self, args: &[&str], stdin: Option<&str>) -> Result<(), EngineError> {
        let program = self.config.binary.clone();
        let output = self.runner.run(&program, args, stdin)?;
        if !output.success {
            return Err(EngineError::Command {
                program: format!("{program} {}", args.join(" ")),
                detail: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.pending = None;
        self.lock.release(self.holder);
    }
}

impl<R: CommandRunner> Drop for NftEngine<R> {
    fn drop(&mut self) {
        if self.pending.is_some() {
            self.finish();
        }
    }
}

impl<R: CommandRunner> FilterEngine for NftEngine<R> {
    fn open_session(&mut self) -> Result<(), EngineError> {
        if self.open {
            return Err(EngineError::SessionOpen);
        }
        // fails early when nft is missing or we lack CAP_NET_ADMIN
        self.exec_require(&["list", "tables"], None)?;
        self.open = true;
        debug!(table = %self.config.table, "nftables session opened");
        Ok(())
    }

    fn close_session(&mut self) -> Result<(), EngineError> {
        self.require_open()?;
        if self.pending.is_some() {
            debug!("closing session with an open transaction; aborting it");
            self.finish();
        }
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn begin(&mut self, timeout: LockTimeout) -> Result<(), EngineError> {
        self.require_open()?;
        if self.pending.is_some() {
            return Err(EngineError::TransactionActive);
        }
        self.lock
            .acquire(self.holder, timeout.resolve(self.default_timeout))?;
        self.pending = Some(self.committed.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        self.require_open()?;
        let staged = self.pending.as_ref().ok_or(EngineError::NoTransaction)?;
        let script = render_store(&self.config, staged);
        let filters = staged.filters.len();
        match self.exec_require(&["-f", "-"], Some(&script)) {
            Ok(()) => {
                if let Some(staged) = self.pending.take() {
                    self.committed = staged;
                }
                self.lock.release(self.holder);
                info!(table = %self.config.table, filters, "nftables ruleset loaded");
                Ok(())
            }
            Err(e) => {
                // the transaction stays open; the caller aborts it
                warn!(error = %e, "nftables rejected the ruleset");
                Err(EngineError::Commit(e.to_string()))
            }
        }
    }

    fn abort(&mut self) -> Result<(), EngineError> {
        self.require_open()?;
        if self.pending.is_none() {
            return Err(EngineError::NoTransaction);
        }
        self.finish();
        Ok(())
    }

    fn register_provider(&mut self, provider: &Provider) -> Result<(), EngineError> {
        self.pending()?.put_provider(provider);
        Ok(())
    }

    fn register_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), EngineError> {
        self.pending()?.put_sublayer(sublayer)
    }

    fn add_filter(&mut self, owner: &Owner, filter: &FilterSpec) -> Result<FilterId, EngineError> {
        let pending = self.pending.as_mut().ok_or(EngineError::NoTransaction)?;
        pending.ensure_sublayer(owner)?;
        self.next_id += 1;
        let id = FilterId(self.next_id);
        pending.put_filter(id, owner, filter);
        trace!(%id, name = %filter.name, "staging rule");
        Ok(id)
    }

    fn remove_filter(&mut self, id: FilterId) -> Result<(), EngineError> {
        self.pending()?.take_filter(id)
    }

    fn owned_filters(&self, owner: &Owner) -> Result<Vec<FilterId>, EngineError> {
        self.require_open()?;
        Ok(self
            .pending
            .as_ref()
            .unwrap_or(&self.committed)
            .owned_ids(owner))
    }

    fn remove_owned_objects(&mut self, owner: &Owner) -> Result<(), EngineError> {
        self.pending()?.remove_owned(owner);
        Ok(())
    }
}

/// Script that makes the kernel table match `store`.
///
/// `add` + `delete` makes the deletion safe when the table does not exist
/// yet, and both run in the same batch as the new definition. A store
/// without a provider means nothing is registered and the table goes away.
pub fn render_store(config: &NftConfig, store: &ObjectStore) -> String {
    if store.providers.is_empty() {
        return render_removal(config);
    }
    render_table(config, store.filters.values().map(|f| &f.spec))
}

/// Script that removes the table.
pub fn render_removal(config: &NftConfig) -> String {
    format!(
        "add table inet {table}\ndelete table inet {table}\n",
        table = config.table
    )
}

/// Script that replaces the table with one enforcing `filters`.
pub fn render_table<'a>(
    config: &NftConfig,
    filters: impl IntoIterator<Item = &'a FilterSpec>,
) -> String {
    let ordered = evaluation_order(filters);
    let mut script = render_removal(config);
    let _ = writeln!(script, "table inet {} {{", config.table);

    for (chain, hook, direction) in [
        (CHAIN_OUT, "output", Direction::Outbound),
        (CHAIN_IN, "input", Direction::Inbound),
    ] {
        let _ = writeln!(script, "  chain {chain} {{");
        let _ = writeln!(
            script,
            "    type filter hook {hook} priority {}; policy accept;",
            config.priority
        );
        for filter in ordered
            .iter()
            .filter(|f| f.layer.direction() == direction)
        {
            let _ = writeln!(script, "    {}", render_rule(filter));
        }
        script.push_str("  }\n");
    }
    script.push_str("}\n");
    script
}

/// One nftables rule for `filter`.
pub fn render_rule(filter: &FilterSpec) -> String {
    let direction = filter.layer.direction();
    let family = filter.layer.family();
    let mut parts = vec![match family {
        IpFamily::V4 => "meta nfproto ipv4".to_string(),
        IpFamily::V6 => "meta nfproto ipv6".to_string(),
    }];

    // transport must precede port matches
    let mut conditions: Vec<&Condition> = filter.conditions.iter().collect();
    conditions.sort_by_key(|c| !matches!(c, Condition::Protocol(_)));
    for condition in conditions {
        if let Some(expr) = render_condition(condition, direction, family) {
            parts.push(expr);
        }
    }

    parts.push("counter".to_string());
    parts.push(
        match filter.action {
            Action::Permit => "accept",
            Action::Block => "drop",
        }
        .to_string(),
    );
    parts.push(format!("comment \"{}\"", comment_text(&filter.name)));
    parts.join(" ")
}

fn render_condition(condition: &Condition, direction: Direction, family: IpFamily) -> Option<String> {
    let outbound = direction == Direction::Outbound;
    let addr_dir = if outbound { "daddr" } else { "saddr" };
    let (remote_port, local_port) = if outbound {
        ("dport", "sport")
    } else {
        ("sport", "dport")
    };
    let iface = if outbound { "oifname" } else { "iifname" };
    let ip = match family {
        IpFamily::V4 => "ip",
        IpFamily::V6 => "ip6",
    };

    Some(match condition {
        Condition::Protocol(t) => format!(
            "meta l4proto {}",
            match t {
                Transport::Tcp => "tcp",
                Transport::Udp => "udp",
                Transport::Icmp => "icmp",
                Transport::IcmpV6 => "ipv6-icmp",
            }
        ),
        Condition::RemoteNetwork(net) => format!("{ip} {addr_dir} {net}"),
        Condition::RemotePort(port) => format!("th {remote_port} {port}"),
        Condition::LocalPort(port) => format!("th {local_port} {port}"),
        Condition::IcmpType(ty) => match family {
            IpFamily::V4 => format!("icmp type {ty}"),
            IpFamily::V6 => format!("icmpv6 type {ty}"),
        },
        Condition::Interface(alias) => format!("{iface} \"{alias}\""),
        Condition::NotInterface(alias) => format!("{iface} != \"{alias}\""),
        Condition::Loopback => match family {
            IpFamily::V4 => format!("ip {addr_dir} 127.0.0.0/8"),
            IpFamily::V6 => format!("ip6 {addr_dir} ::1"),
        },
        Condition::Application(app) => {
            trace!(%app, "application condition not expressible in nftables");
            return None;
        }
    })
}

fn comment_text(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .take(128)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile_blocked, compile_connected};
    use crate::filter::{Layer, Weight};
    use crate::types::{Protocol, Relay, Settings, TunnelContext};

    fn engine() -> (NftEngine<DryRunRunner>, DryRunRunner) {
        let runner = DryRunRunner::new();
        (NftEngine::new(NftConfig::default(), runner.clone()), runner)
    }

    fn install(engine: &mut NftEngine<DryRunRunner>, filters: &[FilterSpec]) {
        let owner = Owner::default();
        engine.begin(LockTimeout::Default).unwrap();
        engine.register_provider(&owner.provider).unwrap();
        engine.register_sublayer(&owner.sublayer).unwrap();
        for id in engine.owned_filters(&owner).unwrap() {
            engine.remove_filter(id).unwrap();
        }
        for f in filters {
            engine.add_filter(&owner, f).unwrap();
        }
        engine.commit().unwrap();
    }

    #[test]
    fn open_checks_nft_is_available() {
        let (mut engine, runner) = engine();
        engine.open_session().unwrap();
        let cmds = runner.commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].program, "nft");
        assert_eq!(cmds[0].args, vec!["list", "tables"]);
    }

    #[test]
    fn open_fails_without_nft() {
        let (mut engine, runner) = engine();
        runner.fail_next("Operation not permitted");
        let err = engine.open_session().unwrap_err();
        assert!(matches!(err, EngineError::Command { .. }));
        assert!(!engine.is_open());
    }

    #[test]
    fn commit_loads_one_atomic_script() {
        let (mut engine, runner) = engine();
        engine.open_session().unwrap();
        install(&mut engine, &compile_blocked(&Settings::default()));

        let last = runner.commands().pop().unwrap();
        assert_eq!(last.args, vec!["-f", "-"]);
        let script = last.stdin.unwrap();
        assert!(script.starts_with("add table inet vpr_firewall\ndelete table inet vpr_firewall\n"));
        assert!(script.contains("type filter hook output priority -100; policy accept;"));
        assert!(script.contains("meta nfproto ipv4 counter drop"));
        assert!(!script.contains("ct state"));
    }

    #[test]
    fn blocked_input_chain_drops_established_flows() {
        let script = render_table(&NftConfig::default(), &compile_blocked(&Settings::default()));
        let input = &script[script.find("chain input").unwrap()..];
        let first_rule = input.lines().nth(2).unwrap().trim();
        assert!(first_rule.starts_with("meta nfproto"), "{first_rule}");
        assert!(input.contains("meta nfproto ipv4 counter drop"));
        assert!(!input.contains("established"));
    }

    #[test]
    fn rules_follow_weight_order() {
        let relay = Relay::new("1.2.3.4", 443, Protocol::Tcp);
        let tunnel = TunnelContext::new("wg0").with_dns_v4("10.0.0.1");
        let filters = compile_connected(&Settings::default(), &relay, "client", &tunnel).unwrap();
        let script = render_table(&NftConfig::default(), &filters);

        let dns_server = script.find("ip daddr 10.0.0.1/32").unwrap();
        let dns_block = script.find("th dport 53 counter drop").unwrap();
        let tunnel_permit = script.find("oifname \"wg0\" counter accept").unwrap();
        let block_all = script.find("meta nfproto ipv4 counter drop").unwrap();
        assert!(dns_server < dns_block);
        assert!(dns_block < tunnel_permit);
        assert!(tunnel_permit < block_all);
    }

    #[test]
    fn relay_rule_is_off_tunnel() {
        let relay = Relay::new("1.2.3.4", 443, Protocol::Tcp);
        let tunnel = TunnelContext::new("wg0");
        let filters = compile_connected(&Settings::default(), &relay, "client", &tunnel).unwrap();
        let script = render_table(&NftConfig::default(), &filters);
        assert!(script.contains("oifname != \"wg0\""));
        assert!(script.contains("ip daddr 1.2.3.4/32"));
        assert!(script.contains("th dport 443"));
        assert!(!script.contains("client\""));
    }

    #[test]
    fn inbound_rules_match_source() {
        let filter = FilterSpec::permit("reply", Layer::RecvAcceptV6, Weight::Exemption)
            .with(Condition::Protocol(Transport::Udp))
            .with(Condition::RemotePort(547))
            .with(Condition::LocalPort(546));
        assert_eq!(
            render_rule(&filter),
            "meta nfproto ipv6 meta l4proto udp th sport 547 th dport 546 counter accept comment \"reply\""
        );
    }

    #[test]
    fn protocol_is_rendered_before_ports() {
        let filter = FilterSpec::block("dns", Layer::ConnectV4, Weight::BlockDns)
            .with(Condition::RemotePort(53))
            .with(Condition::Protocol(Transport::Tcp));
        assert_eq!(
            render_rule(&filter),
            "meta nfproto ipv4 meta l4proto tcp th dport 53 counter drop comment \"dns\""
        );
    }

    #[test]
    fn failed_load_keeps_transaction_open() {
        let (mut engine, runner) = engine();
        engine.open_session().unwrap();
        install(&mut engine, &compile_blocked(&Settings::default()));
        let before = engine.committed().clone();

        engine.begin(LockTimeout::Default).unwrap();
        engine.remove_owned_objects(&Owner::default()).unwrap();
        runner.fail_next("syntax error");
        assert!(matches!(engine.commit(), Err(EngineError::Commit(_))));
        engine.abort().unwrap();
        assert_eq!(engine.committed(), &before);
    }

    #[test]
    fn removing_everything_deletes_the_table() {
        let (mut engine, runner) = engine();
        engine.open_session().unwrap();
        install(&mut engine, &compile_blocked(&Settings::default()));

        engine.begin(LockTimeout::Default).unwrap();
        engine.remove_owned_objects(&Owner::default()).unwrap();
        engine.commit().unwrap();
        assert_eq!(
            runner.last_script().unwrap(),
            "add table inet vpr_firewall\ndelete table inet vpr_firewall\n"
        );
        assert!(engine.committed().is_empty());
    }

    #[test]
    fn comments_are_sanitized() {
        assert_eq!(comment_text("a\"b\\c\nd"), "abcd");
    }
}

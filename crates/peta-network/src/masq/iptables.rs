//! iptables masquerade backend.
//!
//! Each network gets a dedicated NAT chain named after a hash of the network
//! and instance id. `POSTROUTING` jumps to it for traffic sourced from the
//! subnet; the chain accepts intra-subnet traffic and masquerades the rest,
//! except multicast.

use ipnet::IpNet;
use peta_common::format_hash_with_prefix;

use super::exec::{CommandOutput, CommandRunner, SystemRunner, args};
use super::{BackendError, IpFamily, MasqBackend, MasqIdentity, Masquerade};
use crate::error::{NetworkError, NetworkResult};

/// Prefix of every chain this backend creates.
pub const CHAIN_PREFIX: &str = "PETA-";

/// Length of generated chain names, prefix included.
pub const MAX_CHAIN_LEN: usize = 28;

/// Table holding the masquerade chains.
pub const NAT_TABLE: &str = "nat";

/// Built-in chain the per-network chains hang off.
pub const POSTROUTING: &str = "POSTROUTING";

/// Chain name for a network and instance id.
#[must_use]
pub fn chain_name(network: &str, id: &str) -> String {
    // MAX_CHAIN_LEN leaves room for the hash, so the None arm is unreachable.
    format_hash_with_prefix(MAX_CHAIN_LEN, CHAIN_PREFIX, &format!("{network}{id}"))
        .unwrap_or_else(|| CHAIN_PREFIX.to_string())
}

/// Rule comment for a network and instance id.
#[must_use]
pub fn comment(network: &str, id: &str) -> String {
    format!("name {network:?} id: {id:?}")
}

/// The subset of iptables operations the masquerade backend needs.
///
/// Rules are passed as argument lists without the table and chain.
pub trait IptablesOps: Send + Sync {
    /// Whether iptables is usable on this host.
    fn supported(&self) -> bool;

    /// Names of all chains in `table`.
    ///
    /// # Errors
    ///
    /// The tool's failure output.
    fn list_chains(&self, family: IpFamily, table: &str) -> Result<Vec<String>, BackendError>;

    /// Create a chain.
    ///
    /// # Errors
    ///
    /// The tool's failure output.
    fn new_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError>;

    /// Append `rule` unless an identical rule is already present.
    ///
    /// # Errors
    ///
    /// The tool's failure output.
    fn append_unique(&self, family: IpFamily, table: &str, chain: &str, rule: &[String]) -> Result<(), BackendError>;

    /// Delete `rule`.
    ///
    /// # Errors
    ///
    /// [`BackendError::NotFound`] if no such rule exists.
    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &[String]) -> Result<(), BackendError>;

    /// Flush a chain, creating it if missing.
    ///
    /// # Errors
    ///
    /// The tool's failure output.
    fn clear_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError>;

    /// Delete an empty chain.
    ///
    /// # Errors
    ///
    /// [`BackendError::NotFound`] if the chain does not exist.
    fn delete_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError>;
}

/// [`IptablesOps`] through the `iptables` / `ip6tables` binaries.
#[derive(Debug, Clone, Default)]
pub struct IptablesCli<R = SystemRunner> {
    runner: R,
}

impl IptablesCli {
    /// Drive the host's iptables binaries.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            runner: SystemRunner,
        }
    }
}

impl<R: CommandRunner> IptablesCli<R> {
    /// Drive iptables through `runner`.
    pub const fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    fn exec(&self, family: IpFamily, argv: &[String]) -> Result<CommandOutput, BackendError> {
        let program = match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        };
        let mut full = vec!["--wait".to_string()];
        full.extend_from_slice(argv);

        let out = self
            .runner
            .run(program, &full)
            .map_err(|e| BackendError::Failed(format!("failed to run {program}: {e}")))?;
        if out.success {
            Ok(out)
        } else if is_not_exist(&out) {
            Err(BackendError::NotFound(out.stderr.trim().to_string()))
        } else {
            Err(BackendError::Failed(format!(
                "running {program} {}: exit status {}: {}",
                argv.join(" "),
                out.code.unwrap_or(-1),
                out.stderr.trim()
            )))
        }
    }

    fn rule_args(op: &str, table: &str, chain: &str, rule: &[String]) -> Vec<String> {
        let mut argv = args(&["-t", table, op, chain]);
        argv.extend_from_slice(rule);
        argv
    }
}

fn commented(rule: &[&str], comment: &str) -> Vec<String> {
    let mut argv = args(rule);
    argv.extend(args(&["-m", "comment", "--comment", comment]));
    argv
}

fn is_not_exist(out: &CommandOutput) -> bool {
    out.code == Some(1)
        && [
            "Bad rule (does a matching rule exist in that chain?)",
            "No chain/target/match by that name",
            "does not exist",
        ]
        .iter()
        .any(|m| out.stderr.contains(m))
}

impl<R: CommandRunner> IptablesOps for IptablesCli<R> {
    fn supported(&self) -> bool {
        // Only whether the check can run matters, not the chain itself.
        self.exec(IpFamily::V4, &args(&["-t", "filter", "-n", "-L", "INPUT"]))
            .is_ok()
    }

    fn list_chains(&self, family: IpFamily, table: &str) -> Result<Vec<String>, BackendError> {
        let out = self.exec(family, &args(&["-t", table, "-S"]))?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                match (words.next(), words.next()) {
                    (Some("-P" | "-N"), Some(chain)) => Some(chain.to_string()),
                    _ => None,
                }
            })
            .collect())
    }

    fn new_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError> {
        self.exec(family, &args(&["-t", table, "-N", chain])).map(drop)
    }

    fn append_unique(&self, family: IpFamily, table: &str, chain: &str, rule: &[String]) -> Result<(), BackendError> {
        match self.exec(family, &Self::rule_args("-C", table, chain, rule)) {
            Ok(_) => Ok(()),
            Err(BackendError::NotFound(_)) => self
                .exec(family, &Self::rule_args("-A", table, chain, rule))
                .map(drop),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &[String]) -> Result<(), BackendError> {
        self.exec(family, &Self::rule_args("-D", table, chain, rule))
            .map(drop)
    }

    fn clear_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError> {
        if self.list_chains(family, table)?.iter().any(|c| c == chain) {
            self.exec(family, &args(&["-t", table, "-F", chain])).map(drop)
        } else {
            self.new_chain(family, table, chain)
        }
    }

    fn delete_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError> {
        self.exec(family, &args(&["-t", table, "-X", chain])).map(drop)
    }
}

/// Masquerade through per-network iptables chains.
///
/// The interface name is not part of the identity for this backend.
#[derive(Debug, Clone, Default)]
pub struct IptablesMasq<T> {
    ops: T,
}

impl<T: IptablesOps> IptablesMasq<T> {
    /// Backend over `ops`.
    pub const fn new(ops: T) -> Self {
        Self { ops }
    }

    /// The underlying operations.
    pub const fn ops(&self) -> &T {
        &self.ops
    }

    fn setup_net(&self, net: &IpNet, chain: &str, comment: &str) -> NetworkResult<()> {
        let family = IpFamily::of(net);
        let fail = |operation: String| {
            move |e: BackendError| NetworkError::Firewall {
                backend: "iptables",
                operation,
                message: e.to_string(),
            }
        };

        let chains = self
            .ops
            .list_chains(family, NAT_TABLE)
            .map_err(fail("list nat chains".to_string()))?;
        if !chains.iter().any(|c| c == chain) {
            tracing::debug!(chain, "Creating nat chain");
            self.ops
                .new_chain(family, NAT_TABLE, chain)
                .map_err(fail(format!("create nat chain {chain}")))?;
        }

        let net_str = net.to_string();

        // Traffic staying inside the subnet is left alone.
        let accept = commented(&["-d", &net_str, "-j", "ACCEPT"], comment);
        self.ops
            .append_unique(family, NAT_TABLE, chain, &accept)
            .map_err(fail(format!("append accept rule to {chain}")))?;

        let masquerade = commented(&["!", "-d", family.multicast(), "-j", "MASQUERADE"], comment);
        self.ops
            .append_unique(family, NAT_TABLE, chain, &masquerade)
            .map_err(fail(format!("append masquerade rule to {chain}")))?;

        let jump = commented(&["-s", &net_str, "-j", chain], comment);
        self.ops
            .append_unique(family, NAT_TABLE, POSTROUTING, &jump)
            .map_err(fail(format!("append {POSTROUTING} jump to {chain}")))?;

        tracing::debug!(chain, net = %net, "Installed iptables masquerade");
        Ok(())
    }

    fn teardown_net(&self, net: &IpNet, chain: &str, comment: &str) -> Result<(), String> {
        let family = IpFamily::of(net);
        let ignore_missing = |r: Result<(), BackendError>| match r {
            Err(e) if !e.is_not_found() => Err(e.to_string()),
            _ => Ok(()),
        };

        // The jump rule was keyed by the bare address in older releases.
        let ip = net.addr().to_string();
        let net_str = net.to_string();
        for source in [ip.as_str(), net_str.as_str()] {
            let rule = commented(&["-s", source, "-j", chain], comment);
            ignore_missing(self.ops.delete(family, NAT_TABLE, POSTROUTING, &rule))?;
        }

        ignore_missing(self.ops.clear_chain(family, NAT_TABLE, chain))?;
        ignore_missing(self.ops.delete_chain(family, NAT_TABLE, chain))?;
        Ok(())
    }
}

impl<T: IptablesOps> Masquerade for IptablesMasq<T> {
    fn backend(&self) -> MasqBackend {
        MasqBackend::Iptables
    }

    fn supported(&self) -> bool {
        self.ops.supported()
    }

    fn install(&self, nets: &[IpNet], identity: &MasqIdentity) -> NetworkResult<()> {
        let chain = chain_name(&identity.network, &identity.id);
        let comment = comment(&identity.network, &identity.id);
        for net in nets {
            self.setup_net(net, &chain, &comment)?;
        }
        Ok(())
    }

    fn teardown(&self, nets: &[IpNet], identity: &MasqIdentity) -> NetworkResult<()> {
        let chain = chain_name(&identity.network, &identity.id);
        let comment = comment(&identity.network, &identity.id);

        let errors: Vec<String> = nets
            .iter()
            .filter_map(|net| self.teardown_net(net, &chain, &comment).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::Firewall {
                backend: "iptables",
                operation: format!("teardown chain {chain}"),
                message: errors.join("\n"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masq::fake::FakeIptables;

    fn nets(list: &[&str]) -> Vec<IpNet> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn chain_name_is_fixed_length_and_stable() {
        let a = chain_name("peta-net", "");
        assert_eq!(a.len(), MAX_CHAIN_LEN);
        assert!(a.starts_with(CHAIN_PREFIX));
        assert_eq!(a, chain_name("peta-net", ""));
        assert_ne!(a, chain_name("peta-net", "ctr1"));
    }

    #[test]
    fn comment_quotes_fields() {
        assert_eq!(comment("pods", "abc"), r#"name "pods" id: "abc""#);
    }

    #[test]
    fn install_creates_chain_and_rules() {
        let fake = FakeIptables::new();
        let masq = IptablesMasq::new(fake.clone());
        let identity = MasqIdentity::network("pods");
        masq.install(&nets(&["10.244.0.1/24"]), &identity).unwrap();

        let chain = chain_name("pods", "");
        let rules = fake.rules(IpFamily::V4, NAT_TABLE, &chain);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0][..4], args(&["-d", "10.244.0.1/24", "-j", "ACCEPT"]));
        assert_eq!(rules[1][..5], args(&["!", "-d", "224.0.0.0/4", "-j", "MASQUERADE"]));

        let post = fake.rules(IpFamily::V4, NAT_TABLE, POSTROUTING);
        assert_eq!(post.len(), 1);
        assert_eq!(post[0][..4], args(&["-s", "10.244.0.1/24", "-j", chain.as_str()]));
    }

    #[test]
    fn install_twice_is_idempotent() {
        let fake = FakeIptables::new();
        let masq = IptablesMasq::new(fake.clone());
        let identity = MasqIdentity::network("pods");
        let targets = nets(&["10.244.0.1/24", "fd00:10::1/64"]);
        masq.install(&targets, &identity).unwrap();
        masq.install(&targets, &identity).unwrap();

        let chain = chain_name("pods", "");
        assert_eq!(fake.rules(IpFamily::V4, NAT_TABLE, &chain).len(), 2);
        assert_eq!(fake.rules(IpFamily::V6, NAT_TABLE, &chain).len(), 2);
        assert_eq!(fake.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).len(), 1);
        assert_eq!(fake.rules(IpFamily::V6, NAT_TABLE, POSTROUTING).len(), 1);
    }

    #[test]
    fn teardown_removes_everything_and_tolerates_absence() {
        let fake = FakeIptables::new();
        let masq = IptablesMasq::new(fake.clone());
        let identity = MasqIdentity::network("pods");
        let targets = nets(&["10.244.0.1/24"]);

        masq.install(&targets, &identity).unwrap();
        masq.teardown(&targets, &identity).unwrap();
        assert!(!fake.has_chain(IpFamily::V4, NAT_TABLE, &chain_name("pods", "")));
        assert!(fake.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).is_empty());

        masq.teardown(&targets, &identity).unwrap();
    }

    #[test]
    fn teardown_leaves_other_instances() {
        let fake = FakeIptables::new();
        let masq = IptablesMasq::new(fake.clone());
        let targets = nets(&["10.244.0.5/24"]);
        let a = MasqIdentity::new("pods", "eth0", "a");
        let b = MasqIdentity::new("pods", "eth0", "b");

        masq.install(&targets, &a).unwrap();
        masq.install(&targets, &b).unwrap();
        masq.teardown(&targets, &a).unwrap();

        assert!(fake.has_chain(IpFamily::V4, NAT_TABLE, &chain_name("pods", "b")));
        assert_eq!(fake.rules(IpFamily::V4, NAT_TABLE, POSTROUTING).len(), 1);
    }

    #[test]
    fn teardown_failure_is_reported() {
        let fake = FakeIptables::new();
        fake.fail_all("iptables v1.8.9: can't initialize iptables table `nat'");
        let masq = IptablesMasq::new(fake);
        let err = masq
            .teardown(&nets(&["10.244.0.1/24"]), &MasqIdentity::network("pods"))
            .unwrap_err();
        assert!(err.to_string().contains("can't initialize"));
    }
}

//! nftables masquerade backend.
//!
//! All instances share one `inet` table with a `masq_checks` chain. Every
//! instance owns one rule per address, tagged with a comment that starts
//! with a hash of its identity; teardown deletes exactly the rules carrying
//! that prefix, so two instances reusing an address never remove each
//! other's rules.

use std::fmt::Write as _;

use ipnet::IpNet;
use peta_common::format_hash_with_prefix;
use serde::Deserialize;

use super::exec::{CommandRunner, SystemRunner, args};
use super::{BackendError, IpFamily, MasqBackend, MasqIdentity, Masquerade};
use crate::error::{NetworkError, NetworkResult};

/// Table holding the masquerade chains.
pub const TABLE: &str = "cni_plugins_masquerade";

/// Chain with the per-instance rules.
pub const MASQ_CHAIN: &str = "masq_checks";

/// Base chain hooked into postrouting.
pub const POSTROUTING_CHAIN: &str = "postrouting";

/// Table family.
pub const FAMILY: &str = "inet";

/// Longest comment nftables accepts.
pub const COMMENT_LENGTH_MAX: usize = 128;

const HASH_LEN: usize = 16;

/// Hash identifying a network.
#[must_use]
pub fn hash_for_network(network: &str) -> String {
    hash16(network)
}

/// Hash identifying one interface of one instance on a network.
#[must_use]
pub fn hash_for_instance(identity: &MasqIdentity) -> String {
    format!(
        "{}-{}",
        hash_for_network(&identity.network),
        hash16(&format!("{}:{}", identity.if_name, identity.id))
    )
}

fn hash16(to_hash: &str) -> String {
    // HASH_LEN is well inside the digest length, so this never falls back.
    format_hash_with_prefix(HASH_LEN, "", to_hash).unwrap_or_default()
}

/// Rule comment: the instance hash followed by a readable description,
/// truncated to [`COMMENT_LENGTH_MAX`] bytes.
#[must_use]
pub fn comment_for_instance(identity: &MasqIdentity) -> String {
    let mut comment = format!(
        "{}, net: {}, if: {}, id: {}",
        hash_for_instance(identity),
        identity.network.replace('"', ""),
        identity.if_name.replace('"', ""),
        identity.id.replace('"', ""),
    );
    if comment.len() > COMMENT_LENGTH_MAX {
        let mut end = COMMENT_LENGTH_MAX;
        while !comment.is_char_boundary(end) {
            end -= 1;
        }
        comment.truncate(end);
    }
    comment
}

/// A rule as listed from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftRule {
    /// Chain the rule lives in.
    pub chain: String,
    /// Kernel handle.
    pub handle: u64,
    /// Rule comment.
    pub comment: Option<String>,
}

/// Base chain parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseChain {
    /// Chain type, e.g. `nat`.
    pub kind: &'static str,
    /// Netfilter hook.
    pub hook: &'static str,
    /// Priority keyword or number.
    pub priority: &'static str,
}

/// One step of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NftOp {
    /// Create the table if missing.
    AddTable {
        /// Table comment.
        comment: Option<String>,
    },
    /// Create a chain if missing.
    AddChain {
        /// Chain name.
        name: String,
        /// Hook parameters for base chains.
        base: Option<BaseChain>,
        /// Chain comment.
        comment: Option<String>,
    },
    /// Remove every rule from a chain.
    FlushChain {
        /// Chain name.
        name: String,
    },
    /// Append a rule.
    AddRule {
        /// Chain name.
        chain: String,
        /// Rule body in nft syntax.
        rule: String,
        /// Rule comment.
        comment: Option<String>,
    },
    /// Delete a rule by handle.
    DeleteRule {
        /// Chain name.
        chain: String,
        /// Kernel handle.
        handle: u64,
    },
}

/// An ordered batch of changes applied atomically by `nft -f`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<NftOp>,
}

impl Transaction {
    /// An empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an operation.
    pub fn push(&mut self, op: NftOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Queued operations in order.
    #[must_use]
    pub fn ops(&self) -> &[NftOp] {
        &self.ops
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Render as an `nft -f` script against the masquerade table.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let target = format!("{FAMILY} {TABLE}");
        for op in &self.ops {
            // Writing to a String cannot fail.
            let _ = match op {
                NftOp::AddTable { comment } => match comment {
                    Some(c) => writeln!(out, "add table {target} {{ comment \"{c}\" ; }}"),
                    None => writeln!(out, "add table {target}"),
                },
                NftOp::AddChain {
                    name,
                    base,
                    comment,
                } => {
                    let mut spec = String::new();
                    if let Some(b) = base {
                        let _ = write!(
                            spec,
                            " type {} hook {} priority {} ;",
                            b.kind, b.hook, b.priority
                        );
                    }
                    if let Some(c) = comment {
                        let _ = write!(spec, " comment \"{c}\" ;");
                    }
                    if spec.is_empty() {
                        writeln!(out, "add chain {target} {name}")
                    } else {
                        writeln!(out, "add chain {target} {name} {{{spec} }}")
                    }
                }
                NftOp::FlushChain { name } => writeln!(out, "flush chain {target} {name}"),
                NftOp::AddRule {
                    chain,
                    rule,
                    comment,
                } => match comment {
                    Some(c) => writeln!(out, "add rule {target} {chain} {rule} comment \"{c}\""),
                    None => writeln!(out, "add rule {target} {chain} {rule}"),
                },
                NftOp::DeleteRule { chain, handle } => {
                    writeln!(out, "delete rule {target} {chain} handle {handle}")
                }
            };
        }
        out
    }
}

/// The nftables operations the masquerade backend needs.
pub trait NftOps: Send + Sync {
    /// Whether nftables is usable on this host.
    fn supported(&self) -> bool;

    /// Rules in `chain` of the masquerade table.
    ///
    /// # Errors
    ///
    /// [`BackendError::NotFound`] if the table or chain does not exist.
    fn list_rules(&self, chain: &str) -> Result<Vec<NftRule>, BackendError>;

    /// Apply a transaction atomically.
    ///
    /// # Errors
    ///
    /// The tool's failure output; nothing is applied on failure.
    fn run(&self, tx: &Transaction) -> Result<(), BackendError>;
}

#[derive(Deserialize)]
struct NftListing {
    #[serde(default)]
    nftables: Vec<NftItem>,
}

#[derive(Deserialize)]
struct NftItem {
    #[serde(default)]
    rule: Option<JsonRule>,
}

#[derive(Deserialize)]
struct JsonRule {
    chain: String,
    handle: u64,
    #[serde(default)]
    comment: Option<String>,
}

fn parse_listing(json: &str) -> Result<Vec<NftRule>, BackendError> {
    let listing: NftListing = serde_json::from_str(json)
        .map_err(|e| BackendError::Failed(format!("could not parse nft output: {e}")))?;
    Ok(listing
        .nftables
        .into_iter()
        .filter_map(|item| item.rule)
        .map(|r| NftRule {
            chain: r.chain,
            handle: r.handle,
            comment: r.comment,
        })
        .collect())
}

/// [`NftOps`] through the `nft` binary.
#[derive(Debug, Clone, Default)]
pub struct NftCli<R = SystemRunner> {
    runner: R,
}

impl NftCli {
    /// Drive the host's `nft` binary.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            runner: SystemRunner,
        }
    }
}

impl<R: CommandRunner> NftCli<R> {
    /// Drive nft through `runner`.
    pub const fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    fn failed(out: &super::exec::CommandOutput) -> BackendError {
        let msg = out.stderr.trim().to_string();
        if msg.contains("No such file or directory") {
            BackendError::NotFound(msg)
        } else {
            BackendError::Failed(msg)
        }
    }
}

impl<R: CommandRunner> NftOps for NftCli<R> {
    fn supported(&self) -> bool {
        self.runner
            .run_with_stdin(
                "nft",
                &args(&["--check", "-f", "-"]),
                "add table ip supports_nftables_test\n",
            )
            .is_ok_and(|out| out.success)
    }

    fn list_rules(&self, chain: &str) -> Result<Vec<NftRule>, BackendError> {
        let out = self
            .runner
            .run("nft", &args(&["--json", "list", "chain", FAMILY, TABLE, chain]))
            .map_err(|e| BackendError::Failed(format!("failed to run nft: {e}")))?;
        if !out.success {
            return Err(Self::failed(&out));
        }
        parse_listing(&out.stdout)
    }

    fn run(&self, tx: &Transaction) -> Result<(), BackendError> {
        let script = tx.render();
        tracing::trace!(%script, "Running nft transaction");
        let out = self
            .runner
            .run_with_stdin("nft", &args(&["-f", "-"]), &script)
            .map_err(|e| BackendError::Failed(format!("failed to run nft: {e}")))?;
        if out.success {
            Ok(())
        } else {
            Err(Self::failed(&out))
        }
    }
}

/// Masquerade through commented rules in a shared nftables chain.
#[derive(Debug, Clone, Default)]
pub struct NftablesMasq<T> {
    ops: T,
}

impl<T: NftOps> NftablesMasq<T> {
    /// Backend over `ops`.
    pub const fn new(ops: T) -> Self {
        Self { ops }
    }

    /// The underlying operations.
    pub const fn ops(&self) -> &T {
        &self.ops
    }

    /// Rules in the masquerade chain whose comment starts with `prefix`.
    fn find_rules(&self, prefix: &str) -> Result<Vec<NftRule>, BackendError> {
        match self.ops.list_rules(MASQ_CHAIN) {
            Ok(rules) => Ok(rules
                .into_iter()
                .filter(|r| r.comment.as_deref().is_some_and(|c| c.starts_with(prefix)))
                .collect()),
            // The chain appears with the first install.
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn fail(operation: &str, identity: &MasqIdentity, e: &BackendError) -> NetworkError {
        NetworkError::Firewall {
            backend: "nftables",
            operation: format!("{operation} for network {:?}", identity.network),
            message: e.to_string(),
        }
    }
}

/// Build the transaction that installs `nets` for `identity`, replacing
/// `stale` rules from an earlier install.
#[must_use]
pub fn install_transaction(nets: &[IpNet], identity: &MasqIdentity, stale: &[NftRule]) -> Transaction {
    let mut tx = Transaction::new();
    tx.push(NftOp::AddTable {
        comment: Some("Masquerading for PETA bridge networks".to_string()),
    })
    .push(NftOp::AddChain {
        name: MASQ_CHAIN.to_string(),
        base: None,
        comment: Some(
            "Masquerade traffic from certain IPs to any (non-multicast) IP outside their subnet"
                .to_string(),
        ),
    })
    // Must follow masq_checks so the goto below resolves.
    .push(NftOp::AddChain {
        name: POSTROUTING_CHAIN.to_string(),
        base: Some(BaseChain {
            kind: "nat",
            hook: "postrouting",
            priority: "srcnat",
        }),
        comment: None,
    })
    .push(NftOp::FlushChain {
        name: POSTROUTING_CHAIN.to_string(),
    });

    for rule in [
        "ip daddr == 224.0.0.0/4  return".to_string(),
        "ip6 daddr == ff00::/8  return".to_string(),
        format!("goto {MASQ_CHAIN}"),
    ] {
        tx.push(NftOp::AddRule {
            chain: POSTROUTING_CHAIN.to_string(),
            rule,
            comment: None,
        });
    }

    for rule in stale {
        tx.push(NftOp::DeleteRule {
            chain: rule.chain.clone(),
            handle: rule.handle,
        });
    }

    let comment = comment_for_instance(identity);
    for net in nets {
        let family = match IpFamily::of(net) {
            IpFamily::V4 => "ip",
            IpFamily::V6 => "ip6",
        };
        tx.push(NftOp::AddRule {
            chain: MASQ_CHAIN.to_string(),
            rule: format!(
                "{family} saddr == {} {family} daddr != {} masquerade",
                net.addr(),
                net.trunc()
            ),
            comment: Some(comment.clone()),
        });
    }
    tx
}

impl<T: NftOps> Masquerade for NftablesMasq<T> {
    fn backend(&self) -> MasqBackend {
        MasqBackend::Nftables
    }

    fn supported(&self) -> bool {
        self.ops.supported()
    }

    fn install(&self, nets: &[IpNet], identity: &MasqIdentity) -> NetworkResult<()> {
        let stale = self
            .find_rules(&hash_for_instance(identity))
            .map_err(|e| Self::fail("list masquerade rules", identity, &e))?;
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), network = %identity.network, "Replacing stale nftables rules");
        }

        let tx = install_transaction(nets, identity, &stale);
        self.ops
            .run(&tx)
            .map_err(|e| Self::fail("install masquerade rules", identity, &e))?;
        tracing::debug!(network = %identity.network, nets = nets.len(), "Installed nftables masquerade");
        Ok(())
    }

    fn teardown(&self, _nets: &[IpNet], identity: &MasqIdentity) -> NetworkResult<()> {
        let rules = self
            .find_rules(&hash_for_instance(identity))
            .map_err(|e| Self::fail("list masquerade rules", identity, &e))?;
        if rules.is_empty() {
            return Ok(());
        }

        let mut tx = Transaction::new();
        for rule in &rules {
            tx.push(NftOp::DeleteRule {
                chain: rule.chain.clone(),
                handle: rule.handle,
            });
        }
        self.ops
            .run(&tx)
            .map_err(|e| Self::fail("delete masquerade rules", identity, &e))?;
        tracing::debug!(count = rules.len(), network = %identity.network, "Removed nftables masquerade");
        Ok(())
    }
}

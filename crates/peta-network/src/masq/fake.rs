//! In-memory firewall backends for tests.
//!
//! Clones share state, so a test can keep one handle for inspection while a
//! backend owns the other.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::iptables::IptablesOps;
use super::nftables::{NftOp, NftOps, NftRule, Transaction};
use super::{BackendError, IpFamily};

const NAT_BUILTINS: [&str; 4] = ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

type Chains = BTreeMap<String, Vec<Vec<String>>>;

#[derive(Debug)]
struct IptState {
    supported: bool,
    failure: Option<String>,
    tables: BTreeMap<(IpFamily, String), Chains>,
}

impl IptState {
    fn check(&self) -> Result<(), BackendError> {
        self.failure
            .as_ref()
            .map_or(Ok(()), |msg| Err(BackendError::Failed(msg.clone())))
    }

    fn table(&mut self, family: IpFamily, table: &str) -> &mut Chains {
        self.tables
            .entry((family, table.to_string()))
            .or_insert_with(|| {
                let builtins: &[&str] = if table == "nat" { &NAT_BUILTINS } else { &[] };
                builtins
                    .iter()
                    .map(|c| ((*c).to_string(), Vec::new()))
                    .collect()
            })
    }

    fn chain(&mut self, family: IpFamily, table: &str, chain: &str) -> Result<&mut Vec<Vec<String>>, BackendError> {
        self.table(family, table)
            .get_mut(chain)
            .ok_or_else(|| BackendError::NotFound(format!("iptables: No chain/target/match by that name: {chain}")))
    }
}

/// A fake `iptables` with a `nat` table per family.
#[derive(Debug, Clone)]
pub struct FakeIptables {
    state: Arc<Mutex<IptState>>,
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIptables {
    /// Supported, with only the built-in chains.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IptState {
                supported: true,
                failure: None,
                tables: BTreeMap::new(),
            })),
        }
    }

    /// Whether [`IptablesOps::supported`] reports success.
    pub fn set_supported(&self, supported: bool) {
        self.state.lock().supported = supported;
    }

    /// Make every later operation fail with `message`.
    pub fn fail_all(&self, message: impl Into<String>) {
        self.state.lock().failure = Some(message.into());
    }

    /// Undo [`Self::fail_all`].
    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    /// Rules in a chain, empty if it does not exist.
    #[must_use]
    pub fn rules(&self, family: IpFamily, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .table(family, table)
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a chain exists.
    #[must_use]
    pub fn has_chain(&self, family: IpFamily, table: &str, chain: &str) -> bool {
        self.state.lock().table(family, table).contains_key(chain)
    }
}

impl IptablesOps for FakeIptables {
    fn supported(&self) -> bool {
        self.state.lock().supported
    }

    fn list_chains(&self, family: IpFamily, table: &str) -> Result<Vec<String>, BackendError> {
        let mut state = self.state.lock();
        state.check()?;
        Ok(state.table(family, table).keys().cloned().collect())
    }

    fn new_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check()?;
        let chains = state.table(family, table);
        if chains.contains_key(chain) {
            return Err(BackendError::Failed(format!(
                "iptables: Chain already exists: {chain}"
            )));
        }
        chains.insert(chain.to_string(), Vec::new());
        Ok(())
    }

    fn append_unique(&self, family: IpFamily, table: &str, chain: &str, rule: &[String]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check()?;
        let rules = state.chain(family, table, chain)?;
        if !rules.iter().any(|r| r == rule) {
            rules.push(rule.to_vec());
        }
        Ok(())
    }

    fn delete(&self, family: IpFamily, table: &str, chain: &str, rule: &[String]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check()?;
        let rules = state.chain(family, table, chain)?;
        match rules.iter().position(|r| r == rule) {
            Some(pos) => {
                rules.remove(pos);
                Ok(())
            }
            None => Err(BackendError::NotFound(
                "iptables: Bad rule (does a matching rule exist in that chain?).".to_string(),
            )),
        }
    }

    fn clear_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check()?;
        state
            .table(family, table)
            .entry(chain.to_string())
            .or_default()
            .clear();
        Ok(())
    }

    fn delete_chain(&self, family: IpFamily, table: &str, chain: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check()?;
        let chains = state.table(family, table);
        match chains.get(chain) {
            None => Err(BackendError::NotFound(format!(
                "iptables: No chain/target/match by that name: {chain}"
            ))),
            Some(rules) if !rules.is_empty() => Err(BackendError::Failed(format!(
                "iptables: Directory not empty: {chain}"
            ))),
            Some(_) => {
                chains.remove(chain);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct FakeRule {
    rule: NftRule,
    body: String,
}

#[derive(Debug, Clone, Default)]
struct Ruleset {
    table: bool,
    chains: BTreeMap<String, Vec<FakeRule>>,
    next_handle: u64,
}

impl Ruleset {
    fn chain(&mut self, name: &str) -> Result<&mut Vec<FakeRule>, BackendError> {
        self.chains
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(format!("Error: No such file or directory; chain {name}")))
    }

    fn apply(&mut self, op: &NftOp) -> Result<(), BackendError> {
        match op {
            NftOp::AddTable { .. } => self.table = true,
            NftOp::AddChain { name, .. } => {
                if !self.table {
                    return Err(BackendError::NotFound(
                        "Error: No such file or directory; table".to_string(),
                    ));
                }
                self.chains.entry(name.clone()).or_default();
            }
            NftOp::FlushChain { name } => self.chain(name)?.clear(),
            NftOp::AddRule {
                chain,
                rule,
                comment,
            } => {
                self.next_handle += 1;
                let handle = self.next_handle;
                self.chain(chain)?.push(FakeRule {
                    rule: NftRule {
                        chain: chain.clone(),
                        handle,
                        comment: comment.clone(),
                    },
                    body: rule.clone(),
                });
            }
            NftOp::DeleteRule { chain, handle } => {
                let rules = self.chain(chain)?;
                let pos = rules
                    .iter()
                    .position(|r| r.rule.handle == *handle)
                    .ok_or_else(|| {
                        BackendError::NotFound(format!("Error: Could not process rule: No such file or directory; handle {handle}"))
                    })?;
                rules.remove(pos);
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct NftState {
    supported: bool,
    failure: Option<String>,
    ruleset: Ruleset,
    transactions: usize,
    last_script: Option<String>,
}

/// A fake `nft` holding the masquerade table. Transactions apply atomically.
#[derive(Debug, Clone)]
pub struct FakeNft {
    state: Arc<Mutex<NftState>>,
}

impl Default for FakeNft {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNft {
    /// Supported, with no table yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NftState {
                supported: true,
                failure: None,
                ruleset: Ruleset::default(),
                transactions: 0,
                last_script: None,
            })),
        }
    }

    /// Whether [`NftOps::supported`] reports success.
    pub fn set_supported(&self, supported: bool) {
        self.state.lock().supported = supported;
    }

    /// Make every later operation fail with `message`.
    pub fn fail_all(&self, message: impl Into<String>) {
        self.state.lock().failure = Some(message.into());
    }

    /// Undo [`Self::fail_all`].
    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    /// Rules in a chain, empty if it does not exist.
    #[must_use]
    pub fn rules(&self, chain: &str) -> Vec<NftRule> {
        self.state
            .lock()
            .ruleset
            .chains
            .get(chain)
            .map(|rules| rules.iter().map(|r| r.rule.clone()).collect())
            .unwrap_or_default()
    }

    /// Rule bodies in a chain, without comments.
    #[must_use]
    pub fn rule_bodies(&self, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .ruleset
            .chains
            .get(chain)
            .map(|rules| rules.iter().map(|r| r.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether a chain exists.
    #[must_use]
    pub fn has_chain(&self, chain: &str) -> bool {
        self.state.lock().ruleset.chains.contains_key(chain)
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn transactions(&self) -> usize {
        self.state.lock().transactions
    }

    /// Script of the last committed transaction.
    #[must_use]
    pub fn last_script(&self) -> Option<String> {
        self.state.lock().last_script.clone()
    }
}

impl NftOps for FakeNft {
    fn supported(&self) -> bool {
        self.state.lock().supported
    }

    fn list_rules(&self, chain: &str) -> Result<Vec<NftRule>, BackendError> {
        let mut state = self.state.lock();
        if let Some(msg) = &state.failure {
            return Err(BackendError::Failed(msg.clone()));
        }
        Ok(state
            .ruleset
            .chain(chain)?
            .iter()
            .map(|r| r.rule.clone())
            .collect())
    }

    fn run(&self, tx: &Transaction) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let Some(msg) = &state.failure {
            return Err(BackendError::Failed(msg.clone()));
        }
        let mut next = state.ruleset.clone();
        for op in tx.ops() {
            next.apply(op)?;
        }
        state.ruleset = next;
        state.transactions += 1;
        state.last_script = Some(tx.render());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iptables_builtin_postrouting_exists() {
        let fake = FakeIptables::new();
        assert!(fake.has_chain(IpFamily::V4, "nat", "POSTROUTING"));
        assert!(!fake.has_chain(IpFamily::V4, "nat", "PETA-X"));
    }

    #[test]
    fn iptables_refuses_deleting_busy_chain() {
        let fake = FakeIptables::new();
        fake.new_chain(IpFamily::V4, "nat", "C").unwrap();
        fake.append_unique(IpFamily::V4, "nat", "C", &["-j".into(), "ACCEPT".into()])
            .unwrap();
        assert!(!fake.delete_chain(IpFamily::V4, "nat", "C").unwrap_err().is_not_found());
        assert!(fake.delete_chain(IpFamily::V4, "nat", "D").unwrap_err().is_not_found());
    }

    #[test]
    fn nft_failed_transaction_changes_nothing() {
        let fake = FakeNft::new();
        let mut tx = Transaction::new();
        tx.push(NftOp::AddTable { comment: None })
            .push(NftOp::AddChain {
                name: "c".into(),
                base: None,
                comment: None,
            })
            .push(NftOp::DeleteRule {
                chain: "c".into(),
                handle: 42,
            });
        assert!(fake.run(&tx).unwrap_err().is_not_found());
        assert!(!fake.has_chain("c"));
        assert_eq!(fake.transactions(), 0);
        assert!(fake.list_rules("c").unwrap_err().is_not_found());
    }
}

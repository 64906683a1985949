//! Spanning-tree construction and broadcast dispatch with per-branch repair.

use crate::cluster::{Blacklist, DeferredOp};
use crate::common::TransactionId;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// A nested spanning tree: a leaf is a bare hostname; a branch is the hostname reached by
/// descending its leftmost child, followed by that host's remaining descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tree {
    Leaf(String),
    Node(Vec<Tree>),
}

impl Tree {
    /// The hostname reached by descending leftmost children from this node.
    pub fn first_leaf(&self) -> &str {
        match self {
            Tree::Leaf(h) => h,
            Tree::Node(children) => children.first().expect("tree node has no children").first_leaf(),
        }
    }

    /// Every hostname covered by this (sub)tree, in no particular order.
    pub fn all_hosts(&self) -> Vec<String> {
        match self {
            Tree::Leaf(h) => vec![h.clone()],
            Tree::Node(children) => children.iter().flat_map(Tree::all_hosts).collect(),
        }
    }

    /// Splits a single branch into its root host and the remaining subtree it must further
    /// dispatch to, if any. A branch is either a bare `Leaf(root)` (no descendants) or a
    /// `Node([Leaf(root), remaining])`.
    fn peel(&self) -> (&str, Option<&Tree>) {
        match self {
            Tree::Leaf(h) => (h, None),
            Tree::Node(children) => {
                let root = children[0].first_leaf();
                (root, children.get(1))
            }
        }
    }
}

/// Builds a spanning tree over `nodes` with branching factor `k`: if `nodes.len() <= k` the tree
/// is a flat list; otherwise the first `k` nodes become roots and the remainder is distributed
/// across their subtrees in groups of `ceil((n-k)/k)`, recursing wherever a subtree still exceeds
/// `k` members.
pub fn make_tree(nodes: &[String], k: usize) -> Tree {
    assert!(k >= 1, "branching factor must be at least 1");
    if nodes.len() <= k {
        return Tree::Node(nodes.iter().cloned().map(Tree::Leaf).collect());
    }
    let roots = &nodes[..k];
    let remaining = &nodes[k..];
    let group_size = (remaining.len() + k - 1) / k;

    let branches = roots
        .iter()
        .enumerate()
        .map(|(i, root)| {
            let start = (i * group_size).min(remaining.len());
            let end = (start + group_size).min(remaining.len());
            let group = &remaining[start..end];
            if group.is_empty() {
                Tree::Leaf(root.clone())
            } else if group.len() > k {
                Tree::Node(vec![Tree::Leaf(root.clone()), make_tree(group, k)])
            } else {
                Tree::Node(vec![
                    Tree::Leaf(root.clone()),
                    Tree::Node(group.iter().cloned().map(Tree::Leaf).collect()),
                ])
            }
        })
        .collect();
    Tree::Node(branches)
}

/// Commands the dispatcher or the RPC layer can send a node. `CheckTx` is never broadcast through
/// a tree (it has no subtree argument at the call site) — it's a point-to-point recovery query, a
/// participant asking the coordinator for a transaction's durable decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Prepare,
    LCommit,
    LRollback,
    MDelete,
    CheckTx,
}

impl Command {
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Prepare => "PREPARE",
            Command::LCommit => "LCOMMIT",
            Command::LRollback => "LROLLBCK",
            Command::MDelete => "MDELETE",
            Command::CheckTx => "CHECKTX",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim_end() {
            "PREPARE" => Some(Command::Prepare),
            "LCOMMIT" => Some(Command::LCommit),
            "LROLLBCK" => Some(Command::LRollback),
            "MDELETE" => Some(Command::MDelete),
            "CHECKTX" => Some(Command::CheckTx),
            _ => None,
        }
    }

    /// Whether failing to reach a host must abort the whole broadcast (true only for `PREPARE`,
    /// which is tightly coupled to 2PC correctness) or may instead be deferred for later retry.
    fn failure_is_fatal(&self) -> bool {
        matches!(self, Command::Prepare)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Ok,
    No,
}

/// Sends a command to one host, carrying the subtree it must further dispatch to. Implemented
/// once by the real RPC client (`rpc::framing`) and by fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, host: &str, command: Command, tx: TransactionId, subtree: Option<&Tree>) -> Result<Vote>;
}

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    blacklist: Arc<Blacklist>,
    max_neighbor_nodes: usize,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, blacklist: Arc<Blacklist>, max_neighbor_nodes: usize) -> Self {
        Self { transport, blacklist, max_neighbor_nodes }
    }

    /// Broadcasts `command` to every host in `tree`. Sibling branches run concurrently; a branch
    /// is fully visited (including its recursive descendants, handled by the remote recipient)
    /// before this call's future for that branch resolves.
    pub async fn broadcast(&self, tree: &Tree, command: Command, tx: TransactionId) -> Result<Vote> {
        let branches: Vec<&Tree> = match tree {
            Tree::Leaf(_) => vec![tree],
            Tree::Node(children) => children.iter().collect(),
        };

        let results = futures::future::join_all(
            branches.into_iter().map(|branch| self.dispatch_branch(branch, command, tx)),
        )
        .await;

        let mut outcome = Vote::Ok;
        for vote in results {
            if vote? == Vote::No {
                outcome = Vote::No;
            }
        }
        Ok(outcome)
    }

    /// Replays whatever deferred ops are due for retry: one point-to-point `send` per op, no
    /// subtree (the op already reached every host it needed to when it was first issued; only the
    /// failed branch is being retried here). A host that succeeds is cleared from the blacklist; a
    /// host that fails again stays blacklisted with its backoff already advanced by
    /// `due_for_retry`.
    pub async fn retry_deferred(&self) {
        for (host, ops) in self.blacklist.due_for_retry() {
            for op in ops {
                let Some(command) = Command::from_tag(op.command_tag) else { continue };
                match self.transport.send(&host, command, op.tx, None).await {
                    Ok(_) => self.blacklist.clear(&host),
                    Err(e) => {
                        warn!(host = %host, command = command.tag(), error = %e, "deferred retry failed again");
                        self.blacklist.mark_failed(&host, op);
                    }
                }
            }
        }
    }

    async fn dispatch_branch(&self, branch: &Tree, command: Command, tx: TransactionId) -> Result<Vote> {
        let (root, remaining) = branch.peel();
        match self.transport.send(root, command, tx, remaining).await {
            Ok(vote) => {
                self.blacklist.clear(root);
                Ok(vote)
            }
            Err(e) => {
                warn!(host = root, command = command.tag(), error = %e, "branch dispatch failed");
                self.blacklist.mark_failed(root, DeferredOp { tx, command_tag: command.tag() });

                if command.failure_is_fatal() {
                    return Ok(Vote::No);
                }

                // Rebuild the subtree excluding the failed host and redispatch once; failure here
                // is absorbed by the deferred queue, the broadcast still reports success.
                let mut survivors = branch.all_hosts();
                survivors.retain(|h| h != root);
                if !survivors.is_empty() {
                    let rebuilt = make_tree(&survivors, self.max_neighbor_nodes);
                    if let Err(e) = Box::pin(self.broadcast(&rebuilt, command, tx)).await {
                        warn!(error = %e, "redispatch after rebuild also failed");
                    }
                }
                Ok(Vote::Ok)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn flat_tree_when_within_branching_factor() {
        let nodes: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let tree = make_tree(&nodes, 4);
        assert_eq!(tree.all_hosts().len(), 3);
    }

    #[test]
    fn every_command_tag_round_trips() {
        for c in [Command::Prepare, Command::LCommit, Command::LRollback, Command::MDelete, Command::CheckTx] {
            assert_eq!(Command::from_tag(c.tag()), Some(c));
        }
    }

    #[test]
    fn covers_every_host_exactly_once() {
        let nodes: Vec<String> = (0..37).map(|i| format!("h{i}")).collect();
        let tree = make_tree(&nodes, 3);
        let mut hosts = tree.all_hosts();
        hosts.sort();
        hosts.dedup();
        assert_eq!(hosts.len(), 37);
    }

    struct CountingTransport {
        fail_hosts: Vec<String>,
        calls: Mutex<Vec<String>>,
        fails: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, host: &str, _c: Command, _tx: TransactionId, _s: Option<&Tree>) -> Result<Vote> {
            self.calls.lock().unwrap().push(host.to_string());
            if self.fail_hosts.contains(&host.to_string()) {
                self.fails.fetch_add(1, Ordering::SeqCst);
                return Err(crate::error::DbError::Network(format!("unreachable: {host}")));
            }
            Ok(Vote::Ok)
        }
    }

    #[tokio::test]
    async fn prepare_failure_is_a_no_vote() {
        let nodes: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let tree = make_tree(&nodes, 4);
        let transport =
            Arc::new(CountingTransport { fail_hosts: vec!["b".into()], calls: Mutex::new(vec![]), fails: AtomicUsize::new(0) });
        let dispatcher = Dispatcher::new(transport, Arc::new(Blacklist::new()), 4);
        let vote = dispatcher.broadcast(&tree, Command::Prepare, 1).await.unwrap();
        assert_eq!(vote, Vote::No);
    }

    #[tokio::test]
    async fn commit_failure_is_deferred_not_fatal() {
        let nodes: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let tree = make_tree(&nodes, 4);
        let transport =
            Arc::new(CountingTransport { fail_hosts: vec!["b".into()], calls: Mutex::new(vec![]), fails: AtomicUsize::new(0) });
        let blacklist = Arc::new(Blacklist::new());
        let dispatcher = Dispatcher::new(transport, blacklist.clone(), 4);
        let vote = dispatcher.broadcast(&tree, Command::LCommit, 1).await.unwrap();
        assert_eq!(vote, Vote::Ok);
        assert!(blacklist.is_blacklisted("b"));
    }

    #[tokio::test]
    async fn retry_deferred_clears_blacklist_once_the_host_recovers() {
        struct Recovers(Mutex<bool>);
        #[async_trait]
        impl Transport for Recovers {
            async fn send(&self, _h: &str, _c: Command, _tx: TransactionId, _s: Option<&Tree>) -> Result<Vote> {
                if *self.0.lock().unwrap() {
                    Ok(Vote::Ok)
                } else {
                    Err(crate::error::DbError::Network("still down".into()))
                }
            }
        }

        let blacklist = Arc::new(Blacklist::new());
        blacklist.mark_failed("b", DeferredOp { tx: 1, command_tag: "LCOMMIT" });
        let transport = Arc::new(Recovers(Mutex::new(true)));
        let dispatcher = Dispatcher::new(transport, blacklist.clone(), 4);

        // Not due yet: backoff hasn't elapsed.
        dispatcher.retry_deferred().await;
        assert!(blacklist.is_blacklisted("b"));

        std::thread::sleep(std::time::Duration::from_millis(110));
        dispatcher.retry_deferred().await;
        assert!(!blacklist.is_blacklisted("b"));
    }
}

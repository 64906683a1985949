//! Two-phase commit coordinator: owns the XA log, drives phase 1/2 through the tree dispatcher,
//! and resolves in-doubt transactions on recovery.

use crate::common::TransactionId;
use crate::error::{DbError, Result};
use crate::log::LogManager;
use crate::xa::tree::{Command, Dispatcher, Tree, Vote};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Preparing,
    Committed,
    Aborted,
    Done,
}

pub struct TwoPhaseCommitCoordinator {
    log: Arc<LogManager>,
    dispatcher: Dispatcher,
    states: RwLock<HashMap<TransactionId, TxState>>,
}

impl TwoPhaseCommitCoordinator {
    pub fn new(log: Arc<LogManager>, dispatcher: Dispatcher) -> Self {
        Self { log, dispatcher, states: RwLock::new(HashMap::new()) }
    }

    fn set_state(&self, tx: TransactionId, state: TxState) {
        self.states.write().insert(tx, state);
    }

    /// Drives a full commit attempt: durable `Prepare`, phase-1 broadcast, durable decision,
    /// phase-2 broadcast. Returns `Ok(())` on commit, `Err` on abort (the error carries the
    /// reason so the caller can roll back its local mutations).
    pub async fn try_commit(&self, tx: TransactionId, host_set: Vec<String>) -> Result<()> {
        self.set_state(tx, TxState::Preparing);
        self.log.prepare(tx, host_set.clone(), "xa")?;

        let tree = crate::xa::tree::make_tree(&host_set, host_set.len().max(1));
        let vote = self.dispatcher.broadcast(&tree, Command::Prepare, tx).await?;

        if vote == Vote::Ok {
            self.log.xa_commit(tx, host_set.clone(), "xa")?;
            self.set_state(tx, TxState::Committed);
            info!(tx, "2PC: committed, broadcasting phase 2");
            let _ = self.dispatcher.broadcast(&tree, Command::LCommit, tx).await?;
            self.set_state(tx, TxState::Done);
            Ok(())
        } else {
            self.log.xa_abort(tx, host_set.clone(), "xa")?;
            self.set_state(tx, TxState::Aborted);
            warn!(tx, "2PC: aborted during prepare");
            let _ = self.dispatcher.broadcast(&tree, Command::LRollback, tx).await?;
            self.set_state(tx, TxState::Done);
            Err(DbError::Transaction(format!("tx {tx} aborted: not all participants voted YES")))
        }
    }

    /// Pure broadcast used both on the normal commit path and during recovery resumption.
    pub async fn phase2(&self, tx: TransactionId, host_set: &[String]) -> Result<()> {
        let tree = crate::xa::tree::make_tree(host_set, host_set.len().max(1));
        self.dispatcher.broadcast(&tree, Command::LCommit, tx).await?;
        Ok(())
    }

    pub async fn rollback(&self, tx: TransactionId, host_set: &[String]) -> Result<()> {
        let tree = crate::xa::tree::make_tree(host_set, host_set.len().max(1));
        self.dispatcher.broadcast(&tree, Command::LRollback, tx).await?;
        Ok(())
    }

    /// Consults the XA log for `tx`'s durable decision. `true` iff `XaCommit` is present; `false`
    /// for `XaAbort`, an undecided `Prepare`, or no record at all (the safe default: the asking
    /// participant will roll back).
    pub fn ask_xa(&self, tx: TransactionId) -> Result<bool> {
        let mut committed = false;
        let mut decided = false;
        let mut it = self.log.iterator("xa")?;
        while let Some(entry) = it.next()? {
            if entry.record.tx() != tx {
                continue;
            }
            match entry.record {
                crate::log::LogRecord::XaCommit { .. } => {
                    committed = true;
                    decided = true;
                    break;
                }
                crate::log::LogRecord::XaAbort { .. } => {
                    decided = true;
                    break;
                }
                _ => {}
            }
        }
        let _ = decided;
        Ok(committed)
    }

    /// Replays the XA log's tail to resolve any in-doubt transaction left by a crash: a bare
    /// `Prepare` with no matching decision aborts; `Prepare` + `XaCommit`/`XaAbort` resumes the
    /// corresponding phase-2 broadcast.
    pub async fn recover(&self) -> Result<()> {
        let mut prepared: HashMap<TransactionId, Vec<String>> = HashMap::new();
        let mut decided: HashMap<TransactionId, bool> = HashMap::new();

        let mut it = self.log.forward_iterator("xa")?;
        while let Some(entry) = it.next()? {
            match entry.record {
                crate::log::LogRecord::Prepare { tx, participants } => {
                    prepared.insert(tx, participants);
                }
                crate::log::LogRecord::XaCommit { tx, .. } => {
                    decided.insert(tx, true);
                }
                crate::log::LogRecord::XaAbort { tx, .. } => {
                    decided.insert(tx, false);
                }
                _ => {}
            }
        }

        for (tx, participants) in prepared {
            match decided.get(&tx) {
                Some(true) => {
                    info!(tx, "recovery: resuming phase-2 commit");
                    self.phase2(tx, &participants).await?;
                }
                Some(false) => {
                    info!(tx, "recovery: resuming phase-2 abort");
                    self.rollback(tx, &participants).await?;
                }
                None => {
                    warn!(tx, "recovery: prepare with no decision, aborting");
                    self.log.xa_abort(tx, participants.clone(), "xa")?;
                    self.rollback(tx, &participants).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Blacklist;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct AlwaysOk;
    #[async_trait]
    impl crate::xa::tree::Transport for AlwaysOk {
        async fn send(
            &self,
            _h: &str,
            _c: Command,
            _tx: TransactionId,
            _s: Option<&Tree>,
        ) -> Result<Vote> {
            Ok(Vote::Ok)
        }
    }

    struct FirstVoteNo(Mutex<bool>);
    #[async_trait]
    impl crate::xa::tree::Transport for FirstVoteNo {
        async fn send(
            &self,
            host: &str,
            command: Command,
            _tx: TransactionId,
            _s: Option<&Tree>,
        ) -> Result<Vote> {
            if command == Command::Prepare && host == "b" {
                return Ok(Vote::No);
            }
            Ok(Vote::Ok)
        }
    }

    fn coordinator(transport: Arc<dyn crate::xa::tree::Transport>) -> TwoPhaseCommitCoordinator {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(LogManager::new(dir.path().to_path_buf(), 1 << 20).unwrap());
        let dispatcher = Dispatcher::new(transport, Arc::new(Blacklist::new()), 4);
        TwoPhaseCommitCoordinator::new(log, dispatcher)
    }

    #[tokio::test]
    async fn commits_when_all_vote_yes() {
        let coord = coordinator(Arc::new(AlwaysOk));
        let hosts = vec!["a".to_string(), "b".to_string()];
        coord.try_commit(1, hosts).await.unwrap();
        assert!(coord.ask_xa(1).unwrap());
    }

    #[tokio::test]
    async fn aborts_when_any_vote_no() {
        let coord = coordinator(Arc::new(FirstVoteNo(Mutex::new(false))));
        let hosts = vec!["a".to_string(), "b".to_string()];
        let err = coord.try_commit(2, hosts).await.unwrap_err();
        assert!(matches!(err, DbError::Transaction(_)));
        assert!(!coord.ask_xa(2).unwrap());
    }
}

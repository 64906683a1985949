//! Per-host failure state and the deferred-command retry queue.
//!
//! When a broadcast branch fails to reach a host, the tree dispatcher (C6) blacklists it and
//! enqueues the failed command for later retry rather than treating the whole broadcast as
//! failed. A background reaper drains expired blacklist entries with simple exponential backoff.
//! This state is in-memory only; if the process dies, recovery (C4) re-derives commitment intent
//! from the XA log instead of depending on it.

use crate::common::TransactionId;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A command that failed to reach a host and must be retried once the host recovers.
#[derive(Debug, Clone)]
pub struct DeferredOp {
    pub tx: TransactionId,
    pub command_tag: &'static str,
}

struct HostState {
    blacklisted: bool,
    pending: Vec<DeferredOp>,
    next_retry: Instant,
    backoff: Duration,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct Blacklist {
    hosts: DashMap<String, HostState>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self { hosts: DashMap::new() }
    }

    pub fn is_blacklisted(&self, host: &str) -> bool {
        self.hosts.get(host).map(|s| s.blacklisted).unwrap_or(false)
    }

    /// Marks `host` blacklisted and queues `op` for retry on its next backoff expiry.
    pub fn mark_failed(&self, host: &str, op: DeferredOp) {
        let mut entry = self.hosts.entry(host.to_string()).or_insert_with(|| HostState {
            blacklisted: true,
            pending: Vec::new(),
            next_retry: Instant::now() + INITIAL_BACKOFF,
            backoff: INITIAL_BACKOFF,
        });
        entry.blacklisted = true;
        entry.pending.push(op);
    }

    /// Clears a host's blacklist state once it has been confirmed reachable again.
    pub fn clear(&self, host: &str) {
        self.hosts.remove(host);
    }

    /// Drains and returns the pending ops for every host whose backoff has expired, doubling each
    /// host's backoff (capped at `MAX_BACKOFF`) so repeated failures back off further.
    pub fn due_for_retry(&self) -> Vec<(String, Vec<DeferredOp>)> {
        let now = Instant::now();
        let mut due = Vec::new();
        for mut entry in self.hosts.iter_mut() {
            if entry.blacklisted && entry.next_retry <= now && !entry.pending.is_empty() {
                let ops = std::mem::take(&mut entry.pending);
                entry.next_retry = now + entry.backoff;
                entry.backoff = (entry.backoff * 2).min(MAX_BACKOFF);
                due.push((entry.key().clone(), ops));
            }
        }
        due
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklists_and_queues_pending_op() {
        let bl = Blacklist::new();
        assert!(!bl.is_blacklisted("h1"));
        bl.mark_failed("h1", DeferredOp { tx: 1, command_tag: "LCOMMIT" });
        assert!(bl.is_blacklisted("h1"));
    }

    #[test]
    fn due_for_retry_only_after_backoff_elapses() {
        let bl = Blacklist::new();
        bl.mark_failed("h1", DeferredOp { tx: 1, command_tag: "LCOMMIT" });
        assert!(bl.due_for_retry().is_empty());
        std::thread::sleep(INITIAL_BACKOFF + Duration::from_millis(10));
        let due = bl.due_for_retry();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "h1");
        assert_eq!(due[0].1.len(), 1);
    }

    #[test]
    fn clear_removes_host_state() {
        let bl = Blacklist::new();
        bl.mark_failed("h1", DeferredOp { tx: 1, command_tag: "LCOMMIT" });
        bl.clear("h1");
        assert!(!bl.is_blacklisted("h1"));
    }
}

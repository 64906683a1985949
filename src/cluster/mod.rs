//! Cluster-wide, process-local failure bookkeeping.

pub mod blacklist;

pub use blacklist::{Blacklist, DeferredOp};

//! Local (per-node) transaction tracking.

pub mod local;

pub use local::{LocalTransaction, RidChange};

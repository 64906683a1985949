//! Two-phase commit: the coordinator state machine (`coordinator`) and the spanning-tree
//! broadcast dispatcher it drives (`tree`).

pub mod coordinator;
pub mod tree;

pub use coordinator::TwoPhaseCommitCoordinator;
pub use tree::{make_tree, Command, Dispatcher, Tree, Transport, Vote};

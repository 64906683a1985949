//! Device-sharded node-local DML execution.

pub mod executor;

pub use executor::{NodeDmlExecutor, Row, RowDelete, RowUpdate};

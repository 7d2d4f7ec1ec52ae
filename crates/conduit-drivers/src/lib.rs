//! Conduit Drivers - database driver implementations
//!
//! This crate provides the concrete drivers behind the SQL adapter and the
//! registry that resolves a connection URL's dialect to one of them.

#[cfg(feature = "sqlite")]
pub use conduit_driver_sqlite as sqlite;

mod registry;

pub use registry::{DriverRegistry, missing_dependency_hint};

/// Re-export commonly used types from conduit-core
pub use conduit_core::{
    ColumnMeta, ConduitError, Connection, ConnectionUrl, DatabaseDriver, EngineOptions,
    QueryResult, Result, Row, StatementResult, Transaction, Value,
};

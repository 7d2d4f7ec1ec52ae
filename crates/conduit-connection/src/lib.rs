//! Conduit Connection - connection adapters
//!
//! - [`BaseConnection`] / [`Connector`] - lazy, resettable client handles
//! - [`SqlConnection`] - SQL engines resolved through the driver registry
//! - [`WarehouseConnection`] - lock-serialized warehouse sessions
//! - [`ConnectionFactory`] - named, memoized construction
//!
//! Adapter `query` methods cache successful results and retry failures,
//! resetting the handle between attempts.

mod base;
mod cache;
mod factory;
mod retry;
mod sql;
pub mod warehouse;

#[cfg(test)]
mod tests;

pub use base::{BaseConnection, ConnectOptions, Connector, DEFAULT_NAME};
pub use cache::{CacheStats, QueryCache};
pub use factory::{
    AnyConnection, ConnectionFactory, ConnectionKind, MemoPolicy, connection, global,
    install_global,
};
pub use retry::RetryPolicy;
pub use sql::{Engine, SqlConnection, SqlConnector, SqlSession};
pub use warehouse::{
    SessionBuilder, WarehouseConnection, WarehouseConnector, WarehouseSession,
    WarehouseSessionGuard,
};

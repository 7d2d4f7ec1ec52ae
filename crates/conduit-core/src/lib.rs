//! Conduit Core - shared abstractions for the connection adapters
//!
//! This crate provides the traits and types every other conduit crate
//! depends on:
//!
//! - `DatabaseDriver` / `Connection` - the database client seam
//! - `ConnectionUrl` - parsing and composing connection URLs
//! - `DataFrame` and `read_sql` - tabular query results
//! - `TomlSecrets` - `[connections.<name>]` secrets lookup
//! - `ConduitError` - the error type shared by all crates

mod connection;
mod connection_url;
mod driver;
mod error;
mod frame;
pub mod paths;
mod secrets;
mod types;

pub use connection::*;
pub use connection_url::ConnectionUrl;
pub use driver::*;
pub use error::*;
pub use frame::*;
pub use secrets::*;
pub use types::*;

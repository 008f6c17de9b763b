//! # Database
//!
//! Connection pooling and schema migrations for the durable lock store.
//!
//! ```rust,no_run
//! use cob_core::config::DatabaseConfig;
//! use cob_core::database::DatabaseConnection;
//! use cob_core::locking::PgLockStore;
//!
//! # async fn example(config: &DatabaseConfig) -> cob_core::Result<()> {
//! let db = DatabaseConnection::connect(config).await?;
//! let store = PgLockStore::new(db.pool().clone());
//! # Ok(())
//! # }
//! ```

pub mod connection;

pub use connection::DatabaseConnection;

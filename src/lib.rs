#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # COB Core
//!
//! Close-of-business (COB) batch orchestration for loan portfolios, with
//! durable per-entity locking between the nightly batch and on-demand inline
//! requests.
//!
//! ## Overview
//!
//! Every night the batch advances each loan's derived state (overdue status,
//! accrued interest, delinquency tags) to the COB date by running a fixed,
//! ordered pipeline of business steps. Live requests may bring a single loan
//! current at any time through the inline path. A persisted lock row per
//! entity keeps the two from mutating the same record at once, and doubles as
//! the durable record of a failure that operators follow up on.
//!
//! ## Module Organization
//!
//! - [`models`] - entities, locks, execution maps and run summaries
//! - [`locking`] - the lock manager and its in-memory and PostgreSQL stores
//! - [`steps`] - the business step contract and registry
//! - [`orchestration`] - pipeline executor, batch/inline/catch-up runners, service facade
//! - [`repository`] - entity persistence and candidate selection seams
//! - [`events`] - business event emission and sinks
//! - [`config`] - layered TOML configuration
//! - [`error`] - crate-level error type
//! - [`logging`] - structured logging initialisation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cob_core::config::ConfigManager;
//! use cob_core::models::Loan;
//! use cob_core::orchestration::{CobService, RequestContext};
//! use cob_core::repository::InMemoryEntityRepository;
//! use cob_core::steps::BusinessStepRegistry;
//!
//! # async fn example(steps: BusinessStepRegistry<Loan>) -> cob_core::Result<()> {
//! cob_core::logging::init_structured_logging();
//!
//! let manager = ConfigManager::load()?;
//! let loans = Arc::new(InMemoryEntityRepository::<Loan>::new());
//! let service = CobService::builder(manager.config().clone())
//!     .steps(steps)
//!     .repository(loans.clone())
//!     .selector(loans)
//!     .build()?;
//!
//! let run_id = service.run_job("LOAN_CLOSE_OF_BUSINESS").await?;
//! for lock in service.failed_locks().await? {
//!     println!("loan {} failed: {:?}", lock.entity_id, lock.error);
//! }
//!
//! service
//!     .run_inline(42, "LOAN_CLOSE_OF_BUSINESS", &RequestContext::new())
//!     .await
//!     .ok();
//! # let _ = run_id;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
#[cfg(feature = "postgres")]
pub mod database;
pub mod error;
pub mod events;
pub mod locking;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod repository;
pub mod steps;

pub use config::{CobConfig, ConfigManager, ConfigurationError};
pub use error::{CobError, Result};
pub use locking::{LockError, LockManager, OverruleMode};
pub use models::{CobEntity, EntityId, EntityLock, LockOwner, Loan};
pub use orchestration::{CobService, InlineError, InlineOutcome, RequestContext};
pub use steps::{BusinessStep, StepContext, StepFailure};

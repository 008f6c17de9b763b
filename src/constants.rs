//! # System Constants
//!
//! Well-known job names and run context keys shared by the
//! batch, inline and catch-up paths.

/// Job names known to the default configuration
pub mod jobs {
    /// Nightly close-of-business job over every active loan
    pub const LOAN_CLOSE_OF_BUSINESS: &str = "LOAN_CLOSE_OF_BUSINESS";
}

/// Keys of the run context threaded into every chunk and step
pub mod context_keys {
    /// Business date processed by this run (the "COB date")
    pub const BUSINESS_DATE: &str = "BUSINESS_DATE";
    pub const JOB_NAME: &str = "JOB_NAME";
    pub const RUN_ID: &str = "RUN_ID";
    pub const CORRELATION_ID: &str = "CORRELATION_ID";
    pub const TENANT_ID: &str = "TENANT_ID";
    pub const CHUNK_INDEX: &str = "CHUNK_INDEX";
    pub const ENTITY_ID: &str = "ENTITY_ID";
    pub const STEP_NAME: &str = "STEP_NAME";
    pub const STEP_ORDER: &str = "STEP_ORDER";
    /// Set on contexts created by the inline path
    pub const INLINE: &str = "INLINE";
}

/// Default environment name when `COB_ENV` is unset
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Environment variable selecting the configuration environment
pub const ENVIRONMENT_VARIABLE: &str = "COB_ENV";

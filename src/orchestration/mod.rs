//! # Orchestration
//!
//! Batch, inline and catch-up execution of close-of-business pipelines.
//!
//! ## Components
//!
//! - [`run_context`] - run-scoped parameters and their copy-down into narrower scopes
//! - [`pipeline`] - ordered business step execution over one entity
//! - [`listener`] - per-item read/process/write failure isolation
//! - [`batch_runner`] - chunked, multi-worker processing of every candidate
//! - [`inline_runner`] - synchronous single-entity processing for requests
//! - [`catch_up`] - one batch run per missed business date
//! - [`hooks`] - before/after job callbacks
//! - [`run_registry`] - status, counters and cancellation of runs
//! - [`service`] - the operational facade assembling all of the above

pub mod batch_runner;
pub mod catch_up;
pub mod hooks;
pub mod inline_runner;
pub mod listener;
pub mod pipeline;
pub mod run_context;
pub mod run_registry;
pub mod service;

pub use batch_runner::{BatchRunner, BatchSettings};
pub use catch_up::{CatchUpReport, CatchUpRunner};
pub use hooks::{HookError, HookRegistry, HookRegistryBuilder, JobHook};
pub use inline_runner::{pending_business_dates, InlineError, InlineOutcome, InlineRunner};
pub use listener::{ChunkFailure, ErrorSkipListener, SkipDecision};
pub use pipeline::{PipelineExecutor, PipelineOutcome, ResolvedPipeline, ResolvedStep};
pub use run_context::{ContextPropagator, ContextScope, ContextValue, RunContext};
pub use run_registry::{ActiveRun, Counter, JobRunRegistry, RunHandle};
pub use service::{
    BusinessDateSource, CobService, CobServiceBuilder, FixedBusinessDate, RequestContext,
    SystemBusinessDate,
};

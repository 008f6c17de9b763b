//! # Job Hooks
//!
//! Before/after callbacks around a batch run, registered per job name in a
//! table built once at start-up. A before-hook may add run-level context
//! values and can veto the run by failing; after-hook failures are logged and
//! counted but never change the run's status.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::run_context::RunContext;
use crate::models::JobRunSummary;

#[derive(Debug, Error)]
#[error("Hook '{hook}' failed: {message}")]
pub struct HookError {
    pub hook: String,
    pub message: String,
}

impl HookError {
    pub fn new(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait JobHook: Send + Sync {
    fn name(&self) -> &str;

    async fn before_job(&self, _context: &mut RunContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_job(
        &self,
        _context: &RunContext,
        _summary: &JobRunSummary,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Immutable job name → ordered hooks table
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Arc<HashMap<String, Vec<Arc<dyn JobHook>>>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = f.debug_map();
        for (job, hooks) in self.hooks.iter() {
            let names: Vec<&str> = hooks.iter().map(|hook| hook.name()).collect();
            table.entry(job, &names);
        }
        table.finish()
    }
}

impl HookRegistry {
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Hooks for a job in registration order
    pub fn hooks_for(&self, job_name: &str) -> &[Arc<dyn JobHook>] {
        self.hooks
            .get(job_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct HookRegistryBuilder {
    hooks: HashMap<String, Vec<Arc<dyn JobHook>>>,
}

impl HookRegistryBuilder {
    pub fn register(mut self, job_name: impl Into<String>, hook: Arc<dyn JobHook>) -> Self {
        self.hooks.entry(job_name.into()).or_default().push(hook);
        self
    }

    pub fn build(self) -> HookRegistry {
        HookRegistry {
            hooks: Arc::new(self.hooks),
        }
    }
}

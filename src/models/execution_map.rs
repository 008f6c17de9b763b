//! # Execution Map
//!
//! The fixed, ordered pipeline of business step names for one job. Sequence
//! keys are unique within a job, iterate ascending and may have gaps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::config::JobConfig;
use crate::error::{CobError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMap {
    job_name: String,
    steps: BTreeMap<u32, String>,
}

impl ExecutionMap {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            steps: BTreeMap::new(),
        }
    }

    /// Build from `(order, step name)` pairs, rejecting duplicate keys
    pub fn from_entries<I, S>(job_name: impl Into<String>, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let mut map = Self::new(job_name);
        for (order, step) in entries {
            map.insert(order, step)?;
        }
        Ok(map)
    }

    pub fn insert(&mut self, order: u32, step: impl Into<String>) -> Result<()> {
        if self.steps.contains_key(&order) {
            return Err(CobError::DuplicateStepOrder {
                job_name: self.job_name.clone(),
                order,
            });
        }
        self.steps.insert(order, step.into());
        Ok(())
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Entries in ascending sequence order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.steps.iter().map(|(order, name)| (*order, name.as_str()))
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.values().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl TryFrom<&JobConfig> for ExecutionMap {
    type Error = CobError;

    fn try_from(job: &JobConfig) -> Result<Self> {
        Self::from_entries(
            job.name.clone(),
            job.steps.iter().map(|s| (s.order, s.name.clone())),
        )
    }
}

/// Start-up table of execution maps keyed by job name
#[derive(Debug, Clone, Default)]
pub struct ExecutionMapRegistry {
    maps: HashMap<String, ExecutionMap>,
}

impl ExecutionMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: &[JobConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for job in jobs {
            registry.register(ExecutionMap::try_from(job)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, map: ExecutionMap) {
        self.maps.insert(map.job_name().to_string(), map);
    }

    pub fn get(&self, job_name: &str) -> Result<&ExecutionMap> {
        self.maps
            .get(job_name)
            .ok_or_else(|| CobError::UnknownJob(job_name.to_string()))
    }

    pub fn job_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.maps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

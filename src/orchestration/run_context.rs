//! # Run Context
//!
//! Run-scoped parameters established once per job invocation and copied down
//! into chunk, entity and step scopes. Copy-down never overwrites a value the
//! narrower scope already set explicitly.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::constants::context_keys;
use crate::error::{CobError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
    Date(NaiveDate),
    Text(String),
    Integer(i64),
    Flag(bool),
    Json(Value),
}

impl From<NaiveDate> for ContextValue {
    fn from(value: NaiveDate) -> Self {
        ContextValue::Date(value)
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.to_string())
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Integer(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Flag(value)
    }
}

impl From<Value> for ContextValue {
    fn from(value: Value) -> Self {
        ContextValue::Json(value)
    }
}

impl From<Uuid> for ContextValue {
    fn from(value: Uuid) -> Self {
        ContextValue::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Job,
    Chunk,
    Entity,
    Step,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    scope: ContextScope,
    values: BTreeMap<String, ContextValue>,
}

impl RunContext {
    pub fn new(scope: ContextScope) -> Self {
        Self {
            scope,
            values: BTreeMap::new(),
        }
    }

    /// Job-scope context carrying the business date and job name
    pub fn for_job(job_name: &str, business_date: NaiveDate) -> Self {
        let mut context = Self::new(ContextScope::Job);
        context.set(context_keys::JOB_NAME, job_name);
        context.set(context_keys::BUSINESS_DATE, business_date);
        context
    }

    pub fn scope(&self) -> ContextScope {
        self.scope
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn date(&self, key: &str) -> Option<NaiveDate> {
        match self.values.get(key) {
            Some(ContextValue::Date(date)) => Some(*date),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(ContextValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(ContextValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(ContextValue::Flag(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn business_date(&self) -> Result<NaiveDate> {
        self.date(context_keys::BUSINESS_DATE)
            .ok_or_else(|| CobError::MissingContext(context_keys::BUSINESS_DATE.to_string()))
    }

    pub fn job_name(&self) -> Option<&str> {
        self.text(context_keys::JOB_NAME)
    }

    /// A narrower-scope copy of this context with every value carried down
    pub fn child(&self, scope: ContextScope) -> RunContext {
        let mut child = RunContext::new(scope);
        ContextPropagator::all().propagate(self, &mut child);
        child
    }

    /// JSON rendering used in failure detail
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.values {
            let rendered = match value {
                ContextValue::Date(date) => Value::String(date.to_string()),
                ContextValue::Text(text) => Value::String(text.clone()),
                ContextValue::Integer(i) => Value::from(*i),
                ContextValue::Flag(b) => Value::Bool(*b),
                ContextValue::Json(json) => json.clone(),
            };
            map.insert(key.clone(), rendered);
        }
        Value::Object(map)
    }
}

/// Copies selected keys from a wider scope into a narrower one, filling only
/// keys the narrower scope has not set
#[derive(Debug, Clone, Default)]
pub struct ContextPropagator {
    keys: Option<Vec<String>>,
}

impl ContextPropagator {
    /// Propagate every key of the source context
    pub fn all() -> Self {
        Self { keys: None }
    }

    /// Propagate only the named keys
    pub fn only<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Some(keys.into_iter().map(Into::into).collect()),
        }
    }

    /// Fill absent keys of `target` from `source`; returns how many were copied
    pub fn propagate(&self, source: &RunContext, target: &mut RunContext) -> usize {
        let mut copied = 0;
        match &self.keys {
            None => {
                for (key, value) in &source.values {
                    if !target.values.contains_key(key) {
                        target.values.insert(key.clone(), value.clone());
                        copied += 1;
                    }
                }
            }
            Some(keys) => {
                for key in keys {
                    if target.values.contains_key(key) {
                        continue;
                    }
                    if let Some(value) = source.values.get(key) {
                        target.values.insert(key.clone(), value.clone());
                        copied += 1;
                    }
                }
            }
        }
        copied
    }
}

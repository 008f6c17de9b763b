use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::BusinessStep;
use crate::models::CobEntity;

/// Business steps by name, built once at start-up
pub struct BusinessStepRegistry<E: CobEntity> {
    steps: HashMap<String, Arc<dyn BusinessStep<E>>>,
}

impl<E: CobEntity> Default for BusinessStepRegistry<E> {
    fn default() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }
}

impl<E: CobEntity> BusinessStepRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its own name, replacing any previous step of the
    /// same name
    pub fn register(&mut self, step: Arc<dyn BusinessStep<E>>) {
        let name = step.name().to_string();
        debug!(step = %name, display_name = %step.display_name(), "Registering business step");
        self.steps.insert(name, step);
    }

    pub fn with_step(mut self, step: impl BusinessStep<E> + 'static) -> Self {
        self.register(Arc::new(step));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BusinessStep<E>>> {
        self.steps.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Loan;
    use crate::steps::{StepContext, StepFailure};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl BusinessStep<Loan> for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, loan: Loan, _context: &StepContext<'_>) -> Result<Loan, StepFailure> {
            Ok(loan)
        }
    }

    #[test]
    fn test_registry_lookup_by_name() {
        let registry = BusinessStepRegistry::new()
            .with_step(Named("B"))
            .with_step(Named("A"));
        assert_eq!(registry.names(), vec!["A", "B"]);
        assert!(registry.contains("A"));
        assert!(registry.get("C").is_none());
        assert_eq!(registry.get("B").unwrap().display_name(), "B");
    }
}

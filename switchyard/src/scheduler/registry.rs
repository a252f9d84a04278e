//! Maps function references to operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::executor::Operation;
use crate::{Error, Result};

/// Operations the scheduler can run, keyed by [`Operation::name`].
#[derive(Default, Clone)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `operation`, replacing any previous one with the same name.
    pub fn register(&mut self, operation: Arc<dyn Operation>) -> &mut Self {
        self.operations
            .insert(operation.name().to_string(), operation);
        self
    }

    pub fn get(&self, function_ref: &str) -> Result<Arc<dyn Operation>> {
        self.operations
            .get(function_ref)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown operation '{function_ref}'")))
    }

    pub fn contains(&self, function_ref: &str) -> bool {
        self.operations.contains_key(function_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }
}

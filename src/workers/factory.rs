//! # Worker Factory
//!
//! Constructor functions keyed by worker type tag. Built up front, then owned
//! by the supervisor; nothing is discovered at runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::{WorkerError, WorkerResult};
use super::scope::WorkerScope;
use super::traits::{FromScope, Worker};

pub type WorkerConstructor =
    Arc<dyn Fn(WorkerScope) -> WorkerResult<Box<dyn Worker>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct WorkerFactory {
    constructors: HashMap<String, WorkerConstructor>,
}

impl fmt::Debug for WorkerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerFactory")
            .field("worker_types", &self.worker_types())
            .finish()
    }
}

impl WorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `W` under `W::WORKER_TYPE`
    pub fn register<W: FromScope>(&mut self) -> &mut Self {
        self.register_fn(W::WORKER_TYPE, |scope| {
            W::from_scope(scope).map(|worker| Box::new(worker) as Box<dyn Worker>)
        })
    }

    /// Register a constructor function under `worker_type`; replaces any previous one
    pub fn register_fn<F>(&mut self, worker_type: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(WorkerScope) -> WorkerResult<Box<dyn Worker>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(worker_type.into(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, worker_type: &str) -> bool {
        self.constructors.contains_key(worker_type)
    }

    /// Registered tags, sorted
    pub fn worker_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build a worker of type `worker_type` owning `scope`
    pub fn create(&self, worker_type: &str, scope: WorkerScope) -> WorkerResult<Box<dyn Worker>> {
        let constructor = self
            .constructors
            .get(worker_type)
            .ok_or_else(|| WorkerError::unknown_worker_type(worker_type))?;
        constructor(scope)
    }
}

//! Static mapping from job type to handler.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::handler::JobHandler;
use crate::types::JobType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no handler registered for job types: {0:?}")]
    MissingHandlers(Vec<JobType>),

    #[error("more than one handler registered for job type {0}")]
    DuplicateHandler(JobType),
}

/// Handlers keyed by `JobType`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn serves(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Served types, in `JobType::ALL` order.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.serves(*t))
            .collect()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    duplicate: Option<JobType>,
}

impl HandlerRegistryBuilder {
    pub fn register<H>(self, job_type: JobType, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        if self.handlers.insert(job_type, handler).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(job_type);
        }
        self
    }

    /// Build a registry that serves every job type.
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let missing: Vec<JobType> = JobType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingHandlers(missing));
        }
        self.build_partial()
    }

    /// Build a registry for a dedicated pool. Jobs of unserved types fail
    /// permanently if this registry ever executes them.
    pub fn build_partial(self) -> Result<HandlerRegistry, RegistryError> {
        if let Some(job_type) = self.duplicate {
            return Err(RegistryError::DuplicateHandler(job_type));
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}

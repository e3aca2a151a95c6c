//! Executor registry: server-side execution of remote-service capabilities.
//!
//! The `CapabilityExecutor` trait abstracts where a capability actually runs:
//! - `HttpExecutor` forwards the invocation to the persistence service
//! - `FnExecutor` runs an in-process async closure
//!
//! Local-device capabilities never reach this module.

pub mod function;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::CapabilityDescriptor;
use crate::error::{DexError, DexResult};
use crate::types::CapabilityInvocation;

pub use function::{CapabilityFn, FnExecutor};
pub use http::HttpExecutor;

/// Executes one capability invocation on behalf of a user.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// Result text on success; an error becomes the capability's result text upstream.
    async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        invocation: &CapabilityInvocation,
        user_id: &str,
    ) -> DexResult<String>;

    /// Name of this executor type.
    fn executor_name(&self) -> &str;
}

/// Routes capability names to executors.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn CapabilityExecutor>>,
    routes: HashMap<String, String>,
    fallback: Option<Arc<dyn CapabilityExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            routes: HashMap::new(),
            fallback: None,
        }
    }

    /// Register an executor by its name.
    pub fn register_executor(&mut self, executor: Arc<dyn CapabilityExecutor>) {
        self.executors
            .insert(executor.executor_name().to_string(), executor);
    }

    /// Send invocations of `capability` to the executor named `executor_name`.
    pub fn route(&mut self, capability: impl Into<String>, executor_name: impl Into<String>) {
        self.routes.insert(capability.into(), executor_name.into());
    }

    /// Executor for capabilities without an explicit route.
    pub fn set_fallback(&mut self, executor: Arc<dyn CapabilityExecutor>) {
        self.fallback = Some(executor);
    }

    pub async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        invocation: &CapabilityInvocation,
        user_id: &str,
    ) -> DexResult<String> {
        if let Some(executor_name) = self.routes.get(&descriptor.name) {
            let executor = self
                .executors
                .get(executor_name)
                .ok_or_else(|| DexError::ExecutorNotFound {
                    name: executor_name.clone(),
                })?;
            return executor.execute(descriptor, invocation, user_id).await;
        }

        if let Some(fallback) = &self.fallback {
            return fallback.execute(descriptor, invocation, user_id).await;
        }

        Err(DexError::CapabilityExecution {
            capability: descriptor.name.clone(),
            message: format!("No executor found for capability '{}'", descriptor.name),
        })
    }

    pub fn can_execute(&self, name: &str) -> bool {
        self.routes.contains_key(name) || self.fallback.is_some()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

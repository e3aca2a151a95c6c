//! In-process executor backed by an async closure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::CapabilityDescriptor;
use crate::error::DexResult;
use crate::types::CapabilityInvocation;

use super::CapabilityExecutor;

/// Function type for in-process capabilities: (invocation, user id) to result text.
pub type CapabilityFn = Arc<
    dyn Fn(CapabilityInvocation, String) -> Pin<Box<dyn Future<Output = DexResult<String>> + Send>>
        + Send
        + Sync,
>;

pub struct FnExecutor {
    name: String,
    func: CapabilityFn,
}

impl FnExecutor {
    pub fn new(name: impl Into<String>, func: CapabilityFn) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl CapabilityExecutor for FnExecutor {
    async fn execute(
        &self,
        _descriptor: &CapabilityDescriptor,
        invocation: &CapabilityInvocation,
        user_id: &str,
    ) -> DexResult<String> {
        (self.func)(invocation.clone(), user_id.to_string()).await
    }

    fn executor_name(&self) -> &str {
        &self.name
    }
}

//! # Script Evaluator Contract
//!
//! The core only requires a *script-evaluation capability* (spec.md §4.C,  §1):
//! "the engine's behavior is unchanged by which evaluator is plugged in." This
//! module defines that capability as an object-safe async trait, the same shape as
//! the teacher's `IpcTransport` (`src/ipc/mod.rs`): a handle-returning `compile`,
//! a `evaluate`, and explicit teardown.
//!
//! The JavaScript-embedded implementation itself is out of scope (spec.md §1);
//! `NoopEvaluator` below is the trivial evaluator used by tests and by channels
//! that declare no filter/transformer scripts.

use crate::error::{EngineError, Result};
use crate::model::Maps;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// The scope a compiled script runs in, per spec.md §4.C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptScope {
    GlobalDeploy,
    ChannelDeploy,
    SourceFilter,
    SourceTransformer,
    DestinationFilter,
    DestinationTransformer,
    Response,
}

/// An opaque handle to a compiled script. The evaluator implementation decides
/// what this actually references (a bytecode blob, a VM context, ...); the core
/// never inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHandle(pub u64);

/// The bindings a script evaluation sees: the per-message maps, the shared
/// process-wide and per-channel maps (spec.md §3), and the raw or transformed
/// text being processed. `global_map` and `global_channel_map` are handed to
/// the evaluator as live, shared structures rather than snapshots, so a real
/// evaluator implementation can read and write through them directly with
/// `DashMap`'s per-key locking; `configuration_map` is read-mostly and loaded
/// once at process start, so it is shared but never mutated here.
#[derive(Debug, Clone)]
pub struct ScriptBindings {
    pub maps: Maps,
    pub global_map: Arc<DashMap<String, String>>,
    pub global_channel_map: Arc<DashMap<String, String>>,
    pub configuration_map: Arc<HashMap<String, String>>,
    pub message_text: String,
}

/// The result of evaluating a filter script.
#[derive(Debug, Clone, Copy)]
pub struct FilterResult {
    pub filtered: bool,
}

/// The result of evaluating a transformer script.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub transformed: String,
    pub channel_map_delta: HashMap<String, String>,
    pub connector_map_delta: HashMap<String, String>,
}

/// The result of evaluating a response script.
#[derive(Debug, Clone)]
pub struct ResponseResult {
    pub status: crate::connector::ResponseStatus,
    pub message: Option<String>,
}

/// A capability the pipeline engine consumes to run filter/transformer/response
/// scripts without knowing how they're implemented.
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    /// Compile `source` for `scope` within `channel_id`, returning an opaque
    /// handle. Errors are surfaced as `EngineError::Script`.
    async fn compile(
        &self,
        channel_id: uuid::Uuid,
        scope: ScriptScope,
        source: &str,
    ) -> Result<ScriptHandle>;

    /// Evaluate a previously compiled filter script.
    async fn evaluate_filter(&self, handle: ScriptHandle, bindings: &ScriptBindings) -> Result<FilterResult>;

    /// Evaluate a previously compiled transformer script.
    async fn evaluate_transform(&self, handle: ScriptHandle, bindings: &ScriptBindings) -> Result<TransformResult>;

    /// Evaluate a previously compiled response script.
    async fn evaluate_response(&self, handle: ScriptHandle, bindings: &ScriptBindings) -> Result<ResponseResult>;

    /// Release resources held for `handle`, called on channel undeploy.
    async fn release(&self, handle: ScriptHandle) -> Result<()>;
}

/// The always-pass, no-op evaluator: filters never drop, transformers pass the
/// input through unchanged, response scripts always report `SENT`. Used by tests
/// and by channels with no configured scripts.
#[derive(Debug, Default)]
pub struct NoopEvaluator;

#[async_trait]
impl ScriptEvaluator for NoopEvaluator {
    async fn compile(&self, _channel_id: uuid::Uuid, _scope: ScriptScope, _source: &str) -> Result<ScriptHandle> {
        Ok(ScriptHandle(0))
    }

    async fn evaluate_filter(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<FilterResult> {
        Ok(FilterResult { filtered: false })
    }

    async fn evaluate_transform(&self, _handle: ScriptHandle, bindings: &ScriptBindings) -> Result<TransformResult> {
        Ok(TransformResult {
            transformed: bindings.message_text.clone(),
            channel_map_delta: HashMap::new(),
            connector_map_delta: HashMap::new(),
        })
    }

    async fn evaluate_response(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<ResponseResult> {
        Ok(ResponseResult {
            status: crate::connector::ResponseStatus::Sent,
            message: None,
        })
    }

    async fn release(&self, _handle: ScriptHandle) -> Result<()> {
        Ok(())
    }
}

/// An evaluator that always fails, used to exercise `EngineError::Script`
/// propagation in tests without needing a real scripting engine.
#[derive(Debug, Default)]
pub struct FailingEvaluator;

#[async_trait]
impl ScriptEvaluator for FailingEvaluator {
    async fn compile(&self, _channel_id: uuid::Uuid, _scope: ScriptScope, _source: &str) -> Result<ScriptHandle> {
        Ok(ScriptHandle(0))
    }

    async fn evaluate_filter(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<FilterResult> {
        Err(EngineError::Script("simulated script failure".into()))
    }

    async fn evaluate_transform(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<TransformResult> {
        Err(EngineError::Script("simulated script failure".into()))
    }

    async fn evaluate_response(&self, _handle: ScriptHandle, _bindings: &ScriptBindings) -> Result<ResponseResult> {
        Err(EngineError::Script("simulated script failure".into()))
    }

    async fn release(&self, _handle: ScriptHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_evaluator_passes_through() {
        let evaluator = NoopEvaluator;
        let handle = evaluator
            .compile(uuid::Uuid::new_v4(), ScriptScope::SourceFilter, "")
            .await
            .unwrap();
        let bindings = ScriptBindings {
            maps: Maps::default(),
            global_map: Arc::new(DashMap::new()),
            global_channel_map: Arc::new(DashMap::new()),
            configuration_map: Arc::new(HashMap::new()),
            message_text: "hello".to_string(),
        };
        let filter = evaluator.evaluate_filter(handle, &bindings).await.unwrap();
        assert!(!filter.filtered);
        let transform = evaluator.evaluate_transform(handle, &bindings).await.unwrap();
        assert_eq!(transform.transformed, "hello");
    }
}

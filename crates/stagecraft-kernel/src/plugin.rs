//! Plugin contract
//!
//! A plugin is one unit of work bound to exactly one stage. It declares the
//! plugins it depends on, and transforms an input payload into an output
//! payload.

use crate::id::{Capability, PluginId, RunId, Stage, TenantId};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// Data threaded between stages
pub type Payload = serde_json::Value;

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Static description of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique identity
    pub id: PluginId,
    /// Stage this plugin runs in
    pub stage: Stage,
    /// Free-form version string
    #[serde(default = "default_version")]
    pub version: String,
    /// Plugins that must have run (in an earlier stage) before this one
    #[serde(default)]
    pub depends_on: Vec<PluginId>,
    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl PluginManifest {
    /// Create manifest with no dependencies or capabilities
    #[must_use]
    pub fn new(id: PluginId, stage: Stage) -> Self {
        Self {
            id,
            stage,
            version: default_version(),
            depends_on: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    /// With version
    #[inline]
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a dependency
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, id: PluginId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// Add a capability
    #[inline]
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }
}

/// What a plugin knows about the run invoking it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    /// Run being executed
    pub run_id: RunId,
    /// Tenant the run belongs to
    pub tenant: TenantId,
    /// Stage being executed
    pub stage: Stage,
}

/// Unit of work for one stage
///
/// `run` is the only suspension point the orchestrator introduces on behalf
/// of a plugin. Once started, a run is always awaited to completion.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Static description
    fn manifest(&self) -> &PluginManifest;

    /// Transform `input` into the stage output
    async fn run(&self, ctx: &StageContext, input: Payload) -> anyhow::Result<Payload>;

    /// Plugin id
    fn id(&self) -> &PluginId {
        &self.manifest().id
    }

    /// Declared stage
    fn stage(&self) -> &Stage {
        &self.manifest().stage
    }
}

type RunFn =
    Box<dyn Fn(StageContext, Payload) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync>;

/// Plugin built from a manifest and a closure
///
/// This is the `{id, stage, version, depends_on, run}` manifest shape used
/// to bootstrap a registry without defining a type per plugin.
pub struct FnPlugin {
    manifest: PluginManifest,
    run: RunFn,
}

impl FnPlugin {
    /// Wrap an async closure
    pub fn new<F, Fut>(manifest: PluginManifest, f: F) -> Self
    where
        F: Fn(StageContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        Self {
            manifest,
            run: Box::new(move |ctx, input| f(ctx, input).boxed()),
        }
    }

    /// Wrap a synchronous transformation
    pub fn sync<F>(manifest: PluginManifest, f: F) -> Self
    where
        F: Fn(Payload) -> anyhow::Result<Payload> + Send + Sync + 'static,
    {
        Self {
            manifest,
            run: Box::new(move |_ctx, input| futures::future::ready(f(input)).boxed()),
        }
    }
}

impl fmt::Debug for FnPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPlugin")
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Plugin for FnPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn run(&self, ctx: &StageContext, input: Payload) -> anyhow::Result<Payload> {
        (self.run)(ctx.clone(), input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> StageContext {
        StageContext {
            run_id: RunId::new(),
            tenant: TenantId::new("acme").unwrap(),
            stage: Stage::new("ingest").unwrap(),
        }
    }

    #[test]
    fn manifest_deserializes_with_defaults() {
        let manifest: PluginManifest =
            serde_json::from_value(json!({"id": "reader", "stage": "ingest"})).unwrap();
        assert_eq!(manifest.version, "0.1.0");
        assert!(manifest.depends_on.is_empty());
        assert!(manifest.capabilities.is_empty());
    }

    #[test]
    fn manifest_rejects_invalid_stage() {
        let result: Result<PluginManifest, _> =
            serde_json::from_value(json!({"id": "reader", "stage": "no spaces"}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fn_plugin_runs_closure() {
        let manifest = PluginManifest::new(
            PluginId::new("double").unwrap(),
            Stage::new("ingest").unwrap(),
        );
        let plugin = FnPlugin::sync(manifest, |input| {
            let value = input["value"].as_i64().unwrap_or_default();
            Ok(json!({ "value": value * 2 }))
        });

        let out = plugin.run(&ctx(), json!({"value": 21})).await.unwrap();
        assert_eq!(out, json!({"value": 42}));
        assert_eq!(plugin.id().as_str(), "double");
    }

    #[tokio::test]
    async fn fn_plugin_sees_stage_context() {
        let manifest = PluginManifest::new(
            PluginId::new("echo-tenant").unwrap(),
            Stage::new("ingest").unwrap(),
        );
        let plugin = FnPlugin::new(manifest, |ctx, _input| async move {
            Ok(json!({ "tenant": ctx.tenant.as_str() }))
        });

        let out = plugin.run(&ctx(), Payload::Null).await.unwrap();
        assert_eq!(out, json!({"tenant": "acme"}));
    }
}

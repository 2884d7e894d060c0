//! Plugin registry
//!
//! Provides [`Registry`] for holding a plugin set keyed by unique id and
//! indexed by stage. A registry is mutable only while it is being built; once
//! shared behind an `Arc` it is read-only for the rest of its life.

use crate::error::{BootstrapError, RegistryError};
use crate::id::{Capability, PluginId, Stage};
use crate::lease::{Lease, LeaseCounter, Leasable};
use crate::plugin::{Plugin, PluginManifest};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Lease held by a run on a shared registry
pub type RegistryLease = Lease<Registry>;

/// Plugin set with a stage index
#[derive(Default)]
pub struct Registry {
    /// Plugins in registration order
    plugins: IndexMap<PluginId, Arc<dyn Plugin>>,
    /// Stage -> plugin ids, each bucket in registration order
    by_stage: IndexMap<Stage, Vec<PluginId>>,
    leases: LeaseCounter,
}

impl Registry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin
    ///
    /// # Errors
    /// Returns [`RegistryError::DuplicateId`] if the id is taken. The
    /// registry is left unchanged.
    pub fn register<P: Plugin + 'static>(&mut self, plugin: P) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(plugin))
    }

    /// Register an already shared plugin
    ///
    /// # Errors
    /// Returns [`RegistryError::DuplicateId`] if the id is taken.
    pub fn register_arc(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let id = plugin.id().clone();
        if self.plugins.contains_key(&id) {
            tracing::debug!(plugin = %id, "rejecting duplicate plugin id");
            return Err(RegistryError::DuplicateId(id));
        }

        let stage = plugin.stage().clone();
        tracing::debug!(plugin = %id, stage = %stage, "plugin registered");
        self.by_stage.entry(stage).or_default().push(id.clone());
        self.plugins.insert(id, plugin);
        Ok(())
    }

    /// Register a batch in order
    ///
    /// Stops at the first failure. Plugins registered before it stay in
    /// the registry; there is no rollback, so a failed bootstrap means the
    /// registry must be thrown away and rebuilt.
    ///
    /// # Errors
    /// Returns [`BootstrapError`] describing how far the batch got.
    pub fn bootstrap<I>(&mut self, plugins: I) -> Result<usize, BootstrapError>
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        let mut registered = 0;
        for (index, plugin) in plugins.into_iter().enumerate() {
            if let Err(source) = self.register_arc(plugin) {
                tracing::warn!(
                    registered,
                    failed_at = index,
                    error = %source,
                    "bootstrap aborted, registry is partially built"
                );
                return Err(BootstrapError {
                    registered,
                    failed_at: index,
                    source,
                });
            }
            registered += 1;
        }
        tracing::info!(registered, stages = self.by_stage.len(), "registry bootstrapped");
        Ok(registered)
    }

    /// Build a registry from a batch
    ///
    /// # Errors
    /// See [`Registry::bootstrap`]. The partial registry is dropped.
    pub fn from_plugins<I>(plugins: I) -> Result<Self, BootstrapError>
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        let mut registry = Self::new();
        registry.bootstrap(plugins)?;
        Ok(registry)
    }

    /// Look up a plugin by id
    ///
    /// Absence is a normal outcome when probing optional stages.
    #[inline]
    #[must_use]
    pub fn get(&self, id: &PluginId) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(id)
    }

    /// Check if id is registered
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &PluginId) -> bool {
        self.plugins.contains_key(id)
    }

    /// Plugins for a stage, in registration order
    #[must_use]
    pub fn by_stage(&self, stage: &Stage) -> Vec<&Arc<dyn Plugin>> {
        self.by_stage
            .get(stage)
            .map(|ids| ids.iter().filter_map(|id| self.plugins.get(id)).collect())
            .unwrap_or_default()
    }

    /// Plugins advertising a capability, in registration order
    #[must_use]
    pub fn by_capability(&self, capability: &Capability) -> Vec<&Arc<dyn Plugin>> {
        self.plugins
            .values()
            .filter(|p| p.manifest().capabilities.contains(capability))
            .collect()
    }

    /// Stage of a registered plugin
    #[inline]
    #[must_use]
    pub fn stage_of(&self, id: &PluginId) -> Option<&Stage> {
        self.plugins.get(id).map(|p| p.stage())
    }

    /// Stages with at least one plugin, in first-registration order
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.by_stage.keys()
    }

    /// Check if any plugin is registered for `stage`
    #[inline]
    #[must_use]
    pub fn has_stage(&self, stage: &Stage) -> bool {
        self.by_stage.contains_key(stage)
    }

    /// Manifests in registration order
    pub fn manifests(&self) -> impl Iterator<Item = &PluginManifest> {
        self.plugins.values().map(|p| p.manifest())
    }

    /// Number of plugins
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Lease this registry for a run
    #[must_use]
    pub fn lease(self: &Arc<Self>) -> RegistryLease {
        Lease::acquire(Arc::clone(self))
    }

    /// Runs currently holding a lease
    #[inline]
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.leases.active()
    }
}

impl Leasable for Registry {
    fn lease_counter(&self) -> &LeaseCounter {
        &self.leases
    }

    fn resource_name(&self) -> &'static str {
        "registry"
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("stages", &self.by_stage.keys().collect::<Vec<_>>())
            .field("active_leases", &self.leases.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::FnPlugin;

    fn plugin(id: &str, stage: &str) -> FnPlugin {
        let manifest = PluginManifest::new(PluginId::new(id).unwrap(), Stage::new(stage).unwrap());
        FnPlugin::sync(manifest, Ok)
    }

    fn pid(id: &str) -> PluginId {
        PluginId::new(id).unwrap()
    }

    fn stage(name: &str) -> Stage {
        Stage::new(name).unwrap()
    }

    #[test]
    fn registry_new_empty() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.by_stage(&stage("ingest")).is_empty());
    }

    #[test]
    fn registry_indexes_by_stage_in_order() {
        let mut registry = Registry::new();
        registry.register(plugin("b", "ingest")).unwrap();
        registry.register(plugin("x", "analyze")).unwrap();
        registry.register(plugin("a", "ingest")).unwrap();

        let ids: Vec<&str> = registry
            .by_stage(&stage("ingest"))
            .iter()
            .map(|p| p.id().as_str())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(registry.stage_of(&pid("x")), Some(&stage("analyze")));
    }

    #[test]
    fn registry_rejects_duplicate_and_keeps_state() {
        let mut registry = Registry::new();
        registry.register(plugin("a", "ingest")).unwrap();

        let err = registry.register(plugin("a", "analyze")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId(pid("a")));
        assert_eq!(registry.len(), 1);
        assert!(!registry.has_stage(&stage("analyze")));
        assert_eq!(registry.by_stage(&stage("ingest")).len(), 1);
    }

    #[test]
    fn registry_get_missing_is_none() {
        let registry = Registry::new();
        assert!(registry.get(&pid("ghost")).is_none());
        assert!(!registry.contains(&pid("ghost")));
    }

    #[test]
    fn bootstrap_reports_partial_progress() {
        let mut registry = Registry::new();
        let batch: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(plugin("a", "ingest")),
            Arc::new(plugin("b", "analyze")),
            Arc::new(plugin("a", "resolve")),
            Arc::new(plugin("c", "resolve")),
        ];

        let err = registry.bootstrap(batch).unwrap_err();
        assert_eq!(err.registered, 2);
        assert_eq!(err.failed_at, 2);
        assert_eq!(err.source, RegistryError::DuplicateId(pid("a")));

        // partially built, nothing after the failure went in
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(&pid("c")));
    }

    #[test]
    fn capability_lookup() {
        let mut registry = Registry::new();
        let manifest = PluginManifest::new(pid("scanner"), stage("analyze"))
            .with_capability(Capability::new("pii").unwrap());
        registry.register(FnPlugin::sync(manifest, Ok)).unwrap();
        registry.register(plugin("plain", "analyze")).unwrap();

        let found = registry.by_capability(&Capability::new("pii").unwrap());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), &pid("scanner"));
    }

    #[test]
    fn leases_are_counted() {
        let registry = Arc::new(Registry::new());
        let lease = registry.lease();
        assert_eq!(registry.active_leases(), 1);
        drop(lease);
        assert_eq!(registry.active_leases(), 0);
    }
}

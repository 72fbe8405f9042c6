//! Dependency Resolver
//!
//! Decides whether a change may enter the log, and re-checks it when the
//! applier reaches it. Submission checks run against the *projected* state:
//! the module store with every queued change replayed on top, so a feature
//! enabled earlier in the queue satisfies a later dependent.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::ValidationError;
use crate::graph::{topological_order, FeatureGraph};
use crate::schedule::{ChangeKind, ChangeLog};
use crate::schema::{FeatureRef, Module, ModuleSet};

/// View into the data-tree storage engine
pub trait DataProbe: Send + Sync {
    /// Whether live configuration data still depends on `module`
    fn has_enabled_dependents_data(&self, module: &str) -> bool;
}

/// Probe for a datastore without configuration content
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLiveData;

impl DataProbe for NoLiveData {
    fn has_enabled_dependents_data(&self, _module: &str) -> bool {
        false
    }
}

/// Validates scheduled changes against the feature dependency graph
#[derive(Clone)]
pub struct DependencyResolver {
    probe: Arc<dyn DataProbe>,
}

impl DependencyResolver {
    pub fn new(probe: Arc<dyn DataProbe>) -> Self {
        Self { probe }
    }

    /// The store as it will look once every queued change has applied
    ///
    /// Entries that no longer fit (the store moved underneath them) are
    /// skipped here; the applier will report them.
    pub fn project(&self, base: &ModuleSet, log: &ChangeLog) -> ModuleSet {
        let mut state = base.clone();
        for entry in log.entries() {
            let mut next = state.clone();
            if self.apply(&mut next, &entry.kind).is_ok() {
                state = next;
            }
        }
        state
    }

    /// Submission-time check of `kind` against store plus queued changes
    pub fn check_submission(
        &self,
        base: &ModuleSet,
        log: &ChangeLog,
        kind: &ChangeKind,
        available_imports: &BTreeSet<String>,
    ) -> Result<(), ValidationError> {
        let projected = self.project(base, log);
        self.validate(&projected, kind, available_imports)
    }

    /// Check `kind` against `state`
    ///
    /// `available_imports` names modules that count as present for import
    /// resolution without being in `state` yet.
    pub fn validate(
        &self,
        state: &ModuleSet,
        kind: &ChangeKind,
        available_imports: &BTreeSet<String>,
    ) -> Result<(), ValidationError> {
        match kind {
            ChangeKind::InstallModule { module, enable_features } => {
                self.validate_install(state, module, enable_features, available_imports)
            }
            ChangeKind::RemoveModule { module } => self.validate_remove(state, module),
            ChangeKind::EnableFeature { feature } => {
                let target = state.resolve_feature(feature)?;
                ensure_acyclic(&FeatureGraph::from_modules(state))?;
                match target.prerequisites.iter().find(|p| !state.is_enabled(p)) {
                    Some(missing) => Err(ValidationError::UnmetDependency {
                        feature: feature.clone(),
                        missing: missing.clone(),
                    }),
                    None => Ok(()),
                }
            }
            ChangeKind::DisableFeature { feature } => {
                state.resolve_feature(feature)?;
                match state.enabled_dependents(feature).into_iter().next() {
                    Some(dependent) => Err(ValidationError::WouldBreakDependent {
                        feature: feature.clone(),
                        dependent,
                    }),
                    None => Ok(()),
                }
            }
        }
    }

    /// Mutate `state` as `kind` describes; assumes [`validate`](Self::validate) passed
    pub fn apply(&self, state: &mut ModuleSet, kind: &ChangeKind) -> Result<(), ValidationError> {
        match kind {
            ChangeKind::InstallModule { module, enable_features } => {
                let order = install_order(module, enable_features)?;
                let mut fresh = module.clone();
                for feature in &mut fresh.features {
                    feature.enabled = false;
                }
                state.put(fresh);
                for feature in order {
                    state.set_enabled(&feature, true)?;
                }
                Ok(())
            }
            ChangeKind::RemoveModule { module } => state.remove(module).map(|_| ()),
            ChangeKind::EnableFeature { feature } => state.set_enabled(feature, true).map(|_| ()),
            ChangeKind::DisableFeature { feature } => state.set_enabled(feature, false).map(|_| ()),
        }
    }

    fn validate_install(
        &self,
        state: &ModuleSet,
        module: &Module,
        enable_features: &[String],
        available_imports: &BTreeSet<String>,
    ) -> Result<(), ValidationError> {
        if state.contains(&module.name) {
            return Err(ValidationError::DuplicateModule {
                module: module.name.clone(),
            });
        }

        if let Some(import) = module
            .imports
            .iter()
            .find(|i| !state.contains(&i.module) && !available_imports.contains(&i.module))
        {
            return Err(ValidationError::MissingImport {
                module: module.name.clone(),
                import: import.module.clone(),
            });
        }

        let mut graph = FeatureGraph::from_modules(state);
        for feature in &module.features {
            graph.add_feature(module.feature_ref(&feature.name));
        }
        graph.extend(module.edges());
        ensure_acyclic(&graph)?;

        let listed: HashSet<&str> = enable_features.iter().map(String::as_str).collect();
        for name in enable_features {
            let feature = module
                .feature(name)
                .ok_or_else(|| ValidationError::FeatureNotFound {
                    feature: module.feature_ref(name),
                })?;
            let missing = feature.prerequisites.iter().find(|p| {
                if p.module == module.name {
                    !listed.contains(p.feature.as_str())
                } else {
                    !state.is_enabled(p)
                }
            });
            if let Some(missing) = missing {
                return Err(ValidationError::UnmetDependency {
                    feature: module.feature_ref(name),
                    missing: missing.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_remove(&self, state: &ModuleSet, module: &str) -> Result<(), ValidationError> {
        if !state.contains(module) {
            return Err(ValidationError::ModuleNotFound {
                module: module.to_string(),
            });
        }
        if let Some(edge) = state.enabled_dependent_of_module(module) {
            return Err(ValidationError::InUse {
                module: module.to_string(),
                by: format!("enabled feature {}", edge.dependent),
            });
        }
        if self.probe.has_enabled_dependents_data(module) {
            return Err(ValidationError::InUse {
                module: module.to_string(),
                by: "live configuration data".to_string(),
            });
        }
        Ok(())
    }
}

/// Order in which an install enables its listed features, prerequisites first
pub fn install_order(
    module: &Module,
    enable_features: &[String],
) -> Result<Vec<FeatureRef>, ValidationError> {
    let listed: HashSet<&str> = enable_features.iter().map(String::as_str).collect();
    let mut graph = FeatureGraph::new();
    for name in enable_features {
        if module.feature(name).is_none() {
            return Err(ValidationError::FeatureNotFound {
                feature: module.feature_ref(name),
            });
        }
        graph.add_feature(module.feature_ref(name));
    }
    graph.extend(module.edges().into_iter().filter(|e| {
        e.prerequisite.module == module.name
            && listed.contains(e.prerequisite.feature.as_str())
            && listed.contains(e.dependent.feature.as_str())
    }));
    topological_order(&graph).map_err(|edge| ValidationError::DependencyCycle { edge })
}

/// Reject a graph without a topological order, naming one cycle edge
fn ensure_acyclic(graph: &FeatureGraph) -> Result<(), ValidationError> {
    topological_order(graph)
        .map(|_| ())
        .map_err(|edge| ValidationError::DependencyCycle { edge })
}

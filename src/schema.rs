//! Module metadata types
//!
//! A [`ModuleSet`] is one immutable-by-convention snapshot of the installed
//! modules. The applier clones it, mutates the clone and swaps it in whole.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::ValidationError;
use crate::revision::Revision;

/// Fully qualified feature name (`module:feature`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    pub module: String,
    pub feature: String,
}

impl FeatureRef {
    pub fn new(module: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            feature: feature.into(),
        }
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.feature)
    }
}

/// Directed dependency between two features
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The feature that requires `prerequisite`
    pub dependent: FeatureRef,
    pub prerequisite: FeatureRef,
}

impl fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.dependent, self.prerequisite)
    }
}

/// A feature declared by a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// Features that must be enabled before this one, in declaration order
    #[serde(default)]
    pub prerequisites: Vec<FeatureRef>,
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
            prerequisites: Vec::new(),
        }
    }

    pub fn requires(mut self, prerequisite: FeatureRef) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }
}

/// An `import` statement of a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
}

/// An installed (or to-be-installed) schema module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    /// Schema file the module was loaded from
    pub source: PathBuf,
    #[serde(default)]
    pub imports: Vec<Import>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl Module {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            revision: None,
            source: source.into(),
            imports: Vec::new(),
            features: Vec::new(),
        }
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn with_import(mut self, module: impl Into<String>) -> Self {
        self.imports.push(Import {
            module: module.into(),
            revision: None,
        });
        self
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn feature_mut(&mut self, name: &str) -> Option<&mut Feature> {
        self.features.iter_mut().find(|f| f.name == name)
    }

    pub fn feature_ref(&self, name: &str) -> FeatureRef {
        FeatureRef::new(&self.name, name)
    }

    pub fn enabled_features(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter().filter(|f| f.enabled)
    }

    /// All dependency edges declared by this module's features
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.features
            .iter()
            .flat_map(|f| {
                f.prerequisites.iter().map(move |p| DependencyEdge {
                    dependent: FeatureRef::new(&self.name, &f.name),
                    prerequisite: p.clone(),
                })
            })
            .collect()
    }

    /// Display name including the revision (`name@2019-01-01`)
    pub fn display_name(&self) -> String {
        match &self.revision {
            Some(rev) => rev.file_stem(&self.name),
            None => self.name.clone(),
        }
    }
}

/// Snapshot of the module metadata store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSet {
    /// Sequence number of the last scheduled change reflected here
    #[serde(default)]
    pub last_applied_seq: u64,
    #[serde(default)]
    modules: BTreeMap<String, Module>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Insert or replace a module
    pub fn put(&mut self, module: Module) -> Option<Module> {
        self.modules.insert(module.name.clone(), module)
    }

    /// Remove a module unless an enabled feature of another module depends on it
    pub fn remove(&mut self, name: &str) -> Result<Module, ValidationError> {
        if !self.contains(name) {
            return Err(ValidationError::ModuleNotFound {
                module: name.to_string(),
            });
        }
        if let Some(edge) = self.enabled_dependent_of_module(name) {
            return Err(ValidationError::InUse {
                module: name.to_string(),
                by: format!("enabled feature {}", edge.dependent),
            });
        }
        self.modules
            .remove(name)
            .ok_or_else(|| ValidationError::ModuleNotFound {
                module: name.to_string(),
            })
    }

    pub fn feature(&self, feature: &FeatureRef) -> Option<&Feature> {
        self.get(&feature.module)?.feature(&feature.feature)
    }

    /// Look up a feature, distinguishing a missing module from a missing feature
    pub fn resolve_feature(&self, feature: &FeatureRef) -> Result<&Feature, ValidationError> {
        let module = self
            .get(&feature.module)
            .ok_or_else(|| ValidationError::ModuleNotFound {
                module: feature.module.clone(),
            })?;
        module
            .feature(&feature.feature)
            .ok_or_else(|| ValidationError::FeatureNotFound {
                feature: feature.clone(),
            })
    }

    pub fn is_enabled(&self, feature: &FeatureRef) -> bool {
        self.feature(feature).map(|f| f.enabled).unwrap_or(false)
    }

    /// Flip a feature's state, returning whether anything changed
    pub fn set_enabled(
        &mut self,
        feature: &FeatureRef,
        enabled: bool,
    ) -> Result<bool, ValidationError> {
        let module = self
            .modules
            .get_mut(&feature.module)
            .ok_or_else(|| ValidationError::ModuleNotFound {
                module: feature.module.clone(),
            })?;
        let target = module
            .feature_mut(&feature.feature)
            .ok_or_else(|| ValidationError::FeatureNotFound {
                feature: feature.clone(),
            })?;
        let changed = target.enabled != enabled;
        target.enabled = enabled;
        Ok(changed)
    }

    /// Every dependency edge declared by the installed modules
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.modules.values().flat_map(Module::edges).collect()
    }

    /// Enabled features that list `feature` as a prerequisite
    pub fn enabled_dependents(&self, feature: &FeatureRef) -> Vec<FeatureRef> {
        self.modules
            .values()
            .flat_map(|m| {
                m.enabled_features()
                    .filter(move |f| f.prerequisites.contains(feature))
                    .map(move |f| m.feature_ref(&f.name))
            })
            .filter(|dependent| dependent != feature)
            .collect()
    }

    /// First edge from an enabled feature of another module into `name`
    pub fn enabled_dependent_of_module(&self, name: &str) -> Option<DependencyEdge> {
        self.modules
            .values()
            .filter(|m| m.name != name)
            .flat_map(|m| {
                m.enabled_features().flat_map(move |f| {
                    f.prerequisites
                        .iter()
                        .filter(move |p| p.module == name)
                        .map(move |p| DependencyEdge {
                            dependent: m.feature_ref(&f.name),
                            prerequisite: p.clone(),
                        })
                })
            })
            .next()
    }
}

impl FromIterator<Module> for ModuleSet {
    fn from_iter<I: IntoIterator<Item = Module>>(iter: I) -> Self {
        let mut set = ModuleSet::new();
        for module in iter {
            set.put(module);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleSet {
        let base = Module::new("base", "base.yang").with_feature(Feature::new("featx"));
        let dependent = Module::new("dependent", "dependent.yang")
            .with_import("base")
            .with_feature(Feature::new("feat1").requires(FeatureRef::new("base", "featx")));
        [base, dependent].into_iter().collect()
    }

    #[test]
    fn test_edges_collected_across_modules() {
        let set = sample();
        let edges = set.edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to_string(), "dependent:feat1 -> base:featx");
    }

    #[test]
    fn test_set_enabled_reports_change() {
        let mut set = sample();
        let featx = FeatureRef::new("base", "featx");
        assert!(set.set_enabled(&featx, true).unwrap());
        assert!(!set.set_enabled(&featx, true).unwrap());
        assert!(set.is_enabled(&featx));

        let err = set.set_enabled(&FeatureRef::new("base", "nope"), true).unwrap_err();
        assert!(matches!(err, ValidationError::FeatureNotFound { .. }));
    }

    #[test]
    fn test_remove_blocked_only_by_enabled_dependents() {
        let mut set = sample();
        // disabled dependents do not hold the module
        let mut copy = set.clone();
        assert!(copy.remove("base").is_ok());

        set.set_enabled(&FeatureRef::new("base", "featx"), true).unwrap();
        set.set_enabled(&FeatureRef::new("dependent", "feat1"), true).unwrap();
        let err = set.remove("base").unwrap_err();
        assert!(matches!(err, ValidationError::InUse { ref module, .. } if module == "base"));

        assert!(set.remove("dependent").is_ok());
        assert!(set.remove("base").is_ok());
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_missing_module() {
        let mut set = ModuleSet::new();
        assert_eq!(
            set.remove("ghost").unwrap_err(),
            ValidationError::ModuleNotFound { module: "ghost".into() }
        );
    }

    #[test]
    fn test_enabled_dependents() {
        let mut set = sample();
        let featx = FeatureRef::new("base", "featx");
        assert!(set.enabled_dependents(&featx).is_empty());
        set.set_enabled(&featx, true).unwrap();
        set.set_enabled(&FeatureRef::new("dependent", "feat1"), true).unwrap();
        assert_eq!(set.enabled_dependents(&featx), vec![FeatureRef::new("dependent", "feat1")]);
    }
}

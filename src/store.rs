//! Module Metadata Store
//!
//! Persists the live [`ModuleSet`] as `modules.json`. The applier is the only
//! writer: it builds a complete new snapshot and [`ModuleStore::swap`]s it in,
//! so readers observe either the pre-apply or the post-apply state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::error::Result;
use crate::persist;
use crate::schema::{Module, ModuleSet};

#[derive(Serialize, Deserialize)]
struct StoreFile {
    modules: ModuleSet,
    checksum: Checksum,
}

/// Durable home of the module metadata snapshot
#[derive(Debug, Clone)]
pub struct ModuleStore {
    path: PathBuf,
}

impl ModuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot; empty before the first apply
    pub fn load(&self) -> Result<ModuleSet> {
        match persist::read_json::<StoreFile>(&self.path)? {
            Some(file) => {
                file.checksum.verify(&file.modules, &self.path)?;
                Ok(file.modules)
            }
            None => Ok(ModuleSet::new()),
        }
    }

    /// Look up one module in the current snapshot
    pub fn get(&self, name: &str) -> Result<Option<Module>> {
        Ok(self.load()?.get(name).cloned())
    }

    /// Replace the snapshot in one atomic step
    pub fn swap(&self, modules: &ModuleSet) -> Result<()> {
        let file = StoreFile {
            checksum: Checksum::of(modules)?,
            modules: modules.clone(),
        };
        persist::write_json(&self.path, &file)
    }
}

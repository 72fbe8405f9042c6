//! Scheduled Change Log
//!
//! Ordered, persisted queue of structural changes waiting for the next
//! exclusive connect. Entries are immutable once appended and leave the log
//! only when the applier has reflected them in the module store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::error::{Result, ValidationError};
use crate::persist;
use crate::registry::ConnectionId;
use crate::resolver::DependencyResolver;
use crate::schema::{FeatureRef, Module, ModuleSet};

/// What a scheduled change does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Install a parsed module, enabling the listed features on the way in
    InstallModule {
        module: Module,
        #[serde(default)]
        enable_features: Vec<String>,
    },
    RemoveModule {
        module: String,
    },
    EnableFeature {
        feature: FeatureRef,
    },
    DisableFeature {
        feature: FeatureRef,
    },
}

impl ChangeKind {
    /// Name of the module this change touches
    pub fn target_module(&self) -> &str {
        match self {
            ChangeKind::InstallModule { module, .. } => &module.name,
            ChangeKind::RemoveModule { module } => module,
            ChangeKind::EnableFeature { feature } | ChangeKind::DisableFeature { feature } => {
                &feature.module
            }
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::InstallModule { module, enable_features } if enable_features.is_empty() => {
                write!(f, "install {}", module.display_name())
            }
            ChangeKind::InstallModule { module, enable_features } => write!(
                f,
                "install {} with features [{}]",
                module.display_name(),
                enable_features.join(", ")
            ),
            ChangeKind::RemoveModule { module } => write!(f, "remove {}", module),
            ChangeKind::EnableFeature { feature } => write!(f, "enable {}", feature),
            ChangeKind::DisableFeature { feature } => write!(f, "disable {}", feature),
        }
    }
}

/// One recorded entry of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledChange {
    /// Submission order, strictly increasing
    pub seq: u64,
    pub kind: ChangeKind,
    /// Connection that submitted the change, for diagnostics
    pub origin: ConnectionId,
    pub scheduled_at: DateTime<Utc>,
}

impl fmt::Display for ScheduledChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} (from connection {})", self.seq, self.kind, self.origin)
    }
}

/// In-memory view of the scheduled change log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    entries: Vec<ScheduledChange>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `kind` against the store plus everything already queued and
    /// record it, returning its sequence number
    ///
    /// A rejected change leaves the log untouched.
    pub fn append(
        &mut self,
        kind: ChangeKind,
        origin: ConnectionId,
        base: &ModuleSet,
        resolver: &DependencyResolver,
        available_imports: &BTreeSet<String>,
    ) -> std::result::Result<u64, ValidationError> {
        resolver.check_submission(base, self, &kind, available_imports)?;

        // never reuse a sequence number the store already reflects
        let seq = self.next_seq.max(base.last_applied_seq + 1).max(1);
        self.next_seq = seq + 1;
        self.entries.push(ScheduledChange {
            seq,
            kind,
            origin,
            scheduled_at: Utc::now(),
        });
        Ok(seq)
    }

    /// Pending entries in submission order
    ///
    /// Entries stay in the log; the applier removes exactly what it applied
    /// through [`ChangeLog::remove_through`].
    pub fn drain(&self) -> Vec<ScheduledChange> {
        self.entries.clone()
    }

    /// Drop every entry with `seq <= last`, returning how many were removed
    pub fn remove_through(&mut self, last: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.seq > last);
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[ScheduledChange] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Serialize, Deserialize)]
struct LogFile {
    log: ChangeLog,
    checksum: Checksum,
}

/// Durable home of the change log (`scheduled.json`)
#[derive(Debug, Clone)]
pub struct LogStore {
    path: PathBuf,
}

impl LogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ChangeLog> {
        match persist::read_json::<LogFile>(&self.path)? {
            Some(file) => {
                file.checksum.verify(&file.log, &self.path)?;
                Ok(file.log)
            }
            None => Ok(ChangeLog::new()),
        }
    }

    pub fn save(&self, log: &ChangeLog) -> Result<()> {
        let file = LogFile {
            checksum: Checksum::of(log)?,
            log: log.clone(),
        };
        persist::write_json(&self.path, &file)
    }
}

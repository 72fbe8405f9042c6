//! Change Applier
//!
//! Drains the scheduled change log into the module store. Runs only inside
//! the repository lock on a zero-to-one connection transition, so it never
//! races another applier or a live reader of the schema.
//!
//! ```text
//! Idle -> Running -> Committed
//!                 \-> Failed
//! ```
//!
//! All changes that apply in one run are swapped into the store at once.
//! The first change that no longer validates stops the run; it and every
//! later entry stay in the log for the next opportunity.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, warn};

use crate::error::{Result, SchedError, ValidationError};
use crate::resolver::DependencyResolver;
use crate::schedule::{ChangeKind, LogStore, ScheduledChange};
use crate::schema::ModuleSet;
use crate::store::ModuleStore;

/// Result of one applier run, reported to the connect that triggered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Success {
        applied: usize,
    },
    Failed {
        change: ScheduledChange,
        reason: ValidationError,
        /// Entries applied before the failing one
        applied: usize,
    },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Success { .. })
    }

    pub fn applied(&self) -> usize {
        match self {
            ApplyOutcome::Success { applied } | ApplyOutcome::Failed { applied, .. } => *applied,
        }
    }

    /// Turn a failed outcome into [`SchedError::ApplyFailure`]
    pub fn into_result(self) -> Result<usize> {
        match self {
            ApplyOutcome::Success { applied } => Ok(applied),
            ApplyOutcome::Failed { change, reason, .. } => Err(SchedError::ApplyFailure {
                change: Box::new(change),
                reason,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    Idle,
    Running,
    Committed,
    Failed,
}

/// Applies scheduled changes; callers must hold the repository lock
pub struct ChangeApplier<'a> {
    store: &'a ModuleStore,
    log: &'a LogStore,
    resolver: &'a DependencyResolver,
    state: ApplierState,
}

impl<'a> ChangeApplier<'a> {
    pub fn new(
        store: &'a ModuleStore,
        log: &'a LogStore,
        resolver: &'a DependencyResolver,
    ) -> Self {
        Self {
            store,
            log,
            resolver,
            state: ApplierState::Idle,
        }
    }

    pub fn state(&self) -> ApplierState {
        self.state
    }

    pub fn run(&mut self) -> Result<ApplyOutcome> {
        self.state = ApplierState::Running;
        let current = self.store.load()?;
        let mut log = self.log.load()?;

        // left over from a run that swapped the store but died before trimming the log
        let stale = log.remove_through(current.last_applied_seq);
        if stale > 0 {
            warn!(
                stale,
                last_applied = current.last_applied_seq,
                "discarding already applied log entries"
            );
        }

        let entries = log.drain();
        if entries.is_empty() {
            if stale > 0 {
                self.log.save(&log)?;
            }
            self.state = ApplierState::Committed;
            return Ok(ApplyOutcome::Success { applied: 0 });
        }

        info!(pending = entries.len(), "applying scheduled changes");
        let superseded = superseded_entries(&entries);
        let mut working = current.clone();
        let mut applied = 0;
        let mut failure = None;

        for (i, change) in entries.iter().enumerate() {
            if superseded.contains(&change.seq) {
                debug!(seq = change.seq, change = %change.kind, "skipping superseded change");
            } else {
                let later = later_installs(&entries[i + 1..], &superseded);
                match self.apply_one(&working, change, &later) {
                    Ok(next) => {
                        working = next;
                        debug!(seq = change.seq, change = %change.kind, "applied scheduled change");
                    }
                    Err(reason) => {
                        failure = Some((change.clone(), reason));
                        break;
                    }
                }
            }
            working.last_applied_seq = change.seq;
            applied += 1;
        }

        if applied > 0 {
            self.store.swap(&working)?;
            log.remove_through(working.last_applied_seq);
            self.log.save(&log)?;
        } else if stale > 0 {
            self.log.save(&log)?;
        }

        match failure {
            None => {
                self.state = ApplierState::Committed;
                info!(applied, "scheduled changes applied");
                Ok(ApplyOutcome::Success { applied })
            }
            Some((change, reason)) => {
                self.state = ApplierState::Failed;
                warn!(
                    seq = change.seq,
                    change = %change.kind,
                    reason = %reason,
                    applied,
                    remaining = log.len(),
                    "scheduled change failed to apply"
                );
                Ok(ApplyOutcome::Failed {
                    change,
                    reason,
                    applied,
                })
            }
        }
    }

    /// Re-validate against the current working snapshot, then apply to a copy
    fn apply_one(
        &self,
        working: &ModuleSet,
        change: &ScheduledChange,
        later_installs: &BTreeSet<String>,
    ) -> std::result::Result<ModuleSet, ValidationError> {
        self.resolver.validate(working, &change.kind, later_installs)?;
        let mut next = working.clone();
        self.resolver.apply(&mut next, &change.kind)?;
        Ok(next)
    }
}

/// Sequence numbers of install/remove pairs that cancel out
///
/// `InstallModule(M)` followed by `RemoveModule(M)` leaves nothing behind,
/// so both entries, and feature changes on `M` between them, are consumed
/// without touching the store. A pair only collapses when no other entry
/// between them can rely on `M` being installed; otherwise the entries
/// apply one by one, exactly as they were validated.
fn superseded_entries(entries: &[ScheduledChange]) -> HashSet<u64> {
    let mut superseded = HashSet::new();
    for (i, entry) in entries.iter().enumerate() {
        let ChangeKind::InstallModule { module, .. } = &entry.kind else {
            continue;
        };
        let rest = &entries[i + 1..];
        let Some(end) = rest.iter().position(|e| {
            e.kind.target_module() == module.name
                && matches!(
                    e.kind,
                    ChangeKind::RemoveModule { .. } | ChangeKind::InstallModule { .. }
                )
        }) else {
            continue;
        };
        if !matches!(rest[end].kind, ChangeKind::RemoveModule { .. }) {
            continue;
        }
        let between = &rest[..end];
        if between
            .iter()
            .any(|e| e.kind.target_module() != module.name && may_need(&e.kind, &module.name))
        {
            continue;
        }
        superseded.insert(entry.seq);
        for e in &rest[..=end] {
            if e.kind.target_module() == module.name {
                superseded.insert(e.seq);
            }
        }
    }
    superseded
}

/// Whether `kind`, touching another module, may depend on `name` existing
fn may_need(kind: &ChangeKind, name: &str) -> bool {
    match kind {
        ChangeKind::InstallModule { module, .. } => {
            module.imports.iter().any(|i| i.module == name)
                || module.edges().iter().any(|e| e.prerequisite.module == name)
        }
        // prerequisites of the target are not visible from the entry alone
        ChangeKind::EnableFeature { .. } => true,
        ChangeKind::RemoveModule { .. } | ChangeKind::DisableFeature { .. } => false,
    }
}

fn later_installs(rest: &[ScheduledChange], superseded: &HashSet<u64>) -> BTreeSet<String> {
    rest.iter()
        .filter(|e| !superseded.contains(&e.seq))
        .filter_map(|e| match &e.kind {
            ChangeKind::InstallModule { module, .. } => Some(module.name.clone()),
            _ => None,
        })
        .collect()
}

//! Datastore handle and client connections
//!
//! A [`Datastore`] points at one repository directory. Every mutation of the
//! shared state (registry, log, store) happens under the repository lock:
//!
//! - `connect` prunes dead connections, runs the applier when the count goes
//!   from zero to one, then records the new connection
//! - `install_module` / `remove_module` / `enable_feature` /
//!   `disable_feature` validate and append to the log, nothing more
//! - `disconnect` removes the connection record

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::applier::{ApplyOutcome, ChangeApplier};
use crate::config::SchedulerConfig;
use crate::error::{DisconnectError, Result, SchedError};
use crate::lock::{process_alive, RepositoryLock};
use crate::parser::{locate_module, SchemaParser, YangParser};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::resolver::{DataProbe, DependencyResolver, NoLiveData};
use crate::schedule::{ChangeKind, LogStore, ScheduledChange};
use crate::schema::{FeatureRef, ModuleSet};
use crate::store::ModuleStore;

const LOCK_FILE: &str = "repository.lock";
const MODULES_FILE: &str = "modules.json";
const SCHEDULED_FILE: &str = "scheduled.json";
const CONNECTIONS_FILE: &str = "connections.json";

/// Options for [`Datastore::connect`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Fail the connect, and leave no connection behind, when the applier
    /// run it triggers fails
    pub err_on_scheduled_fail: bool,
}

impl ConnectOptions {
    pub fn err_on_scheduled_fail() -> Self {
        Self {
            err_on_scheduled_fail: true,
        }
    }
}

/// Builder for a [`Datastore`] with custom collaborators
pub struct DatastoreBuilder {
    config: SchedulerConfig,
    parser: Arc<dyn SchemaParser>,
    probe: Arc<dyn DataProbe>,
}

impl DatastoreBuilder {
    pub fn parser(mut self, parser: Arc<dyn SchemaParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn DataProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn open(self) -> Result<Datastore> {
        let root = self.config.repository_path();
        fs::create_dir_all(&root)?;

        let inner = Inner {
            lock: RepositoryLock::new(root.join(LOCK_FILE), self.config.lock.clone()),
            registry: ConnectionRegistry::new(root.join(CONNECTIONS_FILE)),
            store: ModuleStore::new(root.join(MODULES_FILE)),
            log: LogStore::new(root.join(SCHEDULED_FILE)),
            resolver: DependencyResolver::new(self.probe),
            parser: self.parser,
            config: self.config,
            root,
        };
        Ok(Datastore { inner: Arc::new(inner) })
    }
}

struct Inner {
    config: SchedulerConfig,
    root: PathBuf,
    lock: RepositoryLock,
    registry: ConnectionRegistry,
    store: ModuleStore,
    log: LogStore,
    resolver: DependencyResolver,
    parser: Arc<dyn SchemaParser>,
}

/// Handle on one scheduler repository
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<Inner>,
}

impl Datastore {
    pub fn builder(config: SchedulerConfig) -> DatastoreBuilder {
        DatastoreBuilder {
            config,
            parser: Arc::new(YangParser::new()),
            probe: Arc::new(NoLiveData),
        }
    }

    /// Open with the default YANG parser and no live data probe
    pub fn open(config: SchedulerConfig) -> Result<Self> {
        Self::builder(config).open()
    }

    /// Open the repository at `path` with default settings
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(SchedulerConfig::for_repository(path))
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Connect options taken from the configuration defaults
    pub fn default_connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            err_on_scheduled_fail: self.inner.config.connect.err_on_scheduled_fail,
        }
    }

    /// Open a connection, applying scheduled changes if none was open
    pub fn connect(&self, options: ConnectOptions) -> Result<Connection> {
        let (id, outcome) = self.inner.connect(options)?;
        Ok(Connection {
            id,
            inner: Arc::clone(&self.inner),
            outcome,
            open: true,
        })
    }

    /// Close a connection; same as [`Connection::disconnect`]
    pub fn disconnect(&self, connection: Connection) -> std::result::Result<(), DisconnectError> {
        connection.disconnect()
    }

    /// Number of open connections across all processes
    pub fn connection_count(&self) -> Result<usize> {
        self.inner.registry.count()
    }

    /// Snapshot of the live module metadata
    pub fn modules(&self) -> Result<ModuleSet> {
        self.inner.store.load()
    }

    /// Changes waiting for the next apply, in submission order
    pub fn scheduled_changes(&self) -> Result<Vec<ScheduledChange>> {
        Ok(self.inner.log.load()?.drain())
    }
}

impl Inner {
    fn connect(&self, options: ConnectOptions) -> Result<(ConnectionId, Option<ApplyOutcome>)> {
        let _lease = self.lock.acquire()?;
        let mut registry = self.registry.load()?;

        if self.config.connect.prune_dead_connections {
            for record in registry.prune_dead(process_alive) {
                warn!(
                    connection = %record.id,
                    pid = record.pid,
                    "pruned connection of dead process"
                );
            }
        }

        let was_idle = registry.count() == 0;
        let id = registry.register(std::process::id());

        let outcome = if was_idle {
            let mut applier = ChangeApplier::new(&self.store, &self.log, &self.resolver);
            Some(applier.run()?)
        } else {
            None
        };

        if let Some(ApplyOutcome::Failed { change, reason, .. }) = &outcome {
            if options.err_on_scheduled_fail {
                registry.unregister(id);
                self.registry.save(&registry)?;
                return Err(SchedError::ApplyFailure {
                    change: Box::new(change.clone()),
                    reason: reason.clone(),
                });
            }
            warn!(seq = change.seq, reason = %reason, "connecting despite failed scheduled change");
        }

        self.registry.save(&registry)?;
        info!(connection = %id, count = registry.count(), applied = was_idle, "connected");
        Ok((id, outcome))
    }

    fn disconnect(&self, id: ConnectionId) -> Result<()> {
        let _lease = self.lock.acquire()?;
        let mut registry = self.registry.load()?;
        match registry.unregister(id) {
            Some(_) => {
                self.registry.save(&registry)?;
                info!(connection = %id, count = registry.count(), "disconnected");
            }
            None => warn!(
                connection = %id,
                "disconnecting a connection the registry no longer knows"
            ),
        }
        Ok(())
    }

    fn schedule(
        &self,
        origin: ConnectionId,
        kind: ChangeKind,
        available_imports: &BTreeSet<String>,
    ) -> Result<u64> {
        let _lease = self.lock.acquire()?;
        let base = self.store.load()?;
        let mut log = self.log.load()?;
        let description = kind.to_string();

        let seq = log.append(kind, origin, &base, &self.resolver, available_imports)?;
        self.log.save(&log)?;
        info!(
            seq,
            change = %description,
            connection = %origin,
            pending = log.len(),
            "scheduled change"
        );
        Ok(seq)
    }
}

/// An open client connection
///
/// Dropping a connection disconnects it; [`Connection::disconnect`] does the
/// same but reports errors.
pub struct Connection {
    id: ConnectionId,
    inner: Arc<Inner>,
    outcome: Option<ApplyOutcome>,
    open: bool,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Outcome of the applier run this connect triggered, if it triggered one
    pub fn apply_outcome(&self) -> Option<&ApplyOutcome> {
        self.outcome.as_ref()
    }

    /// Schedule installation of the module at `path`
    ///
    /// Imports must be installed, pending install, or found in `search_dirs`
    /// (then the configured search directories, then the module's own
    /// directory). `features` are enabled as part of the install.
    pub fn install_module(
        &self,
        path: impl AsRef<Path>,
        search_dirs: &[PathBuf],
        features: &[&str],
    ) -> Result<u64> {
        let path = path.as_ref();
        let module = self.inner.parser.parse_module(path)?;

        let mut dirs: Vec<PathBuf> = search_dirs.to_vec();
        dirs.extend(self.inner.config.repository.search_dirs.iter().cloned());
        if let Some(parent) = path.parent() {
            dirs.push(parent.to_path_buf());
        }
        let available: BTreeSet<String> = module
            .imports
            .iter()
            .filter(|i| locate_module(&dirs, &i.module, i.revision).is_some())
            .map(|i| i.module.clone())
            .collect();

        let kind = ChangeKind::InstallModule {
            module,
            enable_features: features.iter().map(|f| f.to_string()).collect(),
        };
        self.inner.schedule(self.id, kind, &available)
    }

    /// Schedule removal of an installed module
    pub fn remove_module(&self, module: &str) -> Result<u64> {
        let kind = ChangeKind::RemoveModule {
            module: module.to_string(),
        };
        self.inner.schedule(self.id, kind, &BTreeSet::new())
    }

    pub fn enable_feature(&self, module: &str, feature: &str) -> Result<u64> {
        let kind = ChangeKind::EnableFeature {
            feature: FeatureRef::new(module, feature),
        };
        self.inner.schedule(self.id, kind, &BTreeSet::new())
    }

    pub fn disable_feature(&self, module: &str, feature: &str) -> Result<u64> {
        let kind = ChangeKind::DisableFeature {
            feature: FeatureRef::new(module, feature),
        };
        self.inner.schedule(self.id, kind, &BTreeSet::new())
    }

    /// Unregister this connection
    ///
    /// On failure the connection comes back inside the error, still open,
    /// so the caller can retry.
    pub fn disconnect(mut self) -> std::result::Result<(), DisconnectError> {
        match self.inner.disconnect(self.id) {
            Ok(()) => {
                self.open = false;
                Ok(())
            }
            Err(source) => Err(DisconnectError {
                connection: self,
                source,
            }),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("root", &self.inner.root)
            .field("open", &self.open)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.inner.disconnect(self.id) {
                warn!(
                    connection = %self.id,
                    error = %err,
                    "failed to disconnect dropped connection"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BASE: &str = "module base { prefix b; feature featx; }";
    const DEP: &str = r#"module dep {
        prefix d;
        import base { prefix b; }
        feature feat1 { if-feature "b:featx"; }
    }"#;

    fn write_modules(dir: &Path) -> (PathBuf, PathBuf) {
        let base = dir.join("base.yang");
        let dep = dir.join("dep.yang");
        fs::write(&base, BASE).unwrap();
        fs::write(&dep, DEP).unwrap();
        (base, dep)
    }

    #[test]
    fn test_changes_wait_for_reconnect() {
        let dir = tempdir().unwrap();
        let (base, _) = write_modules(dir.path());
        let ds = Datastore::open_at(dir.path().join("repo")).unwrap();

        let conn = ds.connect(ConnectOptions::default()).unwrap();
        assert_eq!(conn.apply_outcome(), Some(&ApplyOutcome::Success { applied: 0 }));
        conn.install_module(&base, &[], &[]).unwrap();
        assert!(ds.modules().unwrap().is_empty());
        assert_eq!(ds.scheduled_changes().unwrap().len(), 1);

        // a second connection does not trigger the applier
        let other = ds.connect(ConnectOptions::default()).unwrap();
        assert!(other.apply_outcome().is_none());
        assert_eq!(ds.connection_count().unwrap(), 2);
        other.disconnect().unwrap();
        conn.disconnect().unwrap();
        assert_eq!(ds.connection_count().unwrap(), 0);

        let conn = ds.connect(ConnectOptions::err_on_scheduled_fail()).unwrap();
        assert_eq!(conn.apply_outcome(), Some(&ApplyOutcome::Success { applied: 1 }));
        assert!(ds.modules().unwrap().contains("base"));
        assert!(ds.scheduled_changes().unwrap().is_empty());
    }

    #[test]
    fn test_validation_errors_surface_synchronously() {
        let dir = tempdir().unwrap();
        let ds = Datastore::open_at(dir.path().join("repo")).unwrap();
        let conn = ds.connect(ConnectOptions::default()).unwrap();

        let err = conn.enable_feature("ghost", "f").unwrap_err();
        assert!(matches!(
            err.validation(),
            Some(crate::error::ValidationError::ModuleNotFound { .. })
        ));
        assert!(ds.scheduled_changes().unwrap().is_empty());
    }

    #[test]
    fn test_import_found_next_to_module() {
        let dir = tempdir().unwrap();
        let (_, dep) = write_modules(dir.path());
        let ds = Datastore::open_at(dir.path().join("repo")).unwrap();
        let conn = ds.connect(ConnectOptions::default()).unwrap();

        // base is not installed, but base.yang sits beside dep.yang
        conn.install_module(&dep, &[], &[]).unwrap();

        let elsewhere = tempdir().unwrap();
        let lonely = elsewhere.path().join("dep.yang");
        fs::write(&lonely, DEP.replace("module dep", "module dep2")).unwrap();
        let err = conn.install_module(&lonely, &[], &[]).unwrap_err();
        assert!(matches!(
            err.validation(),
            Some(crate::error::ValidationError::MissingImport { .. })
        ));
    }

    #[test]
    fn test_dropped_connection_unregisters() {
        let dir = tempdir().unwrap();
        let ds = Datastore::open_at(dir.path().join("repo")).unwrap();
        {
            let _conn = ds.connect(ConnectOptions::default()).unwrap();
            assert_eq!(ds.connection_count().unwrap(), 1);
        }
        assert_eq!(ds.connection_count().unwrap(), 0);
    }
}

//! Familiar Schema Scheduler
//!
//! Coordinates schema changes (module install/remove, feature enable/disable)
//! between processes sharing one datastore. Changes are validated when they
//! are submitted, queued in a durable log, and applied only when the first
//! connection opens after every connection has closed.
//!
//! ## Features
//!
//! - **Deferred Application**: Live connections never see the schema move under them
//! - **Dependency Checking**: Feature prerequisites and module imports are resolved up front
//! - **Cycle Detection**: Feature dependency graphs stay acyclic
//! - **Checksum Validation**: SHA256 checksums guard every persisted file
//! - **Cross-Process Safety**: A repository lock serializes all state changes
//!
//! ## Architecture
//!
//! ```text
//! .schema-sched/
//! ├── repository.lock      held while any state below changes
//! ├── connections.json     ConnectionRegistry
//! ├── scheduled.json       ChangeLog (pending changes, seq ordered)
//! └── modules.json         ModuleStore (live modules + last applied seq)
//!
//! connect ──► prune dead ──► 0 -> 1 ? ──► ChangeApplier ──► modules.json
//! install/remove/enable/disable ──► DependencyResolver ──► scheduled.json
//! ```

pub mod applier;
pub mod checksum;
pub mod config;
pub mod datastore;
pub mod error;
pub mod graph;
pub mod lock;
pub mod parser;
pub mod persist;
pub mod registry;
pub mod resolver;
pub mod revision;
pub mod schedule;
pub mod schema;
pub mod store;

pub use applier::{ApplierState, ApplyOutcome, ChangeApplier};
pub use checksum::Checksum;
pub use config::SchedulerConfig;
pub use datastore::{ConnectOptions, Connection, Datastore, DatastoreBuilder};
pub use error::{DisconnectError, Result, SchedError, ValidationError};
pub use graph::FeatureGraph;
pub use parser::{SchemaParser, YangParser};
pub use registry::ConnectionId;
pub use resolver::{DataProbe, DependencyResolver, NoLiveData};
pub use revision::Revision;
pub use schedule::{ChangeKind, ScheduledChange};
pub use schema::{DependencyEdge, Feature, FeatureRef, Module, ModuleSet};

//! # rolesync-engine
//!
//! Cross-group role reconciliation.
//!
//! Build a [`Reconciler`] over a platform adapter and an
//! [`rolesync_core::IntentStore`], classify syncable roles with
//! [`Reconciler::rebuild_roles`], then feed membership notifications to a
//! [`ChangeListener`] and explicit resets to a [`ResetService`].

pub mod classifier;
pub mod engine;
pub mod error;
pub mod guard;
pub mod listener;
pub mod memory;
pub mod platform;
pub mod reset;

pub use classifier::SyncableRoles;
pub use engine::{PassFailure, PassReport, ReconcileOutcome, Reconciler, RoleAction, RoleChange};
pub use error::SyncError;
pub use guard::{GuardTicket, ReconcileGuard};
pub use listener::{ChangeListener, ListenerOutcome};
pub use memory::{InMemoryPlatform, Topology, TopologyError};
pub use platform::{GroupCatalog, MembershipMutator, PlatformError};
pub use reset::{RatePolicy, ResetAllSummary, ResetProgress, ResetReport, ResetService, SubjectResult};

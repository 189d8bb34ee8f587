//! kapply ops: lifecycle primitives (ensure-exists, replace, delete), bounded polling for
//! schema registration and deletion, schema removal with force cleanup, and the batch
//! [`Reconciler`].

#![forbid(unsafe_code)]

pub mod lifecycle;
pub mod poll;
pub mod reconcile;
pub mod schema;

pub use lifecycle::{DeleteOutcome, EnsureOutcome, Lifecycle, ReplaceOutcome};
pub use poll::{backoff_for_timeout, confirm_deleted, poll_until, registered};
pub use reconcile::{BatchReport, Failure, Mode, Outcome, Reconciler};
pub use schema::{is_crd, CrdInfo, RemovalOptions, SchemaState};

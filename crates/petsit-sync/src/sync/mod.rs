//! Reconciliation: LWW merge, subscriptions, diagnostics and maintenance

mod diagnostics;
mod engine;
mod maintenance;
mod merge;
mod subscription;

pub use diagnostics::{Diagnostic, Diagnostics};
pub use engine::ReconciliationEngine;
pub use maintenance::spawn_tombstone_gc;
pub use merge::{decide, BatchReport, Outcome};
pub use subscription::{RecordCallback, RecordFilter, SubscriptionHandle, SubscriptionRegistry};

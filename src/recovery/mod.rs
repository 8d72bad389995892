//! Recovery subsystem: the Context-Snapshot Builder and Recovery Planner
//! (spec.md §2, §4.3, §4.4).

pub mod planner;
pub mod snapshot;

pub use planner::LimitTrigger;
pub use snapshot::build_recovery_snapshot;

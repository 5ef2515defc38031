// Master-side scheduling: task engine, validation pipeline and record reconciliation

pub mod criteria;
pub mod engine;
pub mod master;
pub mod queue;
pub mod reconciler;

pub use criteria::{Criterion, Readiness};
pub use engine::{EngineOptions, TaskEngine};
pub use master::MasterRole;
pub use queue::SchedulerQueue;
pub use reconciler::RecordReconciler;

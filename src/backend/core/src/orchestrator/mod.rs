//! The two fixed dispatch pipelines.
//!
//! - **Submit**: decide by delay presence — park the job as an expiring
//!   record, or forward it straight to execution.
//! - **Execute**: mark the job running and bump its queue's running counter.
//!
//! Data flow: Submit → (store write, expiry path) → Expiry Watcher →
//! Execute → store (status + aggregate). Immediate jobs skip the store and
//! go from Submit directly to Execute.

pub mod execute;
pub mod submit;

pub use execute::{ExecuteJob, ExecutionOrchestrator};
pub use submit::{SubmitOrchestrator, SubmitOutcome};

//! Domain model (IDs, records, state machine, errors, decisions).

pub mod decision;
pub mod entry;
pub mod errors;
pub mod ids;
pub mod retry;
pub mod segment;
pub mod state;
pub mod task;
pub mod views;
pub mod worker;

pub use decision::{Decider, Decision, DefaultDecider, decide_recovery};
pub use entry::QueueEntry;
pub use errors::{ErrorKind, PolyglotError, Result};
pub use ids::{ConsumerId, EntryId, Language, SegmentId, TaskId, WorkerId};
pub use retry::RetryPolicy;
pub use segment::{GateDecision, SegmentRecord, TranslationOutcome};
pub use state::{CapacityState, TaskStatus};
pub use task::{CreateTaskRequest, ErrorEntry, SegmentSpec, TaskRecord};
pub use views::{FAILED_MARKER, Progress, SegmentResultView, TaskResultsView, TaskStatusView};
pub use worker::WorkerRecord;

//! Engine entities
//!
//! Entities are addressed by id and loaded explicitly per operation; there are
//! no object graphs between them.

/// `as_str`, `Display` and `FromStr` for snake_case status enums
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

mod action;
mod bulk;
mod execution;
mod goal;
mod version;
mod wait;

pub use action::{ActionExecution, ActionStatus};
pub use bulk::{
    BatchStatus, BulkEnrollmentBatch, BulkEnrollmentFailure, BulkEnrollmentJob,
    BulkEnrollmentOptions, BulkJobStatus, ContactSelection, JobCounters, JobProgress,
};
pub use execution::{
    ConditionLog, EnrollmentSource, ExecutionStatus, ExitReason, TransitionError,
    WorkflowExecution,
};
pub use goal::GoalAchievement;
pub use version::{
    MappingRules, MigrationErrorEntry, MigrationStatus, MigrationStrategy, VersionMigration,
    VersionStatus, WorkflowVersion, MAX_VERSION_NUMBER,
};
pub use wait::{EventListener, ListenerStatus, ResumedBy, WaitExecution, WaitStatus, WaitType};

//! Data models for execution records, session grants, DCA strategies, and
//! copy-trading relationships. Field names and enum string values are the
//! wire contract other subsystems match.

mod copy;
mod dca;
mod execution;
mod session;

pub use copy::{
    CopyExecution, CopyExecutionStatus, CopyRelationship, CopySkipReason, LeaderSignal,
    SizingMode,
};
pub use dca::{
    DcaExecution, DcaExecutionStatus, DcaFrequency, DcaGuards, DcaSkipReason, DcaStats,
    DcaStatus, DcaStopConditions, DcaStrategy,
};
pub use execution::{
    DecisionRecord, ExecutionContext, ExecutionRecord, ExecutionState, ExecutionStep,
    OwnerKind, StateTransition, StepAction, StepStatus,
};
pub use session::{
    ActionClass, AuthorizationDenied, SessionKey, SessionStatus, SmartSession, SpendScope,
    UsageEntry, ValueLimits, USAGE_LOG_LIMIT,
};

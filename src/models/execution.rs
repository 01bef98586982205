//! Execution record model: the canonical state of every automated action.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Analyzing,
    Planning,
    AwaitingApproval,
    Executing,
    Monitoring,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Analyzing => "analyzing",
            ExecutionState::Planning => "planning",
            ExecutionState::AwaitingApproval => "awaiting_approval",
            ExecutionState::Executing => "executing",
            ExecutionState::Monitoring => "monitoring",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Paused => "paused",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(ExecutionState::Idle),
            "analyzing" => Some(ExecutionState::Analyzing),
            "planning" => Some(ExecutionState::Planning),
            "awaiting_approval" => Some(ExecutionState::AwaitingApproval),
            "executing" => Some(ExecutionState::Executing),
            "monitoring" => Some(ExecutionState::Monitoring),
            "completed" => Some(ExecutionState::Completed),
            "failed" => Some(ExecutionState::Failed),
            "paused" => Some(ExecutionState::Paused),
            "cancelled" => Some(ExecutionState::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// States reachable from this one. Illegal edges are rejected at the
    /// API boundary rather than trusted to callers.
    pub fn allowed_successors(&self) -> &'static [ExecutionState] {
        use ExecutionState::*;
        match self {
            Idle => &[Analyzing, Planning, AwaitingApproval, Executing, Paused, Cancelled, Failed],
            Analyzing => &[Planning, AwaitingApproval, Executing, Paused, Cancelled, Failed],
            Planning => &[AwaitingApproval, Executing, Paused, Cancelled, Failed],
            // Cancellation is only possible before broadcast.
            AwaitingApproval => &[Executing, Paused, Cancelled, Failed],
            Executing => &[Monitoring, Completed, Failed],
            Monitoring => &[Completed, Failed],
            Paused => &[Analyzing, Planning, AwaitingApproval, Executing, Cancelled, Failed],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: ExecutionState) -> bool {
        self.allowed_successors().contains(&to)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who owns an execution record (the producer that created it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    DcaStrategy,
    CopyRelationship,
    Agent,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::DcaStrategy => "dca_strategy",
            OwnerKind::CopyRelationship => "copy_relationship",
            OwnerKind::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dca_strategy" => Some(OwnerKind::DcaStrategy),
            "copy_relationship" => Some(OwnerKind::CopyRelationship),
            "agent" => Some(OwnerKind::Agent),
            _ => None,
        }
    }
}

/// Producer-specific context attached to transitions and steps.
///
/// A closed set of tagged variants instead of a free-form map, so every
/// consumer gets compile-time coverage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionContext {
    Dca {
        strategy_id: String,
        execution_number: i64,
    },
    CopyTrade {
        relationship_id: String,
        leader_tx_hash: String,
    },
    Agent {
        note: String,
    },
}

/// One record per automated action attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub owner_kind: OwnerKind,
    pub owner_id: String,
    pub wallet_address: String,

    pub current_state: ExecutionState,
    pub state_entered_at: DateTime<Utc>,
    pub current_step_index: i64,

    pub requires_approval: bool,
    pub approval_reason: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,

    /// Advisory flag set on failure; the producer decides whether to retry.
    pub recoverable: bool,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }
}

/// Immutable entry in an execution record's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: i64,
    pub execution_id: String,
    pub from_state: ExecutionState,
    pub to_state: ExecutionState,
    pub trigger: String,
    pub reason: Option<String>,
    pub context: Option<ExecutionContext>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Action performed by a single execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Quote,
    Approve,
    Swap,
    Transfer,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Quote => "quote",
            StepAction::Approve => "approve",
            StepAction::Swap => "swap",
            StepAction::Transfer => "transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quote" => Some(StepAction::Quote),
            "approve" => Some(StepAction::Approve),
            "swap" => Some(StepAction::Swap),
            "transfer" => Some(StepAction::Transfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Submitted,
    Confirmed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Submitted => "submitted",
            StepStatus::Confirmed => "confirmed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "submitted" => Some(StepStatus::Submitted),
            "confirmed" => Some(StepStatus::Confirmed),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

/// One step of an execution's plan. The step list is replaced as a unit so
/// ordinals and `current_step_index` stay consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub ordinal: i64,
    pub description: String,
    pub action: StepAction,
    pub status: StepStatus,
    pub tx_hash: Option<String>,
    pub chain_id: Option<i64>,
    pub gas_used_usd: Option<Decimal>,
    pub retry_count: i64,
    pub payload: Option<ExecutionContext>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    pub fn new(ordinal: i64, description: impl Into<String>, action: StepAction) -> Self {
        Self {
            ordinal,
            description: description.into(),
            action,
            status: StepStatus::Pending,
            tx_hash: None,
            chain_id: None,
            gas_used_usd: None,
            retry_count: 0,
            payload: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Append-only explainability record linked to an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub execution_id: String,
    pub stage: String,
    pub decision: String,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_successors() {
        for state in [
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::Cancelled,
        ] {
            assert!(state.is_terminal());
            assert!(state.allowed_successors().is_empty());
        }
    }

    #[test]
    fn executing_cannot_be_cancelled() {
        // Once broadcast, only monitoring to a terminal state remains.
        assert!(!ExecutionState::Executing.can_transition_to(ExecutionState::Cancelled));
        assert!(ExecutionState::Executing.can_transition_to(ExecutionState::Monitoring));
        assert!(ExecutionState::Monitoring.can_transition_to(ExecutionState::Completed));
    }

    #[test]
    fn awaiting_approval_can_be_cancelled() {
        assert!(ExecutionState::AwaitingApproval.can_transition_to(ExecutionState::Cancelled));
        assert!(ExecutionState::AwaitingApproval.can_transition_to(ExecutionState::Executing));
    }

    #[test]
    fn every_nonterminal_state_can_fail() {
        for state in [
            ExecutionState::Idle,
            ExecutionState::Analyzing,
            ExecutionState::Planning,
            ExecutionState::AwaitingApproval,
            ExecutionState::Executing,
            ExecutionState::Monitoring,
            ExecutionState::Paused,
        ] {
            assert!(
                state.can_transition_to(ExecutionState::Failed),
                "{state} should be able to fail"
            );
        }
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            ExecutionState::Idle,
            ExecutionState::AwaitingApproval,
            ExecutionState::Monitoring,
            ExecutionState::Cancelled,
        ] {
            assert_eq!(ExecutionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ExecutionState::parse("nonsense"), None);
    }
}

//! Orchestrator phases

use serde::{Deserialize, Serialize};

/// The fixed phase set of the orchestrator state machine.
///
/// New epics enter `understanding`; resumed epics enter the phase their
/// latest checkpoint recorded. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Understanding,
    HighDesign,
    DetailDesign,
    Deliverables,
    Plan,
    ParallelDispatch,
    BlockedReview,
    Verify,
    Completed,
    Failed,
    Replanning,
    Paused,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Understanding => "understanding",
            Phase::HighDesign => "high_design",
            Phase::DetailDesign => "detail_design",
            Phase::Deliverables => "deliverables",
            Phase::Plan => "plan",
            Phase::ParallelDispatch => "parallel_dispatch",
            Phase::BlockedReview => "blocked_review",
            Phase::Verify => "verify",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Replanning => "replanning",
            Phase::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "understanding" => Some(Phase::Understanding),
            "high_design" => Some(Phase::HighDesign),
            "detail_design" => Some(Phase::DetailDesign),
            "deliverables" => Some(Phase::Deliverables),
            "plan" => Some(Phase::Plan),
            "parallel_dispatch" => Some(Phase::ParallelDispatch),
            "blocked_review" => Some(Phase::BlockedReview),
            "verify" => Some(Phase::Verify),
            "completed" => Some(Phase::Completed),
            "failed" => Some(Phase::Failed),
            "replanning" => Some(Phase::Replanning),
            "paused" => Some(Phase::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Map a checkpoint's phase string to the phase to resume into.
    ///
    /// Unknown or terminal phases resume into `replanning`: a finished
    /// epic being resumed means something went sideways, and replanning
    /// is the recovery posture.
    pub fn resume_from(phase: &str) -> Phase {
        match Phase::parse(phase) {
            Some(p) if !p.is_terminal() => p,
            _ => Phase::Replanning,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

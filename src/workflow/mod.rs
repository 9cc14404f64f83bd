//! The step machine.
//!
//! A ticket moves through a fixed pipeline:
//! classify → extract → research → draft → review → finalize,
//! with `dispatch_tools` as the detour any step can take to run tools or
//! wait on a human approval. Transitions live in a static table; steps
//! report what should happen next through [`Signal`] and the worker owns
//! all persistence.

pub mod llm;
pub mod state;
pub mod steps;
pub mod tools;

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub use llm::{LanguageModel, ModelError, TemplateModel};
pub use state::{ActionRecord, ApprovalOutcome, Entities, PendingApproval, WorkflowState};
pub use steps::SupportPipeline;
pub use tools::{SupportTools, ToolCall, ToolError, ToolRegistry};

/// The steps of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Classify,
    Extract,
    Research,
    Draft,
    Review,
    Finalize,
    /// Tool execution detour; resumes at the step recorded in state
    DispatchTools,
}

/// Main-path successor table. `dispatch_tools` is absent: its successor
/// is dynamic, read from the checkpointed state.
static TRANSITIONS: &[(StepName, StepName)] = &[
    (StepName::Classify, StepName::Extract),
    (StepName::Extract, StepName::Research),
    (StepName::Research, StepName::Draft),
    (StepName::Draft, StepName::Review),
    (StepName::Review, StepName::Finalize),
];

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Classify => "classify",
            StepName::Extract => "extract",
            StepName::Research => "research",
            StepName::Draft => "draft",
            StepName::Review => "review",
            StepName::Finalize => "finalize",
            StepName::DispatchTools => "dispatch_tools",
        }
    }

    /// The step that follows on the main path, if any.
    pub fn successor(&self) -> Option<StepName> {
        TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, to)| *to)
    }

    /// First step of the pipeline; fresh tickets start here.
    pub fn initial() -> StepName {
        StepName::Classify
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepName {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classify" => Ok(StepName::Classify),
            "extract" => Ok(StepName::Extract),
            "research" => Ok(StepName::Research),
            "draft" => Ok(StepName::Draft),
            "review" => Ok(StepName::Review),
            "finalize" => Ok(StepName::Finalize),
            "dispatch_tools" => Ok(StepName::DispatchTools),
            other => Err(EngineError::UnknownStep(other.to_string())),
        }
    }
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying (timeouts, unavailable dependencies)
    Transient(String),
    /// Retrying cannot help (malformed input, unknown tool)
    Permanent(String),
}

impl FailureKind {
    pub fn message(&self) -> &str {
        match self {
            FailureKind::Transient(m) | FailureKind::Permanent(m) => m,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Transient(_))
    }
}

/// What a step wants to happen next. The worker interprets this; steps
/// never persist anything themselves.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Checkpoint and run the named step
    Continue(StepName),
    /// Run these tools, then come back to the requesting step
    NeedsTools(Vec<ToolCall>),
    /// Suspend until a human decides on this action
    NeedsApproval { action_type: String, params: Value },
    /// Pipeline finished; the value is the ticket result
    Done(Value),
    /// Step failed
    Failed(FailureKind),
}

/// Executes one step against mutable workflow state.
///
/// Implementations must be deterministic given the same state, except for
/// the side effects behind the tool registry seam.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: StepName, state: &mut WorkflowState) -> Signal;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_path_order() {
        let mut step = StepName::initial();
        let mut path = vec![step];
        while let Some(next) = step.successor() {
            path.push(next);
            step = next;
        }
        assert_eq!(
            path,
            vec![
                StepName::Classify,
                StepName::Extract,
                StepName::Research,
                StepName::Draft,
                StepName::Review,
                StepName::Finalize,
            ]
        );
    }

    #[test]
    fn test_dispatch_tools_has_no_static_successor() {
        assert_eq!(StepName::DispatchTools.successor(), None);
        assert_eq!(StepName::Finalize.successor(), None);
    }

    #[test]
    fn test_step_name_roundtrip() {
        for step in [
            StepName::Classify,
            StepName::Extract,
            StepName::Research,
            StepName::Draft,
            StepName::Review,
            StepName::Finalize,
            StepName::DispatchTools,
        ] {
            let parsed: StepName = step.as_str().parse().unwrap();
            assert_eq!(parsed, step);
        }
        assert!("frobnicate".parse::<StepName>().is_err());
    }

    #[test]
    fn test_failure_kind_predicates() {
        assert!(FailureKind::Transient("timeout".into()).is_transient());
        assert!(!FailureKind::Permanent("bad input".into()).is_transient());
        assert_eq!(FailureKind::Transient("timeout".into()).message(), "timeout");
    }
}

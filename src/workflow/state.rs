//! Workflow state: everything a resumed worker needs, nothing more.
//!
//! This struct is what gets serialized into the checkpoint. Resume is a
//! pure function of it: a worker that crashes mid-ticket is replaced by
//! one that deserializes this and continues.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::Ticket;
use crate::workflow::tools::ToolCall;
use crate::workflow::StepName;

/// Entities pulled out of the ticket body by the extract step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    /// "high" or "normal"
    #[serde(default)]
    pub urgency: Option<String>,
}

/// A tool that was actually executed, with its result. Presence here is
/// what makes re-execution on resume a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub tool: String,
    pub args: Value,
    pub result: Value,
}

/// An approval the workflow is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub action_type: String,
    pub params: Value,
}

/// A decided approval, folded into state by the gate before resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub action_type: String,
    pub params: Value,
    pub approved: bool,
    pub decided_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The accumulated state of one ticket's pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub customer_id: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub entities: Option<Entities>,
    #[serde(default)]
    pub research_results: Vec<Value>,
    #[serde(default)]
    pub draft_response: Option<String>,
    #[serde(default)]
    pub review_notes: Option<String>,
    #[serde(default)]
    pub final_response: Option<String>,
    /// Tools executed so far, in order
    #[serde(default)]
    pub actions_taken: Vec<ActionRecord>,
    /// Tools queued for the dispatch step
    #[serde(default)]
    pub pending_tools: Vec<ToolCall>,
    /// Step to return to after dispatch finishes
    #[serde(default)]
    pub resume_step: Option<StepName>,
    #[serde(default)]
    pub pending_approval: Option<PendingApproval>,
    #[serde(default)]
    pub approval_decision: Option<ApprovalOutcome>,
}

impl WorkflowState {
    /// Fresh state for a ticket that has never run.
    pub fn for_ticket(ticket: &Ticket) -> Self {
        Self {
            customer_id: ticket.customer_id.clone(),
            subject: ticket.subject.clone(),
            body: ticket.body.clone(),
            classification: None,
            entities: None,
            research_results: Vec::new(),
            draft_response: None,
            review_notes: None,
            final_response: None,
            actions_taken: Vec::new(),
            pending_tools: Vec::new(),
            resume_step: None,
            pending_approval: None,
            approval_decision: None,
        }
    }

    /// Whether a tool already ran for this ticket.
    pub fn has_executed(&self, tool: &str) -> bool {
        self.actions_taken.iter().any(|a| a.tool == tool)
    }

    /// The recorded result of an executed tool, if any.
    pub fn action_result(&self, tool: &str) -> Option<&Value> {
        self.actions_taken
            .iter()
            .find(|a| a.tool == tool)
            .map(|a| &a.result)
    }

    pub fn record_action(&mut self, tool: &str, args: Value, result: Value) {
        self.actions_taken.push(ActionRecord {
            tool: tool.to_string(),
            args,
            result,
        });
    }

    /// The payload stored on the ticket when the pipeline completes.
    pub fn result_payload(&self) -> Value {
        json!({
            "classification": self.classification,
            "entities": self.entities,
            "final_response": self.final_response,
            "review_notes": self.review_notes,
            "actions_taken": self.actions_taken.iter().map(|a| json!({
                "tool": a.tool,
                "result": a.result,
            })).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkflowState {
        WorkflowState {
            customer_id: "cust_1".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
            classification: None,
            entities: None,
            research_results: Vec::new(),
            draft_response: None,
            review_notes: None,
            final_response: None,
            actions_taken: Vec::new(),
            pending_tools: Vec::new(),
            resume_step: None,
            pending_approval: None,
            approval_decision: None,
        }
    }

    #[test]
    fn test_has_executed_after_record() {
        let mut s = state();
        assert!(!s.has_executed("process_refund"));
        s.record_action("process_refund", json!({}), json!({"success": true}));
        assert!(s.has_executed("process_refund"));
        assert_eq!(
            s.action_result("process_refund").unwrap()["success"],
            true
        );
    }

    #[test]
    fn test_serde_roundtrip_preserves_resume_step() {
        let mut s = state();
        s.resume_step = Some(StepName::Research);
        s.pending_tools.push(ToolCall {
            name: "search_help_articles".to_string(),
            args: json!({"query": "refund"}),
        });

        let value = serde_json::to_value(&s).unwrap();
        let back: WorkflowState = serde_json::from_value(value).unwrap();
        assert_eq!(back.resume_step, Some(StepName::Research));
        assert_eq!(back.pending_tools.len(), 1);
        assert_eq!(back.pending_tools[0].name, "search_help_articles");
    }

    #[test]
    fn test_old_checkpoints_without_new_fields_deserialize() {
        // minimal blob, as an older writer might have produced
        let value = json!({
            "customer_id": "cust_1",
            "subject": "s",
            "body": "b",
        });
        let s: WorkflowState = serde_json::from_value(value).unwrap();
        assert!(s.classification.is_none());
        assert!(s.pending_tools.is_empty());
        assert!(s.approval_decision.is_none());
    }

    #[test]
    fn test_result_payload_shape() {
        let mut s = state();
        s.classification = Some("billing".to_string());
        s.final_response = Some("done".to_string());
        s.record_action("process_refund", json!({}), json!({"refund_id": "ref_1"}));

        let payload = s.result_payload();
        assert_eq!(payload["classification"], "billing");
        assert_eq!(payload["final_response"], "done");
        assert_eq!(payload["actions_taken"][0]["tool"], "process_refund");
    }
}

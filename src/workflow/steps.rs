//! The support pipeline: step implementations.
//!
//! Every step is a deterministic transformation of `WorkflowState`; the
//! only nondeterminism lives behind the `ToolRegistry` and
//! `LanguageModel` seams. Steps signal what should happen next and never
//! touch storage.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::workflow::llm::{LanguageModel, TemplateModel};
use crate::workflow::state::{Entities, WorkflowState};
use crate::workflow::tools::{SupportTools, ToolCall, ToolRegistry};
use crate::workflow::{FailureKind, Signal, StepExecutor, StepName};

static ORDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bord_[a-z0-9]+\b").unwrap());
static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$([0-9]+(?:\.[0-9]{1,2})?)").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

/// Keyword tables for classification, checked in order.
static CATEGORIES: &[(&str, &[&str])] = &[
    ("billing", &["refund", "charge", "billing", "invoice", "payment", "subscription"]),
    ("technical", &["error", "bug", "crash", "broken", "fail"]),
    ("account", &["password", "login", "account", "locked", "sign in"]),
];

/// The production step executor.
pub struct SupportPipeline {
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolRegistry>,
}

impl SupportPipeline {
    pub fn new(model: Arc<dyn LanguageModel>, tools: Arc<dyn ToolRegistry>) -> Self {
        Self { model, tools }
    }

    /// Deterministic model and mock tools; what the demo and most tests use.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(TemplateModel::new()), Arc::new(SupportTools::new()))
    }

    fn classify(state: &mut WorkflowState) -> Signal {
        let text = format!("{} {}", state.subject, state.body).to_lowercase();
        let category = CATEGORIES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map_or("general", |(name, _)| *name);

        state.classification = Some(category.to_string());
        tracing::debug!(classification = category, "ticket classified");
        Signal::Continue(StepName::Extract)
    }

    fn extract(state: &mut WorkflowState) -> Signal {
        let text = format!("{} {}", state.subject, state.body);
        let lower = text.to_lowercase();

        let urgency = if ["urgent", "immediately", "asap", "right away"]
            .iter()
            .any(|k| lower.contains(k))
        {
            "high"
        } else {
            "normal"
        };

        state.entities = Some(Entities {
            order_id: ORDER_RE.find(&text).map(|m| m.as_str().to_string()),
            email: EMAIL_RE.find(&text).map(|m| m.as_str().to_string()),
            amount: AMOUNT_RE
                .captures(&text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok()),
            urgency: Some(urgency.to_string()),
        });
        Signal::Continue(StepName::Research)
    }

    fn research(state: &mut WorkflowState) -> Signal {
        let order_id = state
            .entities
            .as_ref()
            .and_then(|e| e.order_id.clone());

        let mut missing = Vec::new();
        if !state.has_executed("search_help_articles") {
            let query = format!(
                "{} {}",
                state.classification.as_deref().unwrap_or("general"),
                state.subject
            );
            missing.push(ToolCall::new(
                "search_help_articles",
                json!({ "query": query, "category": state.classification }),
            ));
        }
        if !state.has_executed("fetch_customer_history") {
            missing.push(ToolCall::new(
                "fetch_customer_history",
                json!({ "customer_id": state.customer_id }),
            ));
        }
        if let Some(order_id) = &order_id {
            if !state.has_executed("check_order_status") {
                missing.push(ToolCall::new(
                    "check_order_status",
                    json!({ "order_id": order_id }),
                ));
            }
        }
        if !missing.is_empty() {
            return Signal::NeedsTools(missing);
        }

        // Rebuilt from recorded actions so re-running is idempotent.
        state.research_results.clear();
        if let Some(result) = state.action_result("search_help_articles") {
            state
                .research_results
                .push(json!({ "source": "help_articles", "data": result }));
        }
        if let Some(result) = state.action_result("fetch_customer_history") {
            state
                .research_results
                .push(json!({ "source": "customer_history", "data": result }));
        }
        if let Some(result) = state.action_result("check_order_status") {
            state
                .research_results
                .push(json!({ "source": "order_status", "data": result }));
        }
        Signal::Continue(StepName::Draft)
    }

    fn wants_password_reset(state: &WorkflowState) -> Option<String> {
        if state.classification.as_deref() != Some("account") {
            return None;
        }
        let lower = state.body.to_lowercase();
        if !lower.contains("password") {
            return None;
        }
        if !(lower.contains("reset") || lower.contains("forgot") || lower.contains("locked")) {
            return None;
        }
        state.entities.as_ref()?.email.clone()
    }

    fn reply_skeleton(state: &WorkflowState) -> String {
        let mut reply = format!(
            "Hello,\n\nThanks for reaching out about \"{}\".",
            state.subject
        );
        match state.classification.as_deref() {
            Some("billing") => {
                reply.push_str(
                    "\n\nWe've reviewed your billing request and understand how important this is.",
                );
                if state.body.to_lowercase().contains("refund") {
                    reply.push_str("\n\nYour refund request has been reviewed by our team.");
                }
            }
            Some("technical") => {
                reply.push_str(
                    "\n\nOur engineering team is looking into the problem you reported.",
                );
                if let Some(result) = state.action_result("create_bug_report") {
                    if let Some(bug_id) = result["bug_id"].as_str() {
                        reply.push_str(&format!("\n\nWe're tracking this as {bug_id}."));
                    }
                }
            }
            Some("account") => {
                if let Some(result) = state.action_result("send_password_reset") {
                    if result["success"] == true {
                        if let Some(email) = result["email"].as_str() {
                            reply.push_str(&format!(
                                "\n\nWe've sent a password reset email to {email}. \
                                 The link expires in 24 hours."
                            ));
                        }
                    }
                } else {
                    reply.push_str(
                        "\n\nWe've reviewed your account and everything looks in order.",
                    );
                }
            }
            _ => {
                reply.push_str("\n\nHere's what we found that may help with your question.");
            }
        }
        reply.push_str("\n\nBest regards,\nSupport Team");
        reply
    }

    async fn draft(&self, state: &mut WorkflowState) -> Signal {
        if let Some(email) = Self::wants_password_reset(state) {
            if !state.has_executed("send_password_reset") {
                return Signal::NeedsTools(vec![ToolCall::new(
                    "send_password_reset",
                    json!({ "email": email }),
                )]);
            }
        }
        if state.classification.as_deref() == Some("technical")
            && !state.has_executed("create_bug_report")
        {
            return Signal::NeedsTools(vec![ToolCall::new(
                "create_bug_report",
                json!({ "title": state.subject, "description": state.body }),
            )]);
        }

        let mut prompt = format!(
            "Write a support reply.\nCategory: {}\nSubject: {}\nBody: {}\n",
            state.classification.as_deref().unwrap_or("general"),
            state.subject,
            state.body
        );
        if let Some(entities) = &state.entities {
            prompt.push_str(&format!(
                "Entities: {}\n",
                serde_json::to_string(entities).unwrap_or_default()
            ));
        }
        for result in &state.research_results {
            prompt.push_str(&format!("Context: {result}\n"));
        }
        prompt.push_str(TemplateModel::REPLY_MARKER);
        prompt.push('\n');
        prompt.push_str(&Self::reply_skeleton(state));

        match self.model.complete(&prompt).await {
            Ok(draft) => {
                state.draft_response = Some(draft);
                Signal::Continue(StepName::Review)
            }
            Err(e) if e.is_transient() => Signal::Failed(FailureKind::Transient(e.to_string())),
            Err(e) => Signal::Failed(FailureKind::Permanent(e.to_string())),
        }
    }

    /// Whether the ticket is a refund request the pipeline should act on.
    fn refund_proposal(state: &WorkflowState) -> Option<(String, f64)> {
        if state.classification.as_deref() != Some("billing") {
            return None;
        }
        if !state.body.to_lowercase().contains("refund") {
            return None;
        }
        let entities = state.entities.as_ref()?;
        Some((entities.order_id.clone()?, entities.amount?))
    }

    fn review(state: &mut WorkflowState) -> Signal {
        state.review_notes = Some(
            "Reviewed draft: addresses the reported concern, tone is professional, \
             no unsupported promises."
                .to_string(),
        );

        // Propose the refund once: never with a decision already on file,
        // never after the tool ran.
        if state.approval_decision.is_none() && !state.has_executed("process_refund") {
            if let Some((order_id, amount)) = Self::refund_proposal(state) {
                return Signal::NeedsApproval {
                    action_type: "process_refund".to_string(),
                    params: json!({
                        "order_id": order_id,
                        "amount": amount,
                        "reason": format!("customer refund request: {}", state.subject),
                    }),
                };
            }
        }
        Signal::Continue(StepName::Finalize)
    }

    async fn dispatch_tools(&self, state: &mut WorkflowState) -> Signal {
        let pending = state.pending_tools.clone();
        for call in &pending {
            // skip-on-resume: a recorded action never runs twice
            if state.has_executed(&call.name) {
                continue;
            }

            if self.tools.requires_approval(&call.name) {
                match &state.approval_decision {
                    Some(decision) if decision.action_type == call.name => {
                        if decision.approved {
                            match self.tools.invoke(call).await {
                                Ok(result) => {
                                    state.record_action(&call.name, call.args.clone(), result);
                                }
                                Err(e) if e.is_transient() => {
                                    return Signal::Failed(FailureKind::Transient(e.to_string()));
                                }
                                Err(e) => {
                                    return Signal::Failed(FailureKind::Permanent(e.to_string()));
                                }
                            }
                        }
                        // rejected: the decision stays in state; finalize
                        // words the reply around it
                    }
                    _ => {
                        return Signal::NeedsApproval {
                            action_type: call.name.clone(),
                            params: call.args.clone(),
                        };
                    }
                }
            } else {
                match self.tools.invoke(call).await {
                    Ok(result) => state.record_action(&call.name, call.args.clone(), result),
                    Err(e) if e.is_transient() => {
                        return Signal::Failed(FailureKind::Transient(e.to_string()));
                    }
                    Err(e) => return Signal::Failed(FailureKind::Permanent(e.to_string())),
                }
            }
        }

        state.pending_tools.clear();
        let resume = state.resume_step.take().unwrap_or(StepName::Finalize);
        Signal::Continue(resume)
    }

    fn finalize(state: &mut WorkflowState) -> Signal {
        let mut response = state
            .draft_response
            .clone()
            .unwrap_or_else(|| Self::reply_skeleton(state));

        if let Some(decision) = &state.approval_decision {
            let executed_ok = state
                .action_result(&decision.action_type)
                .is_some_and(|r| r["success"] == true);
            if decision.approved && executed_ok {
                if let Some(message) = state
                    .action_result(&decision.action_type)
                    .and_then(|r| r["message"].as_str())
                {
                    response.push_str(&format!("\n\nUpdate: {message}"));
                } else {
                    response.push_str("\n\nUpdate: your request has been processed.");
                }
            } else {
                // Never claim an action that did not happen.
                response.push_str(
                    "\n\nUpdate: your request was reviewed but could not be approved \
                     at this time. A member of our team will follow up with next steps.",
                );
            }
        }

        state.final_response = Some(response);
        Signal::Done(state.result_payload())
    }
}

#[async_trait]
impl StepExecutor for SupportPipeline {
    async fn execute(&self, step: StepName, state: &mut WorkflowState) -> Signal {
        tracing::debug!(step = %step, "executing step");
        match step {
            StepName::Classify => Self::classify(state),
            StepName::Extract => Self::extract(state),
            StepName::Research => Self::research(state),
            StepName::Draft => self.draft(state).await,
            StepName::Review => Self::review(state),
            StepName::Finalize => Self::finalize(state),
            StepName::DispatchTools => self.dispatch_tools(state).await,
        }
    }
}

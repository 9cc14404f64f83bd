//! Tools the pipeline can invoke, behind the `ToolRegistry` seam.
//!
//! Side-effecting integrations (payments, auth, issue trackers) live out
//! here so the step machine stays deterministic. Tools tagged as
//! requiring approval are never executed by the registry until a human
//! decision has been folded into the workflow state; the dispatch step
//! enforces that.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Tools that must pass the human approval gate before execution.
pub const REQUIRES_APPROVAL_TOOLS: &[&str] = &["process_refund"];

/// A requested tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: &str, args: Value) -> Self {
        Self {
            name: name.to_string(),
            args,
        }
    }
}

/// Tool invocation errors.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No such tool; retrying cannot help
    #[error("unknown tool: {0}")]
    Unknown(String),

    /// Backing service unreachable; worth retrying
    #[error("tool {0} unavailable: {1}")]
    Unavailable(String, String),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Unavailable(..))
    }
}

/// The seam between the step machine and the outside world.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Whether this tool must pass the approval gate first.
    fn requires_approval(&self, tool: &str) -> bool {
        REQUIRES_APPROVAL_TOOLS.contains(&tool)
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Value, ToolError>;
}

/// Built-in support tools with mock integrations. Argument problems are
/// reported in the result payload (`success: false`) rather than as
/// errors, matching what a real integration would hand back.
#[derive(Default)]
pub struct SupportTools;

impl SupportTools {
    pub fn new() -> Self {
        Self
    }

    fn search_help_articles(args: &Value) -> Value {
        let query = args["query"].as_str().unwrap_or_default();
        let category = args["category"].as_str();
        json!({
            "success": true,
            "articles": [
                {
                    "title": format!("Help: {query}"),
                    "content": "Step-by-step guidance for this topic.",
                    "category": category.unwrap_or("general"),
                }
            ],
            "count": 1,
        })
    }

    fn fetch_customer_history(args: &Value) -> Value {
        let customer_id = args["customer_id"].as_str().unwrap_or_default();
        json!({
            "success": true,
            "customer": { "id": customer_id, "tier": "standard" },
            "tickets": [],
            "orders": [],
        })
    }

    fn check_order_status(args: &Value) -> Value {
        let Some(order_id) = args["order_id"].as_str().filter(|s| !s.is_empty()) else {
            return json!({ "success": false, "error": "order id is required" });
        };
        json!({
            "success": true,
            "order": {
                "order_id": order_id,
                "status": "delivered",
            },
        })
    }

    fn send_password_reset(args: &Value) -> Value {
        let email = args["email"].as_str().unwrap_or_default();
        if !email.contains('@') {
            return json!({ "success": false, "error": "valid email address is required" });
        }
        json!({
            "success": true,
            "email": email,
            "message": format!("Password reset email sent to {email}"),
            "expires_in": "24 hours",
        })
    }

    fn process_refund(args: &Value) -> Value {
        let Some(order_id) = args["order_id"].as_str().filter(|s| !s.is_empty()) else {
            return json!({ "success": false, "error": "order id is required" });
        };
        let amount = args["amount"].as_f64().unwrap_or(0.0);
        if amount <= 0.0 {
            return json!({ "success": false, "error": "refund amount must be positive" });
        }
        let refund_id = format!("ref_{}", &Uuid::new_v4().simple().to_string()[..12]);
        json!({
            "success": true,
            "refund_id": refund_id,
            "order_id": order_id,
            "amount": amount,
            "status": "processed",
            "message": format!("Refund of ${amount:.2} processed for order {order_id}"),
        })
    }

    fn create_bug_report(args: &Value) -> Value {
        let Some(title) = args["title"].as_str().filter(|s| !s.is_empty()) else {
            return json!({ "success": false, "error": "bug title is required" });
        };
        let bug_id = format!("BUG-{}", &Uuid::new_v4().simple().to_string()[..6].to_uppercase());
        json!({
            "success": true,
            "bug_id": bug_id,
            "title": title,
            "status": "open",
        })
    }
}

#[async_trait]
impl ToolRegistry for SupportTools {
    async fn invoke(&self, call: &ToolCall) -> Result<Value, ToolError> {
        tracing::debug!(tool = %call.name, "invoking tool");
        match call.name.as_str() {
            "search_help_articles" => Ok(Self::search_help_articles(&call.args)),
            "fetch_customer_history" => Ok(Self::fetch_customer_history(&call.args)),
            "check_order_status" => Ok(Self::check_order_status(&call.args)),
            "send_password_reset" => Ok(Self::send_password_reset(&call.args)),
            "process_refund" => Ok(Self::process_refund(&call.args)),
            "create_bug_report" => Ok(Self::create_bug_report(&call.args)),
            other => Err(ToolError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refund_requires_approval() {
        let tools = SupportTools::new();
        assert!(tools.requires_approval("process_refund"));
        assert!(!tools.requires_approval("search_help_articles"));
        assert!(!tools.requires_approval("send_password_reset"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_permanent() {
        let tools = SupportTools::new();
        let err = tools
            .invoke(&ToolCall::new("frobnicate", json!({})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_refund_result_shape() {
        let tools = SupportTools::new();
        let result = tools
            .invoke(&ToolCall::new(
                "process_refund",
                json!({"order_id": "ord_123", "amount": 49.99, "reason": "defective"}),
            ))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["order_id"], "ord_123");
        assert!(result["refund_id"].as_str().unwrap().starts_with("ref_"));
    }

    #[tokio::test]
    async fn test_refund_rejects_bad_amount() {
        let tools = SupportTools::new();
        let result = tools
            .invoke(&ToolCall::new(
                "process_refund",
                json!({"order_id": "ord_123", "amount": -5.0}),
            ))
            .await
            .unwrap();
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn test_password_reset_validates_email() {
        let tools = SupportTools::new();
        let bad = tools
            .invoke(&ToolCall::new("send_password_reset", json!({"email": "nope"})))
            .await
            .unwrap();
        assert_eq!(bad["success"], false);

        let ok = tools
            .invoke(&ToolCall::new(
                "send_password_reset",
                json!({"email": "user@example.com"}),
            ))
            .await
            .unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["email"], "user@example.com");
    }
}

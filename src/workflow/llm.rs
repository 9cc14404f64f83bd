//! Language model seam for the draft step.
//!
//! The pipeline only ever talks to `LanguageModel`, so tests can swap in
//! models that time out or fail, and the default `TemplateModel` keeps
//! runs reproducible without any network dependency.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Model invocation errors.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model timed out after {0:?}")]
    Timeout(Duration),

    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Timeouts and outages are worth retrying; garbage output is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Timeout(_) | ModelError::Unavailable(_))
    }
}

/// Completes a prompt into response text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Deterministic model: returns the reply skeleton embedded in the prompt
/// verbatim. The draft step composes the full reply and uses the model as
/// a pass-through, so swapping in a real model changes wording, not
/// control flow.
#[derive(Default)]
pub struct TemplateModel;

impl TemplateModel {
    pub fn new() -> Self {
        Self
    }

    /// Marker the draft step places before the reply skeleton.
    pub const REPLY_MARKER: &'static str = "--- reply ---";
}

#[async_trait]
impl LanguageModel for TemplateModel {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let reply = prompt
            .split(Self::REPLY_MARKER)
            .nth(1)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ModelError::InvalidResponse("prompt carries no reply skeleton".to_string())
            })?;
        Ok(reply.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_template_model_echoes_skeleton() {
        let model = TemplateModel::new();
        let prompt = format!(
            "Context: billing ticket\n{}\nHello, your refund is on its way.",
            TemplateModel::REPLY_MARKER
        );
        let reply = model.complete(&prompt).await.unwrap();
        assert_eq!(reply, "Hello, your refund is on its way.");
    }

    #[tokio::test]
    async fn test_template_model_rejects_missing_skeleton() {
        let model = TemplateModel::new();
        let err = model.complete("no marker here").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ModelError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(ModelError::Unavailable("503".to_string()).is_transient());
        assert!(!ModelError::InvalidResponse("garbage".to_string()).is_transient());
    }
}

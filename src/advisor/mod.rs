//! Advisory filter: an optional second opinion on directional signals.
//!
//! The filter can only veto. When it is unconfigured or unreachable the
//! signal passes.

mod llm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{Bar, Signal};

pub use llm::LlmAdvisor;

/// Outcome of an advisory review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub approved: bool,
    /// Confidence, 0 to 100
    pub score: f64,
    pub reason: String,
}

impl Verdict {
    /// Verdict used when a configured advisor fails.
    pub fn fail_open(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            score: 50.0,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait AdvisoryFilter: Send + Sync {
    /// Review a candidate signal given the most recent bars.
    async fn review(&self, recent: &[Bar], signal: &Signal) -> Verdict;
}

/// Pass-through filter used when no advisor is configured.
pub struct AutoApprove;

#[async_trait]
impl AdvisoryFilter for AutoApprove {
    async fn review(&self, _recent: &[Bar], _signal: &Signal) -> Verdict {
        Verdict {
            approved: true,
            score: 0.0,
            reason: "advisor disabled".to_string(),
        }
    }
}

/// Advisor settings. The API key itself lives in the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorSettings {
    /// OpenAI-compatible API root
    pub base_url: String,
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Bars sent with each review
    pub context_bars: usize,
}

impl Default for AdvisorSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "TITAN_ADVISOR_API_KEY".to_string(),
            timeout_secs: 30,
            context_bars: 5,
        }
    }
}

/// Build the filter for these settings, reading the key from the environment.
pub fn from_settings(settings: &AdvisorSettings) -> Box<dyn AdvisoryFilter> {
    build(settings, std::env::var(&settings.api_key_env).ok())
}

/// The LLM advisor when a key is present, otherwise `AutoApprove`.
pub fn build(settings: &AdvisorSettings, api_key: Option<String>) -> Box<dyn AdvisoryFilter> {
    match api_key {
        Some(key) if !key.trim().is_empty() => match LlmAdvisor::new(settings.clone(), key) {
            Ok(advisor) => Box::new(advisor),
            Err(e) => {
                info!(error = %e, "Advisor client unavailable, auto-approving");
                Box::new(AutoApprove)
            }
        },
        _ => Box::new(AutoApprove),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_auto_approve() {
        let verdict = AutoApprove.review(&[], &Signal::none(dec!(100), "flat")).await;
        assert!(verdict.approved);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.reason, "advisor disabled");
    }

    #[tokio::test]
    async fn test_blank_key_builds_auto_approve() {
        let settings = AdvisorSettings::default();
        for key in [None, Some("  ".to_string())] {
            let filter = build(&settings, key);
            let verdict = filter.review(&[], &Signal::none(dec!(100), "flat")).await;
            assert_eq!(verdict.reason, "advisor disabled");
        }
    }
}

//! LLM-backed advisor over an OpenAI-compatible chat completions API.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::models::{Bar, Signal};

use super::{AdvisorSettings, AdvisoryFilter, Verdict};

const SYSTEM_PROMPT: &str = "You are a risk reviewer for a trend-following futures bot. \
Given recent candles and a proposed trade, answer only with JSON of the form \
{\"approved\": bool, \"score\": number 0-100, \"reason\": string}.";

pub struct LlmAdvisor {
    http: Client,
    settings: AdvisorSettings,
    api_key: String,
}

impl LlmAdvisor {
    pub fn new(settings: AdvisorSettings, api_key: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            settings,
            api_key,
        })
    }

    fn prompt(&self, recent: &[Bar], signal: &Signal) -> String {
        let start = recent.len().saturating_sub(self.settings.context_bars);
        let mut prompt = String::from("Recent candles (oldest first):\n");
        for bar in &recent[start..] {
            prompt.push_str(&format!(
                "{} O:{} H:{} L:{} C:{} V:{}",
                bar.timestamp.format("%Y-%m-%d %H:%M"),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume
            ));
            if let Some(ind) = bar.indicators {
                prompt.push_str(&format!(
                    " EMA:{:.2} MACD:{:.4}/{:.4} ATR:{:.4} ADX:{:.1}",
                    ind.trend_reference,
                    ind.momentum_fast,
                    ind.momentum_signal,
                    ind.volatility_range,
                    ind.directional_strength
                ));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "\nProposed: {} at {} (stop {}, target {}). Reason: {}\n",
            signal.direction.as_str(),
            signal.entry_price,
            signal.stop_loss_price,
            signal.take_profit_price,
            signal.rationale
        ));
        prompt
    }

    async fn ask(&self, prompt: String) -> Result<Verdict> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.1
        });

        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Advisor request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Advisor returned {} - {}", status, text);
        }

        let json: serde_json::Value = resp.json().await.context("Failed to parse advisor response")?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Missing content in advisor response"))?;

        parse_verdict(content)
    }
}

/// Parse the model's answer, tolerating markdown code fences around the JSON.
pub(crate) fn parse_verdict(content: &str) -> Result<Verdict> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(unfenced).with_context(|| format!("Advisor answer is not a verdict: {}", unfenced))
}

#[async_trait]
impl AdvisoryFilter for LlmAdvisor {
    async fn review(&self, recent: &[Bar], signal: &Signal) -> Verdict {
        match self.ask(self.prompt(recent, signal)).await {
            Ok(verdict) => {
                debug!(approved = verdict.approved, score = verdict.score, "Advisor verdict");
                verdict
            }
            Err(e) => {
                warn!(error = %e, "Advisor failed, passing signal");
                Verdict::fail_open(format!("advisor error: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_plain_and_fenced() {
        let plain = r#"{"approved": false, "score": 20, "reason": "choppy"}"#;
        let verdict = parse_verdict(plain).unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.score, 20.0);

        let fenced = "```json\n{\"approved\": true, \"score\": 81.5, \"reason\": \"clean trend\"}\n```";
        let verdict = parse_verdict(fenced).unwrap();
        assert!(verdict.approved);
        assert_eq!(verdict.reason, "clean trend");
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_verdict("Looks good to me").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_advisor_fails_open() {
        let settings = AdvisorSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..Default::default()
        };
        let advisor = LlmAdvisor::new(settings, "key".to_string()).unwrap();
        let signal = Signal {
            direction: Direction::Long,
            entry_price: dec!(100),
            stop_loss_price: dec!(95),
            take_profit_price: dec!(110),
            rationale: "test".to_string(),
        };

        let verdict = advisor.review(&[], &signal).await;
        assert!(verdict.approved);
        assert_eq!(verdict.score, 50.0);
        assert!(verdict.reason.starts_with("advisor error"));
    }
}

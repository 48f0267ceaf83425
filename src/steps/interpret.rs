//! Interpret: write the final answer

use super::{Step, StepContext, StepResult, Transition};
use crate::error::{ErrorKind, OrchestrationError};
use crate::llm::{LlmClient, PromptKind};
use crate::models::{StepName, TokenUsage};
use crate::prompts;
use crate::retry::with_retry;
use crate::state::{ErrorRecord, State, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct InterpretStep {
    ctx: StepContext,
}

impl InterpretStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    async fn ask_llm(&self, state: &State) -> Result<(String, TokenUsage)> {
        let errors: Vec<String> = state.errors.iter().map(ToString::to_string).collect();
        let prompt = prompts::interpretation(
            &state.question,
            state.execution_result.as_ref(),
            state.chart_plan.as_ref(),
            &state.notes,
            &errors,
            state.instructions.as_deref(),
        );
        let request = self
            .ctx
            .request(PromptKind::Interpretation, prompts::ANALYST_SYSTEM, prompt);

        let config = &self.ctx.config;
        let llm: &dyn LlmClient = self.ctx.llm.as_ref();
        let request_ref = &request;
        let response = with_retry(&config.retry, config.timeout(), "interpretation", move || {
            llm.generate(request_ref)
        })
        .await?;

        let answer = response.content.trim().to_string();
        if answer.is_empty() {
            return Err(OrchestrationError::LlmParseError(
                "the model returned an empty answer".to_string(),
            ));
        }
        Ok((answer, response.usage))
    }
}

#[async_trait]
impl Step for InterpretStep {
    fn name(&self) -> StepName {
        StepName::Interpret
    }

    async fn execute(&self, state: &State) -> Result<StepResult> {
        if state.datasets().is_empty() {
            info!("No datasets available, answering without the model");
            let update = StateUpdate {
                final_response: Some(no_data_answer(state)),
                ..Default::default()
            };
            return Ok(StepResult::proceed(update));
        }

        match self.ask_llm(state).await {
            Ok((answer, usage)) => {
                let update = StateUpdate {
                    final_response: Some(answer),
                    ..Default::default()
                };
                Ok(StepResult::proceed(update).with_usage(usage))
            }
            Err(e) if e.kind().is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "Interpretation failed, using fallback summary");
                let update = StateUpdate {
                    final_response: Some(fallback_summary(state)),
                    errors: vec![ErrorRecord::from_error(StepName::Interpret, &e)],
                    ..Default::default()
                };
                Ok(StepResult::proceed(update))
            }
        }
    }

    fn fallback(&self, _error: &OrchestrationError) -> Transition {
        Transition::Halt
    }
}

fn is_cjk(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c,
            '\u{4E00}'..='\u{9FFF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{3040}'..='\u{30FF}'
            | '\u{AC00}'..='\u{D7AF}')
    })
}

/// Fixed answer when Search produced nothing usable.
pub fn no_data_answer(state: &State) -> String {
    let upstream_failed = state
        .errors
        .iter()
        .any(|e| e.step == StepName::Search && e.kind == ErrorKind::Upstream);

    match (is_cjk(&state.question), upstream_failed) {
        (true, false) => format!("很抱歉，目前找不到與「{}」相關的資料集，因此無法回答這個問題。", state.question),
        (true, true) => format!("很抱歉，資料服務暫時無法連線，無法查詢與「{}」相關的資料，請稍後再試。", state.question),
        (false, false) => format!(
            "Sorry, no relevant datasets were found for \"{}\", so the question cannot be answered from the available data.",
            state.question
        ),
        (false, true) => format!(
            "Sorry, the data service could not be reached while looking up \"{}\". Please try again later.",
            state.question
        ),
    }
}

/// Plain summary of whatever data was retrieved, used when the model fails.
pub fn fallback_summary(state: &State) -> String {
    let cjk = is_cjk(&state.question);
    let mut out = if cjk {
        "無法產生分析說明，以下為取得的資料摘要：\n".to_string()
    } else {
        "An analysis could not be generated. Summary of the retrieved data:\n".to_string()
    };

    match &state.execution_result {
        Some(result) => {
            for table in &result.tables {
                out.push_str(&format!(
                    "\n- {} ({} rows; {})",
                    table.dataset_name,
                    table.total_rows,
                    table.columns.join(", ")
                ));
                for row in table.rows.iter().take(5) {
                    let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
                    out.push_str(&format!("\n    {}", cells.join(" | ")));
                }
            }
        }
        None => {
            let names: Vec<&str> = state.datasets().iter().map(|d| d.name.as_str()).collect();
            if cjk {
                out.push_str(&format!("\n找到的資料集：{}，但未能取得資料內容。", names.join("、")));
            } else {
                out.push_str(&format!("\nDatasets found: {}; no rows could be retrieved.", names.join(", ")));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockCatalog;
    use crate::config::{Config, Credentials, RetryPolicy};
    use crate::llm::MockLlm;
    use crate::models::DatasetDescriptor;
    use std::sync::Arc;

    fn step(llm: Arc<MockLlm>) -> InterpretStep {
        let config = Config {
            retry: RetryPolicy {
                max_retries: 0,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                llm_parse_retries: 1,
            },
            ..Config::default()
        };
        InterpretStep::new(StepContext::new(Arc::new(config), Arc::new(MockCatalog::new()), llm))
    }

    fn with_dataset(question: &str) -> State {
        let mut state = State::new(question, Credentials::new("id", "secret", "key"));
        state.search_results = Some(vec![DatasetDescriptor {
            id: "acc".to_string(),
            name: "Traffic accidents".to_string(),
            description: String::new(),
            source_url: "https://planet.example".to_string(),
            site_name: None,
        }]);
        state
    }

    #[tokio::test]
    async fn test_no_datasets_skips_model() {
        let llm = Arc::new(MockLlm::new());
        let state = State::new("哪個縣市的交通事故最多？", Credentials::new("id", "secret", "key"));

        let result = step(llm.clone()).execute(&state).await.unwrap();
        let answer = result.update.final_response.unwrap();
        assert!(answer.contains("找不到"));
        assert_eq!(llm.total_calls().await, 0);
    }

    #[tokio::test]
    async fn test_model_answer_used() {
        let llm = Arc::new(MockLlm::new().with_reply(PromptKind::Interpretation, "  Taichung has the most.  "));
        let result = step(llm).execute(&with_dataset("Where are most accidents?")).await.unwrap();
        assert_eq!(result.update.final_response.as_deref(), Some("Taichung has the most."));
        assert!(result.update.errors.is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_with_error_record() {
        let llm = Arc::new(MockLlm::new().with_reply(PromptKind::Interpretation, "   "));
        let result = step(llm).execute(&with_dataset("Where are most accidents?")).await.unwrap();

        assert!(result.update.final_response.unwrap().contains("Traffic accidents"));
        assert_eq!(result.update.errors.len(), 1);
        assert_eq!(result.update.errors[0].kind, ErrorKind::LlmParse);
    }

    #[tokio::test]
    async fn test_instructions_reach_prompt() {
        let llm = Arc::new(MockLlm::new().with_reply(PromptKind::Interpretation, "ok"));
        let state = with_dataset("q").with_instructions("Answer in bullet points.");
        step(llm.clone()).execute(&state).await.unwrap();

        let prompts = llm.prompts(PromptKind::Interpretation).await;
        assert!(prompts[0].contains("Answer in bullet points."));
    }

    #[test]
    fn test_language_detection() {
        assert!(is_cjk("交通事故"));
        assert!(is_cjk("東京の人口"));
        assert!(!is_cjk("traffic accidents"));
    }
}

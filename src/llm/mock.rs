//! Scripted LLM for development & testing
//!
//! Keeps the pipeline runnable without a provider key.

use super::{LlmClient, LlmProvider, LlmRequest, LlmResponse, PromptKind};
use crate::error::OrchestrationError;
use crate::models::TokenUsage;
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Default)]
struct Script {
    queued: HashMap<PromptKind, VecDeque<Result<String>>>,
    defaults: HashMap<PromptKind, String>,
    prompts: HashMap<PromptKind, Vec<String>>,
}

pub struct MockLlm {
    provider: LlmProvider,
    usage: TokenUsage,
    script: Mutex<Script>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
            script: Mutex::new(Script::default()),
        }
    }

    /// Answer every `kind` prompt with `text` once the queue is drained.
    pub fn with_reply(mut self, kind: PromptKind, text: impl Into<String>) -> Self {
        self.script.get_mut().defaults.insert(kind, text.into());
        self
    }

    /// Queue one answer (or failure) for the next `kind` prompt.
    pub fn with_queued(mut self, kind: PromptKind, reply: Result<String>) -> Self {
        self.script
            .get_mut()
            .queued
            .entry(kind)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_provider(mut self, provider: LlmProvider) -> Self {
        self.provider = provider;
        self
    }

    pub async fn calls(&self, kind: PromptKind) -> usize {
        self.script
            .lock()
            .await
            .prompts
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub async fn total_calls(&self) -> usize {
        self.script.lock().await.prompts.values().map(Vec::len).sum()
    }

    /// Prompts received for `kind`, oldest first.
    pub async fn prompts(&self, kind: PromptKind) -> Vec<String> {
        self.script
            .lock()
            .await
            .prompts
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    fn provider(&self) -> LlmProvider {
        self.provider
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let mut script = self.script.lock().await;
        script
            .prompts
            .entry(request.kind)
            .or_default()
            .push(request.prompt.clone());

        let reply = match script.queued.get_mut(&request.kind).and_then(VecDeque::pop_front) {
            Some(reply) => reply,
            None => script.defaults.get(&request.kind).cloned().ok_or_else(|| {
                OrchestrationError::UpstreamError(format!("no scripted reply for {:?}", request.kind))
            }),
        }?;

        Ok(LlmResponse {
            content: reply,
            usage: self.usage,
            model: "mock".to_string(),
        })
    }
}

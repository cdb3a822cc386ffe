//! The cognitive loop: strategy-driven reasoning (single-shot / CoT / ReAct)
//! over a registered tool set, with context engineering (compaction,
//! offloading) keeping prompts bounded as a run grows.

pub mod compactor;
pub mod offloader;
pub mod step;
pub mod strategy;
pub mod tool_executor;
pub mod working_memory;

mod llm;
pub use llm::{ChatMessage, HttpLlmProvider, LlmConfig, LlmProvider};

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::tools::registry::LocalToolDescriptor;
use crate::CognitiveError;

use compactor::{CompactionConfig, StepCompactor};
use step::Step;
use strategy::{
    build_cot_prompt, build_react_prompt_compacted, build_react_prompt_raw, build_react_system_prompt,
    parse_response, synthesize_answer, ParsedResponse, ToolPromptEntry, Turn,
};
use tool_executor::ToolExecutor;
use working_memory::WorkingMemory;

/// Selects which of the three reasoning strategies `CognitiveAgent::run` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStrategy {
    SingleShot,
    #[default]
    ReAct,
    ChainOfThought,
}

/// Construction-time configuration for a `CognitiveAgent` run.
#[derive(Debug, Clone)]
pub struct CognitiveConfig {
    pub system_prompt: Option<String>,
    pub thinking_strategy: ThinkingStrategy,
    pub max_iterations: usize,
    pub temperature: f32,
    pub use_compaction: bool,
    pub compaction: CompactionConfig,
    pub group_tools_by_category: bool,
    pub memory_window_size: usize,
    pub max_tools_exposed: usize,
}

impl Default for CognitiveConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            thinking_strategy: ThinkingStrategy::default(),
            max_iterations: 10,
            temperature: 0.7,
            use_compaction: false,
            compaction: CompactionConfig::default(),
            group_tools_by_category: false,
            memory_window_size: 50,
            max_tools_exposed: 32,
        }
    }
}

impl CognitiveConfig {
    pub fn react() -> Self {
        Self { thinking_strategy: ThinkingStrategy::ReAct, ..Default::default() }
    }

    pub fn single_shot() -> Self {
        Self { thinking_strategy: ThinkingStrategy::SingleShot, max_iterations: 1, ..Default::default() }
    }

    pub fn chain_of_thought() -> Self {
        Self { thinking_strategy: ThinkingStrategy::ChainOfThought, max_iterations: 1, ..Default::default() }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.use_compaction = true;
        self.compaction = config;
        self
    }
}

/// Result of one cognitive run. Always produced, even on failure — callers
/// should not rely on exceptions to discover per-iteration failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitiveResult {
    pub answer: String,
    pub steps: Vec<Step>,
    pub iterations: usize,
    pub success: bool,
    pub error: Option<String>,
    pub total_latency_ms: i64,
}

impl CognitiveResult {
    fn failed(steps: Vec<Step>, iterations: usize, error: String) -> Self {
        Self { answer: String::new(), steps, iterations, success: false, error: Some(error), total_latency_ms: 0 }
    }
}

/// Streamed unit of a `run_stream` call: LLM token, a just-completed tool
/// step, or the terminal result.
#[derive(Debug, Clone)]
pub enum CognitiveChunk {
    Token(String),
    StepCompleted(Step),
    Result(CognitiveResult),
}

/// Owns the per-run mutable state (working memory, step counter, approved
/// tools via `ToolExecutor`) and drives the configured reasoning strategy.
pub struct CognitiveAgent {
    config: CognitiveConfig,
    llm: Arc<dyn LlmProvider>,
    tool_executor: Arc<ToolExecutor>,
    tool_descriptors: Vec<LocalToolDescriptor>,
    memory: WorkingMemory,
}

impl CognitiveAgent {
    pub fn new(
        config: CognitiveConfig,
        llm: Arc<dyn LlmProvider>,
        tool_executor: Arc<ToolExecutor>,
        tool_descriptors: Vec<LocalToolDescriptor>,
    ) -> Self {
        let memory = WorkingMemory::new(config.memory_window_size);
        Self { config, llm, tool_executor, tool_descriptors, memory }
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.memory
    }

    pub fn working_memory_mut(&mut self) -> &mut WorkingMemory {
        &mut self.memory
    }

    fn tool_prompt_entries(&self) -> Vec<ToolPromptEntry> {
        self.tool_descriptors
            .iter()
            .take(self.config.max_tools_exposed)
            .map(|d| ToolPromptEntry {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters_schema: d.parameters_schema.clone(),
                category: step::categorize(&d.name).tag().to_string(),
            })
            .collect()
    }

    /// Runs the configured strategy to completion. Always returns a
    /// `CognitiveResult` — transport/LLM failures surface as
    /// `success = false` with `error` set, never as a propagated exception.
    pub async fn run(&mut self, goal: &str, context: Option<&[String]>) -> CognitiveResult {
        let truncated_goal: String = goal.chars().take(100).collect();
        let span = tracing::info_span!("cognitive.run", strategy = ?self.config.thinking_strategy, goal = %truncated_goal);

        async {
            self.tool_executor.reset_step_counter();
            self.memory.push("user", goal);
            if let Some(context) = context {
                for item in context {
                    self.memory.push("system", format!("Context: {item}"));
                }
            }

            let start = Instant::now();
            let mut result = match self.config.thinking_strategy {
                ThinkingStrategy::SingleShot => self.run_single_shot(goal).await,
                ThinkingStrategy::ChainOfThought => self.run_cot(goal).await,
                ThinkingStrategy::ReAct => self.run_react(goal).await,
            };
            result.total_latency_ms = start.elapsed().as_millis() as i64;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_single_shot(&mut self, goal: &str) -> CognitiveResult {
        let system = self.config.system_prompt.clone().unwrap_or_else(|| "You are a helpful AI assistant.".to_string());
        match self.llm.generate(goal, Some(&system), Some(self.config.temperature), None).await {
            Ok(answer) => {
                self.memory.push("assistant", &answer);
                CognitiveResult { answer, steps: Vec::new(), iterations: 1, success: true, error: None, total_latency_ms: 0 }
            }
            Err(err) => CognitiveResult::failed(Vec::new(), 1, llm_error_message(&err)),
        }
    }

    async fn run_cot(&mut self, goal: &str) -> CognitiveResult {
        let system = self.config.system_prompt.clone().unwrap_or_else(|| {
            "You are a helpful AI assistant. Think through problems step by step. Show your reasoning process clearly.".to_string()
        });
        let prompt = build_cot_prompt(goal);
        match self.llm.generate(&prompt, Some(&system), Some(self.config.temperature), None).await {
            Ok(answer) => {
                self.memory.push("assistant", &answer);
                CognitiveResult { answer, steps: Vec::new(), iterations: 1, success: true, error: None, total_latency_ms: 0 }
            }
            Err(err) => CognitiveResult::failed(Vec::new(), 1, llm_error_message(&err)),
        }
    }

    async fn run_react(&mut self, goal: &str) -> CognitiveResult {
        let tools = self.tool_prompt_entries();
        let system = build_react_system_prompt(self.config.system_prompt.as_deref(), &tools, self.config.group_tools_by_category);
        let compactor = StepCompactor::new(self.config.compaction.clone());

        let mut turns: Vec<Turn> = Vec::new();
        let mut iterations = 0usize;

        for i in 0..self.config.max_iterations {
            iterations = i + 1;
            let iter_span = tracing::info_span!("cognitive.react_iteration", iteration = iterations, goal = %goal.chars().take(100).collect::<String>());

            let prompt = if self.config.use_compaction {
                let action_steps: Vec<Step> = turns
                    .iter()
                    .filter_map(|t| match t {
                        Turn::Action { step, .. } => Some(step.clone()),
                        Turn::Thought(_) => None,
                    })
                    .collect();
                let compacted = compactor.compact(&action_steps);
                build_react_prompt_compacted(goal, &turns, &compacted)
            } else {
                build_react_prompt_raw(goal, &turns)
            };

            let think_span = tracing::info_span!(parent: &iter_span, "cognitive.think");
            let response = match self
                .llm
                .generate(&prompt, Some(&system), Some(self.config.temperature), None)
                .instrument(think_span)
                .await
            {
                Ok(r) => r,
                Err(err) => {
                    let steps = turns_into_steps(turns);
                    return CognitiveResult::failed(steps, iterations, llm_error_message(&err));
                }
            };

            match parse_response(&response) {
                ParsedResponse::FinalAnswer(answer) => {
                    self.memory.push("assistant", &answer);
                    let steps = turns_into_steps(turns);
                    return CognitiveResult { answer, steps, iterations, success: true, error: None, total_latency_ms: 0 };
                }
                ParsedResponse::ToolCall { reasoning, tool_name, args } => {
                    self.memory.push("assistant", format!("Thought: {reasoning}\nAction: {tool_name}"));
                    let step = self.tool_executor.execute(&tool_name, args).await;
                    let observation = if step.success { step.observation.clone() } else { step.error.clone().unwrap_or_else(|| step.observation.clone()) };
                    self.memory.push("system", format!("Observation: {observation}"));
                    turns.push(Turn::Action { reasoning, step });
                }
                ParsedResponse::Reasoning(text) => {
                    self.memory.push("assistant", format!("Thought: {text}"));
                    turns.push(Turn::Thought(text));
                }
            }
        }

        let answer = synthesize_answer(&turns);
        let success = !answer.is_empty();
        let steps = turns_into_steps(turns);
        CognitiveResult { answer, steps, iterations, success, error: None, total_latency_ms: 0 }
    }

    /// Streaming variant of `run` for `ThinkingStrategy::ReAct`: yields LLM
    /// token chunks as they stream in, a `StepCompleted` after every tool
    /// call, and finally the `CognitiveResult`. Non-ReAct strategies are
    /// single-shot: only a `Result` chunk is produced after the one call.
    pub fn run_stream<'a>(&'a mut self, goal: &'a str) -> BoxStream<'a, CognitiveChunk> {
        Box::pin(stream! {
            self.tool_executor.reset_step_counter();
            self.memory.push("user", goal);

            if !matches!(self.config.thinking_strategy, ThinkingStrategy::ReAct) {
                let result = self.run(goal, None).await;
                yield CognitiveChunk::Result(result);
                return;
            }

            let tools = self.tool_prompt_entries();
            let system = build_react_system_prompt(self.config.system_prompt.as_deref(), &tools, self.config.group_tools_by_category);
            let compactor = StepCompactor::new(self.config.compaction.clone());

            let mut turns: Vec<Turn> = Vec::new();
            let mut iterations = 0usize;
            let mut errored = false;
            let start = Instant::now();

            'outer: for i in 0..self.config.max_iterations {
                iterations = i + 1;
                let iter_span = tracing::info_span!("cognitive.react_iteration", iteration = iterations, goal = %goal.chars().take(100).collect::<String>());
                iter_span.in_scope(|| tracing::debug!("starting react iteration"));
                let think_span = tracing::info_span!(parent: &iter_span, "cognitive.think");

                let prompt = if self.config.use_compaction {
                    let action_steps: Vec<Step> = turns.iter().filter_map(|t| match t {
                        Turn::Action { step, .. } => Some(step.clone()),
                        Turn::Thought(_) => None,
                    }).collect();
                    let compacted = compactor.compact(&action_steps);
                    build_react_prompt_compacted(goal, &turns, &compacted)
                } else {
                    build_react_prompt_raw(goal, &turns)
                };

                let mut response = String::new();
                let stream_result = self
                    .llm
                    .generate_stream(&prompt, Some(&system), Some(self.config.temperature), None)
                    .instrument(think_span)
                    .await;
                match stream_result {
                    Ok(mut token_stream) => {
                        use futures::StreamExt;
                        while let Some(chunk) = token_stream.next().await {
                            match chunk {
                                Ok(token) => {
                                    response.push_str(&token);
                                    yield CognitiveChunk::Token(token);
                                }
                                Err(err) => {
                                    let steps = turns_into_steps(turns);
                                    let mut result = CognitiveResult::failed(steps, iterations, llm_error_message(&err));
                                    result.total_latency_ms = start.elapsed().as_millis() as i64;
                                    yield CognitiveChunk::Result(result);
                                    errored = true;
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let steps = turns_into_steps(turns);
                        let mut result = CognitiveResult::failed(steps, iterations, llm_error_message(&err));
                        result.total_latency_ms = start.elapsed().as_millis() as i64;
                        yield CognitiveChunk::Result(result);
                        errored = true;
                        break 'outer;
                    }
                }

                match parse_response(&response) {
                    ParsedResponse::FinalAnswer(answer) => {
                        self.memory.push("assistant", &answer);
                        let steps = turns_into_steps(turns);
                        let mut result = CognitiveResult { answer, steps, iterations, success: true, error: None, total_latency_ms: 0 };
                        result.total_latency_ms = start.elapsed().as_millis() as i64;
                        yield CognitiveChunk::Result(result);
                        return;
                    }
                    ParsedResponse::ToolCall { reasoning, tool_name, args } => {
                        self.memory.push("assistant", format!("Thought: {reasoning}\nAction: {tool_name}"));
                        let step = self.tool_executor.execute(&tool_name, args).await;
                        let observation = if step.success { step.observation.clone() } else { step.error.clone().unwrap_or_else(|| step.observation.clone()) };
                        self.memory.push("system", format!("Observation: {observation}"));
                        yield CognitiveChunk::StepCompleted(step.clone());
                        turns.push(Turn::Action { reasoning, step });
                    }
                    ParsedResponse::Reasoning(text) => {
                        self.memory.push("assistant", format!("Thought: {text}"));
                        turns.push(Turn::Thought(text));
                    }
                }
            }

            if !errored && iterations >= self.config.max_iterations {
                let answer = synthesize_answer(&turns);
                let success = !answer.is_empty();
                let steps = turns_into_steps(turns);
                let mut result = CognitiveResult { answer, steps, iterations, success, error: None, total_latency_ms: 0 };
                result.total_latency_ms = start.elapsed().as_millis() as i64;
                yield CognitiveChunk::Result(result);
            }
        })
    }
}

fn turns_into_steps(turns: Vec<Turn>) -> Vec<Step> {
    turns
        .into_iter()
        .filter_map(|t| match t {
            Turn::Action { step, .. } => Some(step),
            Turn::Thought(_) => None,
        })
        .collect()
}

fn llm_error_message(err: &CognitiveError) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventContext, PendingReplies};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream as FBoxStream};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        responses: Vec<String>,
        call_count: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self { responses: responses.into_iter().map(String::from).collect(), call_count: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(&self, _prompt: &str, _system: Option<&str>, _temperature: Option<f32>, _max_tokens: Option<u32>) -> crate::CognitiveResult<String> {
            let i = self.call_count.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses.get(i).cloned().unwrap_or_default())
        }

        async fn chat(&self, _messages: Vec<ChatMessage>, _temperature: Option<f32>, _max_tokens: Option<u32>) -> crate::CognitiveResult<String> {
            self.generate("", None, None, None).await
        }

        async fn generate_stream(
            &self,
            prompt: &str,
            system: Option<&str>,
            temperature: Option<f32>,
            max_tokens: Option<u32>,
        ) -> crate::CognitiveResult<FBoxStream<'static, crate::CognitiveResult<String>>> {
            let text = self.generate(prompt, system, temperature, max_tokens).await?;
            Ok(Box::pin(stream::iter(vec![Ok(text)])))
        }
    }

    fn make_tool_executor(workspace: PathBuf) -> Arc<ToolExecutor> {
        let (tx, _rx) = mpsc::channel(16);
        let ctx = EventContext::new("test-agent".to_string(), tx, PendingReplies::new(), "127.0.0.1:1".to_string());
        let offloader = offloader::DataOffloader::new(workspace.clone(), offloader::OffloadConfig::default());
        Arc::new(ToolExecutor::new(ctx, offloader, workspace, None))
    }

    #[tokio::test]
    async fn single_shot_returns_one_iteration() {
        let llm = Arc::new(ScriptedLlm::new(vec!["hello there"]));
        let dir = tempfile::tempdir().unwrap();
        let tool_executor = make_tool_executor(dir.path().to_path_buf());
        let mut agent = CognitiveAgent::new(CognitiveConfig::single_shot(), llm, tool_executor, vec![]);

        let result = agent.run("say hi", None).await;
        assert_eq!(result.answer, "hello there");
        assert_eq!(result.iterations, 1);
        assert!(result.success);
    }

    #[tokio::test]
    async fn react_halts_on_final_answer() {
        let llm = Arc::new(ScriptedLlm::new(vec!["FINAL ANSWER: done"]));
        let dir = tempfile::tempdir().unwrap();
        let tool_executor = make_tool_executor(dir.path().to_path_buf());
        let mut agent = CognitiveAgent::new(CognitiveConfig::react().with_max_iterations(5), llm, tool_executor, vec![]);

        let result = agent.run("do the thing", None).await;
        assert_eq!(result.answer, "done");
        assert_eq!(result.iterations, 1);
        assert!(result.success);
    }

    #[tokio::test]
    async fn react_exhausts_iterations_and_synthesizes() {
        let llm = Arc::new(ScriptedLlm::new(vec!["Thought: still working", "Thought: still working"]));
        let dir = tempfile::tempdir().unwrap();
        let tool_executor = make_tool_executor(dir.path().to_path_buf());
        let mut agent = CognitiveAgent::new(CognitiveConfig::react().with_max_iterations(2), llm, tool_executor, vec![]);

        let result = agent.run("do the thing", None).await;
        assert_eq!(result.iterations, 2);
        assert!(result.answer.contains("still working"));
    }
}

//! Tool-calling refinement of a bug's candidate list into a ranked, justified
//! list of files.
//!
//! The loop is a small state machine. Each iteration sends the conversation
//! with a tool-choice policy derived from the iteration number; a response
//! with tool calls is answered through [`ToolBackends`] and the loop moves on,
//! a response without tool calls ends it.

use std::sync::Arc;

use genloc_index::SourceLanguage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chat::{ChatClient, ChatError, ChatMessage, ChatRequest, ChatResponse, ToolChoice, Usage};
use crate::tools::{tool_definitions, ToolBackends};
use crate::transcript::{Transcript, TranscriptError, TranscriptEvent};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPolicy {
    Required,
    Optional,
    Forbidden,
}

impl ToolPolicy {
    pub fn tool_choice(self) -> ToolChoice {
        match self {
            ToolPolicy::Required => ToolChoice::Required,
            ToolPolicy::Optional => ToolChoice::Auto,
            ToolPolicy::Forbidden => ToolChoice::None,
        }
    }
}

/// Tools are mandatory on the first turn and disabled on the second to last,
/// leaving the final turns for an answer.
pub fn tool_policy(iteration: usize, max_iterations: usize) -> ToolPolicy {
    if iteration == 0 {
        ToolPolicy::Required
    } else if iteration + 2 == max_iterations {
        ToolPolicy::Forbidden
    } else {
        ToolPolicy::Optional
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Iterating(usize),
    Done { iteration: usize },
    Exhausted,
}

pub fn transition(state: LoopState, response: &ChatResponse, max_iterations: usize) -> LoopState {
    match state {
        LoopState::Iterating(iteration) if !response.has_tool_calls() => LoopState::Done { iteration },
        LoopState::Iterating(iteration) if iteration + 1 >= max_iterations => LoopState::Exhausted,
        LoopState::Iterating(iteration) => LoopState::Iterating(iteration + 1),
        terminal => terminal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub file: String,
    pub justification: String,
}

/// Final structured answer requested from the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedResponse {
    pub analysis_of_the_bug_report: String,
    pub ranked_list: Vec<RankedEntry>,
}

impl RankedResponse {
    pub fn parse(content: &str) -> Option<Self> {
        serde_json::from_str(content.trim()).ok()
    }
}

pub fn response_format() -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "output_format",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "analysis_of_the_bug_report": {
                        "type": "string",
                        "description": "What the bug report describes and where the fault most likely lives."
                    },
                    "ranked_list": {
                        "type": "array",
                        "description": "Files most likely to contain the bug, most likely first.",
                        "items": {
                            "type": "object",
                            "properties": {
                                "file": { "type": "string" },
                                "justification": { "type": "string" }
                            },
                            "required": ["file", "justification"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["analysis_of_the_bug_report", "ranked_list"],
                "additionalProperties": false
            }
        }
    })
}

fn language_label(language: SourceLanguage) -> &'static str {
    match language {
        SourceLanguage::Python => "Python",
        SourceLanguage::Java => "Java",
    }
}

pub fn system_prompt(language: SourceLanguage, max_iterations: usize, ranked_limit: usize) -> String {
    let language = language_label(language);
    format!(
        "You are a debugging assistant that localizes bugs in a {language} codebase.\n\
         You work iteratively: read the bug report, decide which lookups would narrow the search, \
         call the available tools, and refine your hypothesis with every result.\n\
         Prefer concrete evidence from the code over guesses. Use file and method names mentioned \
         in the report first; fall back to the candidate files when the report gives no strong hint.\n\
         You have at most {max_iterations} turns. When you are confident, stop calling tools and \
         answer with up to {ranked_limit} files ranked from most to least likely to contain the bug, \
         each with a short justification. Use file paths exactly as the tools return them."
    )
}

pub fn user_prompt(report: &str) -> String {
    format!(
        "Given a bug report, find the files in the codebase that most likely need to change to fix it.\n\n\
         Bug Report:\n{report}"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Done,
    Exhausted,
    Malformed,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Done => "done",
            LoopStatus::Exhausted => "exhausted",
            LoopStatus::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    /// Zero-based iteration of the final answer, or `max_iterations` when
    /// the loop ran out of turns.
    pub iteration: usize,
    pub analysis: Option<String>,
    pub ranked_list: Vec<RankedEntry>,
    pub usage: Option<Usage>,
}

impl LoopOutcome {
    fn without_answer(status: LoopStatus, iteration: usize, usage: Option<Usage>) -> Self {
        Self {
            status,
            iteration,
            analysis: None,
            ranked_list: Vec::new(),
            usage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    pub language: SourceLanguage,
    pub max_iterations: usize,
    pub ranked_limit: usize,
}

pub struct RefinementLoop {
    client: Arc<dyn ChatClient>,
    settings: LoopSettings,
}

impl RefinementLoop {
    pub fn new(client: Arc<dyn ChatClient>, settings: LoopSettings) -> Self {
        Self { client, settings }
    }

    pub async fn run(
        &self,
        bug_id: &str,
        report: &str,
        tools: &ToolBackends,
        transcript: &mut Transcript,
    ) -> Result<LoopOutcome, AgentError> {
        let settings = &self.settings;
        let definitions = tool_definitions(settings.language);
        let mut messages = vec![
            ChatMessage::System {
                content: system_prompt(settings.language, settings.max_iterations, settings.ranked_limit),
            },
            ChatMessage::User {
                content: user_prompt(report),
            },
        ];

        let mut state = LoopState::Iterating(0);
        let mut usage = None;
        let outcome = loop {
            let LoopState::Iterating(iteration) = state else {
                break LoopOutcome::without_answer(LoopStatus::Exhausted, settings.max_iterations, usage);
            };

            let policy = tool_policy(iteration, settings.max_iterations);
            let choice = policy.tool_choice();
            transcript
                .record(TranscriptEvent::IterationStarted {
                    iteration,
                    tool_choice: format!("{choice:?}").to_lowercase(),
                })
                .await?;

            let request = ChatRequest {
                model: settings.model.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
                tool_choice: Some(choice),
                response_format: Some(response_format()),
            };
            let response = self.client.complete(&request).await?;
            if let Some(current) = &response.usage {
                transcript
                    .record(TranscriptEvent::Usage {
                        iteration,
                        usage: current.clone(),
                    })
                    .await?;
                usage = Some(current.clone());
            }
            messages.push(response.to_message());

            state = transition(state, &response, settings.max_iterations);
            if state == LoopState::Exhausted {
                break LoopOutcome::without_answer(LoopStatus::Exhausted, settings.max_iterations, usage);
            }
            if let LoopState::Done { iteration } = state {
                transcript
                    .record(TranscriptEvent::FinalResponse {
                        iteration,
                        content: response.content.clone(),
                    })
                    .await?;
                break self.final_answer(bug_id, iteration, response.content.as_deref(), usage);
            }

            match self
                .answer_tool_calls(bug_id, iteration, &response, tools, transcript)
                .await?
            {
                Some(replies) => messages.extend(replies),
                None => break LoopOutcome::without_answer(LoopStatus::Malformed, iteration, usage),
            }
        };

        transcript
            .record(TranscriptEvent::Finished {
                status: outcome.status.as_str().to_string(),
                iterations: outcome.iteration,
            })
            .await?;
        match outcome.status {
            LoopStatus::Done => info!(
                bug_id,
                iteration = outcome.iteration,
                ranked = outcome.ranked_list.len(),
                "Refinement finished"
            ),
            LoopStatus::Exhausted => warn!(bug_id, "Refinement ran out of iterations"),
            LoopStatus::Malformed => warn!(bug_id, "Model output was malformed; ranked list is empty"),
        }
        Ok(outcome)
    }

    /// Tool messages answering every call in `response`, or `None` when a
    /// call's arguments do not fit its schema.
    async fn answer_tool_calls(
        &self,
        bug_id: &str,
        iteration: usize,
        response: &ChatResponse,
        tools: &ToolBackends,
        transcript: &mut Transcript,
    ) -> Result<Option<Vec<ChatMessage>>, AgentError> {
        let mut replies = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            transcript
                .record(TranscriptEvent::ToolCall {
                    iteration,
                    call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                })
                .await?;

            let result = match tools.dispatch(&call.function.name, &call.function.arguments) {
                Ok(result) => result,
                Err(error) => {
                    warn!(bug_id, iteration, tool = %call.function.name, %error, "Rejected tool call");
                    return Ok(None);
                }
            };
            debug!(bug_id, iteration, tool = %call.function.name, "Answered tool call");

            replies.push(ChatMessage::Tool {
                tool_call_id: call.id.clone(),
                name: call.function.name.clone(),
                content: result.to_string(),
            });
            transcript
                .record(TranscriptEvent::ToolResult {
                    iteration,
                    call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    result,
                })
                .await?;
        }
        Ok(Some(replies))
    }

    fn final_answer(
        &self,
        bug_id: &str,
        iteration: usize,
        content: Option<&str>,
        usage: Option<Usage>,
    ) -> LoopOutcome {
        let Some(parsed) = content.and_then(RankedResponse::parse) else {
            warn!(bug_id, iteration, "Final response is not a ranked list");
            return LoopOutcome::without_answer(LoopStatus::Malformed, iteration, usage);
        };
        let mut ranked_list = parsed.ranked_list;
        ranked_list.truncate(self.settings.ranked_limit);
        LoopOutcome {
            status: LoopStatus::Done,
            iteration,
            analysis: Some(parsed.analysis_of_the_bug_report),
            ranked_list,
            usage,
        }
    }
}

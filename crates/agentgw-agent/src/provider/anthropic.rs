//! Anthropic Messages API streaming provider.
//!
//! The Anthropic SSE format pairs `event:` and `data:` lines. Text arrives
//! as `text_delta` content blocks; tool use arrives as a `tool_use` block
//! start (id + name) followed by `input_json_delta` fragments that must be
//! concatenated and parsed when the block closes. The system prompt is a
//! top-level field rather than a message, and tool results travel as
//! user-role `tool_result` content blocks.

use futures::StreamExt;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::provider::{LlmProvider, TextSink};
use crate::types::{ChatRequest, Completion, FinishReason, Message, Role, ToolCall, Usage};

/// Default Anthropic API base URL.
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Request timeout bounding a silent hang.
const REQUEST_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Streaming client for the Anthropic Messages API.
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    /// Create a client for the given key and default model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: "anthropic".into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AgentError::ProviderRequest {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            api_key,
            base_url: ANTHROPIC_BASE_URL.to_owned(),
            model: model.into(),
            max_tokens: 4096,
        })
    }

    /// Override the endpoint base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the default per-turn token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    // -----------------------------------------------------------------------
    // Request building
    // -----------------------------------------------------------------------

    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let (system, messages) = split_system(&request.messages);

        let mut body = json!({
            "model": if request.model.is_empty() { &self.model } else { &request.model },
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "messages": messages,
            "stream": true,
        });

        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        body
    }
}

/// Pull system messages out into a single top-level string and convert the
/// rest of the conversation to the Messages API wire shape.
fn split_system(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                // Only one system block is allowed; concatenate extras.
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User => wire.push(json!({ "role": "user", "content": msg.content })),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire.push(json!({ "role": "assistant", "content": msg.content }));
                } else {
                    let mut content: Vec<Value> = Vec::new();
                    if !msg.content.is_empty() {
                        content.push(json!({ "type": "text", "text": msg.content }));
                    }
                    for tc in &msg.tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    wire.push(json!({ "role": "assistant", "content": content }));
                }
            }
            Role::Tool => wire.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id,
                    "content": msg.content,
                }],
            })),
        }
    }

    (system, wire)
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ChatRequest, on_text: TextSink<'_>) -> Result<Completion> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(request);

        debug!(provider = "anthropic", url = %url, model = %body["model"], "sending LLM request");

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::ProviderRequest {
                reason: format!("API returned {status}: {text}"),
            });
        }

        let mut parser = SseParser::default();
        let mut accumulator = StreamAccumulator::default();
        let mut byte_stream = resp.bytes_stream();
        let mut line_buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| AgentError::ProviderStream {
                reason: format!("stream read error: {e}"),
            })?;
            let text = std::str::from_utf8(&chunk).map_err(|e| AgentError::ProviderStream {
                reason: format!("invalid UTF-8 in stream: {e}"),
            })?;
            line_buffer.push_str(text);

            while let Some(newline_pos) = line_buffer.find('\n') {
                let line = line_buffer[..newline_pos].to_owned();
                line_buffer = line_buffer[newline_pos + 1..].to_owned();

                if let Some(delta) = accumulator.feed(parser.parse_line(&line)?) {
                    on_text(&delta);
                }
                if accumulator.stopped {
                    return accumulator.into_completion();
                }
            }
        }

        accumulator.into_completion()
    }
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

/// Typed view of one Anthropic stream event.
#[derive(Debug)]
enum StreamEvent {
    BlockStart {
        block_type: String,
        id: Option<String>,
        name: Option<String>,
    },
    TextDelta(String),
    InputJsonDelta(String),
    MessageDelta {
        stop_reason: Option<String>,
        output_tokens: Option<u32>,
    },
    MessageStart {
        input_tokens: Option<u32>,
    },
    MessageStop,
}

/// Parses raw `event:`/`data:` line pairs into [`StreamEvent`]s.
///
/// Holds the most recent `event:` type because an SSE event spans two lines.
#[derive(Debug, Default)]
struct SseParser {
    current_event_type: Option<String>,
}

impl SseParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>> {
        let line = line.trim_end();

        if line.starts_with(':') || line.is_empty() {
            return Ok(None);
        }

        if let Some(event_type) = line.strip_prefix("event: ") {
            self.current_event_type = Some(event_type.to_owned());
            return Ok(None);
        }

        let Some(data) = line.strip_prefix("data: ") else {
            return Ok(None);
        };

        let event_type = self
            .current_event_type
            .take()
            .unwrap_or_else(|| "unknown".into());

        match event_type.as_str() {
            "message_start" => {
                let v = parse_json(data)?;
                Ok(Some(StreamEvent::MessageStart {
                    input_tokens: v["message"]["usage"]["input_tokens"]
                        .as_u64()
                        .map(|t| t as u32),
                }))
            }
            "content_block_start" => {
                let v = parse_json(data)?;
                let block = &v["content_block"];
                Ok(Some(StreamEvent::BlockStart {
                    block_type: block["type"].as_str().unwrap_or_default().to_owned(),
                    id: block["id"].as_str().map(String::from),
                    name: block["name"].as_str().map(String::from),
                }))
            }
            "content_block_delta" => {
                let v = parse_json(data)?;
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => Ok(Some(StreamEvent::TextDelta(
                        delta["text"].as_str().unwrap_or_default().to_owned(),
                    ))),
                    Some("input_json_delta") => Ok(Some(StreamEvent::InputJsonDelta(
                        delta["partial_json"].as_str().unwrap_or_default().to_owned(),
                    ))),
                    other => {
                        tracing::trace!(delta_type = ?other, "ignoring unknown delta type");
                        Ok(None)
                    }
                }
            }
            "message_delta" => {
                let v = parse_json(data)?;
                Ok(Some(StreamEvent::MessageDelta {
                    stop_reason: v["delta"]["stop_reason"].as_str().map(String::from),
                    output_tokens: v["usage"]["output_tokens"].as_u64().map(|t| t as u32),
                }))
            }
            "message_stop" => Ok(Some(StreamEvent::MessageStop)),
            "ping" | "content_block_stop" => Ok(None),
            _ => {
                if data.trim() == "[DONE]" {
                    Ok(Some(StreamEvent::MessageStop))
                } else {
                    tracing::trace!(event_type, "ignoring unknown SSE event type");
                    Ok(None)
                }
            }
        }
    }
}

fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|e| AgentError::ProviderStream {
        reason: format!("invalid JSON in SSE data: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Stream accumulator
// ---------------------------------------------------------------------------

/// Assembles a [`Completion`] from parsed stream events.
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    builders: Vec<ToolUseBuilder>,
    stop_reason: Option<String>,
    usage: Usage,
    stopped: bool,
}

/// In-progress `tool_use` block.
#[derive(Debug)]
struct ToolUseBuilder {
    id: String,
    name: String,
    input_json: String,
}

impl StreamAccumulator {
    /// Apply one event. Returns a text delta when one should be forwarded.
    fn feed(&mut self, event: Option<StreamEvent>) -> Option<String> {
        match event? {
            StreamEvent::BlockStart {
                block_type,
                id,
                name,
            } => {
                if block_type == "tool_use" {
                    self.builders.push(ToolUseBuilder {
                        id: id.unwrap_or_default(),
                        name: name.unwrap_or_default(),
                        input_json: String::new(),
                    });
                }
                None
            }
            StreamEvent::TextDelta(t) => {
                self.text.push_str(&t);
                Some(t)
            }
            StreamEvent::InputJsonDelta(j) => {
                if let Some(builder) = self.builders.last_mut() {
                    builder.input_json.push_str(&j);
                }
                None
            }
            StreamEvent::MessageStart { input_tokens } => {
                if let Some(t) = input_tokens {
                    self.usage.input_tokens = t;
                }
                None
            }
            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if let Some(t) = output_tokens {
                    self.usage.output_tokens = t;
                }
                None
            }
            StreamEvent::MessageStop => {
                self.stopped = true;
                None
            }
        }
    }

    fn into_completion(self) -> Result<Completion> {
        let tool_calls: Result<Vec<ToolCall>> = self
            .builders
            .into_iter()
            .map(|b| {
                let arguments: Value = if b.input_json.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&b.input_json).map_err(|e| AgentError::ProviderParse {
                        reason: format!("invalid JSON in tool call `{}` input: {e}", b.name),
                    })?
                };
                Ok(ToolCall {
                    id: b.id,
                    name: b.name,
                    arguments,
                })
            })
            .collect();
        let tool_calls = tool_calls?;

        let finish = match self.stop_reason.as_deref() {
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };

        Ok(Completion {
            text: self.text,
            tool_calls,
            finish,
            usage: self.usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

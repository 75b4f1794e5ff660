//! OpenAI-compatible streaming provider.
//!
//! Talks to the Chat Completions API in SSE mode: `data:` lines carrying
//! `choices[].delta` payloads terminated by a `data: [DONE]` sentinel. Tool
//! calls arrive fragmented (the id and function name in the first chunk for
//! a given `index`, argument JSON spread over the rest) and are reassembled
//! here before the completion is returned.
//!
//! xAI's Grok API speaks the same wire format, so the Grok provider is this
//! client pointed at the x.ai endpoint.

use futures::StreamExt;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::provider::{LlmProvider, TextSink};
use crate::types::{ChatRequest, Completion, FinishReason, Message, Role, ToolCall, Usage};

/// Default OpenAI API base URL.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default xAI API base URL (OpenAI-compatible surface).
const XAI_BASE_URL: &str = "https://api.x.ai/v1";

/// Request timeout. Streams can be long-lived; this bounds a silent hang.
const REQUEST_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Streaming client for OpenAI-compatible chat-completion endpoints.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    provider_name: &'static str,
}

impl OpenAiProvider {
    /// Client for api.openai.com.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Self::build(api_key.into(), model.into(), OPENAI_BASE_URL, "openai")
    }

    /// Client for xAI's Grok models via the OpenAI-compatible surface.
    pub fn xai(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Self::build(api_key.into(), model.into(), XAI_BASE_URL, "xai")
    }

    fn build(
        api_key: String,
        model: String,
        base_url: &str,
        provider_name: &'static str,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: provider_name.into(),
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
            base_url: base_url.to_owned(),
            model,
            max_tokens: 4096,
            provider_name,
        })
    }

    /// Override the endpoint base URL (self-hosted compatible servers).
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
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();

        let mut body = json!({
            "model": if request.model.is_empty() { &self.model } else { &request.model },
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        body
    }
}

/// Convert one conversation message into the Chat Completions wire shape.
fn wire_message(msg: &Message) -> Value {
    match msg.role {
        Role::System => json!({ "role": "system", "content": msg.content }),
        Role::User => json!({ "role": "user", "content": msg.content }),
        Role::Assistant => {
            if msg.tool_calls.is_empty() {
                json!({ "role": "assistant", "content": msg.content })
            } else {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                // Arguments travel as a JSON *string* on this API.
                                "arguments": tc.arguments.to_string(),
                            },
                        })
                    })
                    .collect();
                let content = if msg.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(msg.content.clone())
                };
                json!({ "role": "assistant", "content": content, "tool_calls": calls })
            }
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.provider_name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: &ChatRequest, on_text: TextSink<'_>) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request_body(request);

        debug!(provider = self.provider_name, url = %url, model = %body["model"], "sending LLM request");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
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

                if let Some(delta) = accumulator.feed_line(&line)? {
                    on_text(&delta);
                }
                if accumulator.done {
                    return accumulator.into_completion();
                }
            }
        }

        // Stream ended without [DONE]; normalize what arrived.
        accumulator.into_completion()
    }
}

// ---------------------------------------------------------------------------
// Stream accumulator
// ---------------------------------------------------------------------------

/// Assembles a [`Completion`] from Chat Completions SSE lines.
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    builders: Vec<ToolCallBuilder>,
    finish_reason: Option<String>,
    usage: Usage,
    done: bool,
}

/// In-progress tool call keyed by the delta `index` field.
#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    /// Feed one SSE line. Returns a text delta when one is present.
    fn feed_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }

        let Some(data) = line.strip_prefix("data: ") else {
            // `event:` or other SSE fields; this API only uses `data:`.
            return Ok(None);
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::ProviderStream {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        if let Some(reason) = v["choices"][0]["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_owned());
        }

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            if let Some(input) = usage["prompt_tokens"].as_u64() {
                self.usage.input_tokens = input as u32;
            }
            if let Some(output) = usage["completion_tokens"].as_u64() {
                self.usage.output_tokens = output as u32;
            }
        }

        let delta = &v["choices"][0]["delta"];
        if delta.is_null() {
            return Ok(None);
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                while self.builders.len() <= index {
                    self.builders.push(ToolCallBuilder::default());
                }
                let builder = &mut self.builders[index];

                if let Some(id) = tc["id"].as_str() {
                    builder.id = id.to_owned();
                }
                let func = &tc["function"];
                if let Some(name) = func["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(args) = func["arguments"].as_str() {
                    builder.arguments.push_str(args);
                }
            }
        }

        if let Some(content) = delta["content"].as_str() {
            self.text.push_str(content);
            return Ok(Some(content.to_owned()));
        }

        Ok(None)
    }

    /// Finalize into a [`Completion`], reassembling tool-call arguments.
    fn into_completion(self) -> Result<Completion> {
        let tool_calls: Result<Vec<ToolCall>> = self
            .builders
            .into_iter()
            .map(|b| {
                let arguments: Value = if b.arguments.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&b.arguments).map_err(|e| AgentError::ProviderParse {
                        reason: format!("invalid JSON in tool call `{}` arguments: {e}", b.name),
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

        let finish = match self.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some("tool_calls") => FinishReason::ToolCalls,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolDefinition;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::openai("test-key", "gpt-test").unwrap()
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(OpenAiProvider::openai("", "gpt-test").is_err());
        assert!(OpenAiProvider::xai("", "grok-test").is_err());
    }

    #[test]
    fn xai_uses_its_own_surface() {
        let p = OpenAiProvider::xai("k", "grok-test").unwrap();
        assert_eq!(p.name(), "xai");
        assert_eq!(p.base_url, XAI_BASE_URL);
    }

    #[test]
    fn request_body_basic() {
        let p = provider();
        let request = ChatRequest {
            model: String::new(),
            messages: vec![Message::system("Be terse."), Message::user("Hello")],
            tools: vec![],
            temperature: Some(0.5),
            max_tokens: Some(128),
        };

        let body = p.build_request_body(&request);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn request_body_with_tools_and_results() {
        let p = provider();
        let request = ChatRequest {
            model: "gpt-other".into(),
            messages: vec![
                Message::user("add 2 and 3"),
                Message::assistant_with_tool_calls(
                    "",
                    vec![ToolCall {
                        id: "call_1".into(),
                        name: "add".into(),
                        arguments: json!({"a": 2, "b": 3}),
                    }],
                ),
                Message::tool_result("call_1", "5"),
            ],
            tools: vec![ToolDefinition {
                name: "add".into(),
                description: "Add two integers".into(),
                input_schema: json!({"type": "object"}),
            }],
            temperature: None,
            max_tokens: None,
        };

        let body = p.build_request_body(&request);
        assert_eq!(body["model"], "gpt-other");
        assert_eq!(body["tools"][0]["function"]["name"], "add");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], "assistant");
        assert!(messages[1]["content"].is_null());
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
        // Arguments must be a JSON-encoded string on the wire.
        assert!(messages[1]["tool_calls"][0]["function"]["arguments"].is_string());
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn text_deltas_accumulate() {
        let mut acc = StreamAccumulator::default();
        let d1 = acc
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(d1.as_deref(), Some("Hel"));
        let d2 = acc
            .feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":"lo"}}]}"#)
            .unwrap();
        assert_eq!(d2.as_deref(), Some("lo"));
        acc.feed_line(r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap();
        acc.feed_line("data: [DONE]").unwrap();
        assert!(acc.done);

        let completion = acc.into_completion().unwrap();
        assert_eq!(completion.text, "Hello");
        assert_eq!(completion.finish, FinishReason::Stop);
        assert!(completion.tool_calls.is_empty());
    }

    #[test]
    fn fragmented_tool_call_reassembles() {
        let mut acc = StreamAccumulator::default();
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"add","arguments":""}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":2,"}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"b\":3}"}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
        )
        .unwrap();
        acc.feed_line("data: [DONE]").unwrap();

        let completion = acc.into_completion().unwrap();
        assert_eq!(completion.finish, FinishReason::ToolCalls);
        assert_eq!(completion.tool_calls.len(), 1);
        let call = &completion.tool_calls[0];
        assert_eq!(call.id, "call_9");
        assert_eq!(call.name, "add");
        assert_eq!(call.arguments, json!({"a": 2, "b": 3}));
    }

    #[test]
    fn parallel_tool_calls_keep_emission_order() {
        let mut acc = StreamAccumulator::default();
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"first","arguments":"{}"}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"c2","function":{"name":"second","arguments":"{}"}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line("data: [DONE]").unwrap();

        let completion = acc.into_completion().unwrap();
        let names: Vec<&str> = completion
            .tool_calls
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn malformed_tool_arguments_are_a_parse_error() {
        let mut acc = StreamAccumulator::default();
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"bad","arguments":"{not json"}}]}}]}"#,
        )
        .unwrap();
        acc.feed_line("data: [DONE]").unwrap();

        let result = acc.into_completion();
        assert!(matches!(result, Err(AgentError::ProviderParse { .. })));
    }

    #[test]
    fn length_finish_is_preserved() {
        let mut acc = StreamAccumulator::default();
        acc.feed_line(r#"data: {"choices":[{"index":0,"delta":{"content":"partial"}}]}"#)
            .unwrap();
        acc.feed_line(r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"length"}]}"#)
            .unwrap();
        acc.feed_line("data: [DONE]").unwrap();

        let completion = acc.into_completion().unwrap();
        assert_eq!(completion.finish, FinishReason::Length);
        assert_eq!(completion.text, "partial");
    }

    #[test]
    fn usage_is_captured_from_final_chunk() {
        let mut acc = StreamAccumulator::default();
        acc.feed_line(
            r#"data: {"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7}}"#,
        )
        .unwrap();
        acc.feed_line("data: [DONE]").unwrap();

        let completion = acc.into_completion().unwrap();
        assert_eq!(completion.usage.input_tokens, 12);
        assert_eq!(completion.usage.output_tokens, 7);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let mut acc = StreamAccumulator::default();
        assert!(acc.feed_line("").unwrap().is_none());
        assert!(acc.feed_line(": keepalive").unwrap().is_none());
        assert!(acc.feed_line("event: whatever").unwrap().is_none());
        assert!(!acc.done);
    }
}

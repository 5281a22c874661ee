use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req);
        debug!(model = %req.model, "sending request to Anthropic");

        let resp = self.request(&body).send().await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let mut body = build_request_body(req);
        body["stream"] = serde_json::json!(true);

        debug!(model = %req.model, "sending streaming request to Anthropic");

        let resp = self.request(&body).send().await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic streaming API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        process_stream(resp, tx).await;
        Ok(())
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "system": req.system,
        "messages": messages,
        "stream": false,
    });

    if let Some(budget) = req.thinking_budget {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": budget,
        });
    }

    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let text_parts: Vec<String> = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        })
        .collect();

    ChatResponse {
        content: text_parts.join(""),
        model: resp.model,
        tokens_in: resp.usage.input_tokens,
        tokens_out: resp.usage.output_tokens,
        stop_reason: resp.stop_reason.unwrap_or_default(),
    }
}

/// Drive an SSE response through the decoder, forwarding each decoded
/// event until the byte stream ends or the receiver goes away.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut decoder = SseDecoder::new();
    let mut pending = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        // Chunk boundaries land anywhere; only feed whole lines and keep
        // the unterminated tail buffered for the next chunk.
        pending.push_str(text);
        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(event) = decoder.feed_line(line) {
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }

    let _ = tx.send(decoder.finish()).await;
}

/// Incremental decoder for the messages SSE stream.
///
/// The wire interleaves `event:` and `data:` lines; the decoder remembers
/// which event the next data payload belongs to, which content block is
/// currently open, and the usage counters that only become known piecemeal.
struct SseDecoder {
    event_name: String,
    open_block: OpenBlock,
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

/// The content block currently being streamed, if any.
///
/// Tool-use input arrives as partial JSON fragments and is only parseable
/// once the block closes, so it accumulates here.
enum OpenBlock {
    None,
    Text,
    Thinking,
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

impl OpenBlock {
    fn from_start(payload: &serde_json::Value) -> Self {
        let Some(block) = payload.get("content_block") else {
            return OpenBlock::None;
        };
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => OpenBlock::Text,
            Some("thinking") => OpenBlock::Thinking,
            Some("tool_use") => OpenBlock::ToolUse {
                id: block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input_json: String::new(),
            },
            _ => OpenBlock::None,
        }
    }
}

impl SseDecoder {
    fn new() -> Self {
        Self {
            event_name: String::new(),
            open_block: OpenBlock::None,
            model: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: String::new(),
        }
    }

    /// Feed one non-empty SSE line. Returns an event when the line
    /// completes something a consumer can observe.
    fn feed_line(&mut self, line: &str) -> Option<StreamEvent> {
        match parse_sse_line(line)? {
            SseParsed::Event(name) => {
                self.event_name = name;
                None
            }
            SseParsed::Data(data) => self.feed_data(&data),
        }
    }

    fn feed_data(&mut self, data: &str) -> Option<StreamEvent> {
        if self.event_name == "error" {
            warn!(data, "anthropic stream error");
            return Some(StreamEvent::Error {
                message: data.to_string(),
            });
        }

        let payload: serde_json::Value = serde_json::from_str(data).ok()?;
        match self.event_name.as_str() {
            "message_start" => {
                if let Some(model) = payload.pointer("/message/model").and_then(|v| v.as_str()) {
                    self.model = model.to_string();
                }
                if let Some(n) = payload
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.tokens_in = n as u32;
                }
                None
            }
            "content_block_start" => {
                self.open_block = OpenBlock::from_start(&payload);
                None
            }
            "content_block_delta" => self.apply_delta(&payload),
            "content_block_stop" => self.close_block(),
            "message_delta" => {
                if let Some(n) = payload
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.tokens_out = n as u32;
                }
                if let Some(reason) = payload
                    .pointer("/delta/stop_reason")
                    .and_then(|v| v.as_str())
                {
                    self.stop_reason = reason.to_string();
                }
                None
            }
            // message_stop, ping, and anything new — nothing to do
            _ => None,
        }
    }

    fn apply_delta(&mut self, payload: &serde_json::Value) -> Option<StreamEvent> {
        let delta = payload.get("delta")?;
        match delta.get("type").and_then(|v| v.as_str())? {
            "text_delta" => {
                let text = delta.get("text").and_then(|v| v.as_str())?;
                debug!(len = text.len(), "stream text delta");
                Some(StreamEvent::TextDelta {
                    text: text.to_string(),
                })
            }
            "thinking_delta" => {
                let text = delta.get("thinking").and_then(|v| v.as_str())?;
                debug!(len = text.len(), "stream thinking delta");
                Some(StreamEvent::Thinking {
                    text: text.to_string(),
                })
            }
            "input_json_delta" => {
                if let OpenBlock::ToolUse { input_json, .. } = &mut self.open_block {
                    if let Some(fragment) = delta.get("partial_json").and_then(|v| v.as_str()) {
                        input_json.push_str(fragment);
                    }
                }
                None
            }
            other => {
                debug!(delta_type = other, "unhandled delta type");
                None
            }
        }
    }

    /// A closing tool_use block yields its event with the now-complete
    /// input; text and thinking were already streamed out as deltas.
    fn close_block(&mut self) -> Option<StreamEvent> {
        match std::mem::replace(&mut self.open_block, OpenBlock::None) {
            OpenBlock::ToolUse {
                id,
                name,
                input_json,
            } => {
                let input = serde_json::from_str(&input_json)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                Some(StreamEvent::ToolUse { id, name, input })
            }
            _ => None,
        }
    }

    /// Byte stream exhausted: everything left is the final accounting.
    fn finish(self) -> StreamEvent {
        StreamEvent::Done {
            model: self.model,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            stop_reason: self.stop_reason,
        }
    }
}

// Anthropic non-streaming API types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    #[allow(dead_code)]
    Thinking { thinking: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut SseDecoder, lines: &[&str]) -> Vec<StreamEvent> {
        lines
            .iter()
            .filter_map(|line| decoder.feed_line(line))
            .collect()
    }

    #[test]
    fn text_deltas_stream_through() {
        let mut decoder = SseDecoder::new();
        let events = feed(
            &mut decoder,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"text"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"text_delta","text":"hel"}}"#,
                r#"data: {"delta":{"type":"text_delta","text":"lo"}}"#,
            ],
        );
        match &events[..] {
            [StreamEvent::TextDelta { text: a }, StreamEvent::TextDelta { text: b }] => {
                assert_eq!(a, "hel");
                assert_eq!(b, "lo");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn tool_use_input_assembles_from_fragments() {
        let mut decoder = SseDecoder::new();
        let events = feed(
            &mut decoder,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"tool_use","id":"tu_1","name":"Bash"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"{\"cmd\":"}}"#,
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"\"ls\"}"}}"#,
                "event: content_block_stop",
                "data: {}",
            ],
        );
        match &events[..] {
            [StreamEvent::ToolUse { id, name, input }] => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "Bash");
                assert_eq!(input["cmd"], serde_json::json!("ls"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn closing_a_text_block_emits_nothing_extra() {
        let mut decoder = SseDecoder::new();
        let events = feed(
            &mut decoder,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"text"}}"#,
                "event: content_block_stop",
                "data: {}",
            ],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn usage_and_stop_reason_land_in_done() {
        let mut decoder = SseDecoder::new();
        feed(
            &mut decoder,
            &[
                "event: message_start",
                r#"data: {"message":{"model":"claude-sonnet-4-6","usage":{"input_tokens":7}}}"#,
                "event: message_delta",
                r#"data: {"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
            ],
        );
        match decoder.finish() {
            StreamEvent::Done {
                model,
                tokens_in,
                tokens_out,
                stop_reason,
            } => {
                assert_eq!(model, "claude-sonnet-4-6");
                assert_eq!(tokens_in, 7);
                assert_eq!(tokens_out, 9);
                assert_eq!(stop_reason, "end_turn");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn error_events_surface_verbatim() {
        let mut decoder = SseDecoder::new();
        let events = feed(
            &mut decoder,
            &[
                "event: error",
                r#"data: {"type":"overloaded_error","message":"overloaded"}"#,
            ],
        );
        match &events[..] {
            [StreamEvent::Error { message }] => assert!(message.contains("overloaded")),
            other => panic!("unexpected events: {other:?}"),
        }
    }
}

pub mod claude;
pub mod openai;

use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageInput>,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            images: Vec::new(),
        }
    }
}

/// Image sent inline with a message, base64 encoded.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageInput {
    pub mime_type: String,
    pub data: String,
}

impl ImageInput {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Wire protocol spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions, also served by OpenRouter, Groq, Mistral and friends.
    Openai,
    Anthropic,
    /// Local Ollama through its OpenAI-compatible endpoint; no key required.
    Ollama,
}

/// Unified LLM provider. Dispatches to the OpenAI-compatible or Claude backend.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Claude(claude::ClaudeConfig),
    Ollama(openai::OpenAiConfig),
}

impl Provider {
    pub fn new(kind: ProviderKind, base_url: &str, api_key: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        match kind {
            ProviderKind::Openai => Provider::OpenAi(openai::OpenAiConfig { api_key, base_url }),
            ProviderKind::Anthropic => Provider::Claude(claude::ClaudeConfig { api_key, base_url }),
            ProviderKind::Ollama => Provider::Ollama(openai::OpenAiConfig {
                api_key: String::new(),
                base_url,
            }),
        }
    }

    /// Sends the request and checks the status. Provider errors surface here,
    /// before any byte of the stream reaches the caller.
    pub async fn open_stream(
        &self,
        client: &Client,
        request: &ChatRequest,
    ) -> Result<CompletionStream, LlmError> {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::open_stream(client, config, request).await
            }
            Provider::Claude(config) => claude::open_stream(client, config, request).await,
        }
    }
}

/// An accepted streaming response, not yet consumed.
pub struct CompletionStream {
    kind: StreamKind,
    response: reqwest::Response,
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    OpenAi,
    Claude,
}

impl CompletionStream {
    /// Drives the stream to the end, reporting every text delta to `on_chunk`.
    pub async fn collect(
        self,
        on_chunk: impl Fn(StreamChunk) + Send,
    ) -> Result<Completion, LlmError> {
        match self.kind {
            StreamKind::OpenAi => openai::read_stream(self.response, on_chunk).await,
            StreamKind::Claude => claude::read_stream(self.response, on_chunk).await,
        }
    }
}

/// Splits a server-sent-events byte stream into `data:` payloads. Bytes are
/// buffered until a full line arrives so multi-byte characters split across
/// network chunks decode correctly.
#[derive(Default)]
pub(crate) struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim().strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }

    /// Whatever is left once the connection closes without a final newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).to_string();
        rest.trim()
            .strip_prefix("data:")
            .map(|data| data.trim_start().to_string())
    }
}

/// Best-effort human readable message from a provider error body.
pub fn extract_error_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let detail = value
            .pointer("/error/message")
            .or_else(|| value.get("error").filter(|e| e.is_string()))
            .or_else(|| value.get("message"))
            .or_else(|| value.get("detail"))
            .and_then(|v| v.as_str());
        if let Some(detail) = detail {
            return detail.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "provider returned an empty error response".to_string();
    }
    trimmed.chars().take(500).collect()
}

pub(crate) async fn api_error(resp: reqwest::Response) -> LlmError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    LlmError::Api {
        status,
        message: extract_error_detail(&text),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_lines_split_across_chunks() {
        let mut lines = SseLines::default();
        assert!(lines.push(b"data: {\"a\":").is_empty());
        let out = lines.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_sse_lines_keep_multibyte_characters() {
        let mut lines = SseLines::default();
        let payload = "data: héllo\n".as_bytes();
        let (a, b) = payload.split_at(8);
        assert!(lines.push(a).is_empty());
        assert_eq!(lines.push(b), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_sse_lines_ignore_event_lines_and_flush_tail() {
        let mut lines = SseLines::default();
        assert!(lines.push(b"event: ping\n").is_empty());
        assert!(lines.push(b"data: tail").is_empty());
        assert_eq!(lines.finish().as_deref(), Some("tail"));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_extract_error_detail() {
        assert_eq!(
            extract_error_detail(r#"{"error":{"message":"Incorrect API key","type":"auth"}}"#),
            "Incorrect API key"
        );
        assert_eq!(
            extract_error_detail(r#"{"error":"model 'x' not found"}"#),
            "model 'x' not found"
        );
        assert_eq!(extract_error_detail("Bad Gateway"), "Bad Gateway");
        assert_eq!(
            extract_error_detail("   "),
            "provider returned an empty error response"
        );
    }

    #[test]
    fn test_provider_kind_selects_backend() {
        let p = Provider::new(ProviderKind::Ollama, "http://localhost:11434/v1/", "ignored".into());
        match p {
            Provider::Ollama(config) => {
                assert!(config.api_key.is_empty());
                assert_eq!(config.base_url, "http://localhost:11434/v1");
            }
            other => panic!("unexpected provider {:?}", other),
        }
    }
}

use super::{
    api_error, ChatMessage, ChatRequest, Completion, CompletionStream, LlmError, SseLines,
    StreamChunk, StreamKind,
};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct ClaudeMessage {
    role: String,
    content: ClaudeContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClaudeStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: ClaudeStartMessage },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ClaudeDelta },
    #[serde(rename = "message_delta")]
    MessageDelta { usage: Option<ClaudeUsage> },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "error")]
    Error { error: ClaudeErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ClaudeStartMessage {
    usage: Option<ClaudeUsage>,
}

#[derive(Deserialize)]
struct ClaudeUsage {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
}

#[derive(Deserialize)]
struct ClaudeDelta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ClaudeErrorBody {
    message: String,
}

fn to_claude_message(message: &ChatMessage) -> ClaudeMessage {
    let content = if message.images.is_empty() {
        ClaudeContent::Text(message.content.clone())
    } else {
        let mut blocks: Vec<ClaudeBlock> = message
            .images
            .iter()
            .map(|image| ClaudeBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: image.mime_type.clone(),
                    data: image.data.clone(),
                },
            })
            .collect();
        blocks.push(ClaudeBlock::Text {
            text: message.content.clone(),
        });
        ClaudeContent::Blocks(blocks)
    };
    ClaudeMessage {
        role: message.role.clone(),
        content,
    }
}

/// System messages move to the top-level `system` field, joined in order.
fn build_request(request: &ChatRequest) -> ClaudeRequest {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();

    let messages: Vec<ClaudeMessage> = request
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(to_claude_message)
        .collect();

    ClaudeRequest {
        model: request.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        stream: true,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        temperature: request.temperature,
    }
}

pub async fn open_stream(
    client: &Client,
    config: &ClaudeConfig,
    request: &ChatRequest,
) -> Result<CompletionStream, LlmError> {
    let body = build_request(request);

    let resp = client
        .post(format!("{}/v1/messages", config.base_url))
        .header("Content-Type", "application/json")
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(api_error(resp).await);
    }

    Ok(CompletionStream {
        kind: StreamKind::Claude,
        response: resp,
    })
}

/// Applies one event; `Ok(true)` once the message is complete.
fn apply_payload(
    data: &str,
    completion: &mut Completion,
    on_chunk: &impl Fn(StreamChunk),
) -> Result<bool, LlmError> {
    let Ok(event) = serde_json::from_str::<ClaudeStreamEvent>(data) else {
        tracing::debug!(payload = data, "skipping unparseable stream payload");
        return Ok(false);
    };
    match event {
        ClaudeStreamEvent::MessageStart { message } => {
            if let Some(usage) = message.usage {
                completion.usage.prompt_tokens = usage.input_tokens;
            }
        }
        ClaudeStreamEvent::ContentBlockDelta { delta } => {
            if let Some(text) = delta.text {
                completion.content.push_str(&text);
                on_chunk(StreamChunk {
                    delta: text,
                    done: false,
                });
            }
        }
        ClaudeStreamEvent::MessageDelta { usage } => {
            if let Some(usage) = usage {
                completion.usage.completion_tokens = usage.output_tokens;
            }
        }
        ClaudeStreamEvent::MessageStop {} => return Ok(true),
        ClaudeStreamEvent::Error { error } => return Err(LlmError::Stream(error.message)),
        ClaudeStreamEvent::Other => {}
    }
    Ok(false)
}

pub async fn read_stream(
    resp: reqwest::Response,
    on_chunk: impl Fn(StreamChunk) + Send,
) -> Result<Completion, LlmError> {
    let mut completion = Completion::default();
    let mut stream = resp.bytes_stream();
    let mut lines = SseLines::default();

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for data in lines.push(&chunk) {
            if apply_payload(&data, &mut completion, &on_chunk)? {
                break 'outer;
            }
        }
    }
    if let Some(data) = lines.finish() {
        apply_payload(&data, &mut completion, &on_chunk)?;
    }

    on_chunk(StreamChunk {
        delta: String::new(),
        done: true,
    });
    Ok(completion)
}

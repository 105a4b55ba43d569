use super::{
    api_error, ChatMessage, ChatRequest, Completion, CompletionStream, LlmError, SseLines,
    StreamChunk, StreamKind, Usage,
};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: OpenAiContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

fn to_openai_message(message: &ChatMessage) -> OpenAiMessage {
    let content = if message.images.is_empty() {
        OpenAiContent::Text(message.content.clone())
    } else {
        let mut parts = vec![OpenAiPart::Text {
            text: message.content.clone(),
        }];
        parts.extend(message.images.iter().map(|image| OpenAiPart::ImageUrl {
            image_url: ImageUrl {
                url: image.data_url(),
            },
        }));
        OpenAiContent::Parts(parts)
    };
    OpenAiMessage {
        role: message.role.clone(),
        content,
    }
}

pub async fn open_stream(
    client: &Client,
    config: &OpenAiConfig,
    request: &ChatRequest,
) -> Result<CompletionStream, LlmError> {
    let body = OpenAiRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(to_openai_message).collect(),
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };

    let mut req = client
        .post(format!("{}/chat/completions", config.base_url))
        .header("Content-Type", "application/json")
        .json(&body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }

    let resp = req.send().await?;

    if !resp.status().is_success() {
        return Err(api_error(resp).await);
    }

    Ok(CompletionStream {
        kind: StreamKind::OpenAi,
        response: resp,
    })
}

/// Applies one `data:` payload; returns `true` once the stream is finished.
fn apply_payload(
    data: &str,
    completion: &mut Completion,
    on_chunk: &impl Fn(StreamChunk),
) -> bool {
    if data == "[DONE]" {
        return true;
    }
    let Ok(parsed) = serde_json::from_str::<OpenAiStreamResponse>(data) else {
        tracing::debug!(payload = data, "skipping unparseable stream payload");
        return false;
    };
    if let Some(usage) = parsed.usage {
        completion.usage = Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        };
    }
    if let Some(choice) = parsed.choices.first() {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                completion.content.push_str(content);
                on_chunk(StreamChunk {
                    delta: content.clone(),
                    done: false,
                });
            }
        }
        if let Some(reason) = &choice.finish_reason {
            tracing::debug!(finish_reason = %reason, "completion finished");
        }
    }
    false
}

// The usage chunk follows the `finish_reason` chunk, so reading continues
// until `[DONE]` or the end of the body.
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
            if apply_payload(&data, &mut completion, &on_chunk) {
                break 'outer;
            }
        }
    }
    if let Some(data) = lines.finish() {
        apply_payload(&data, &mut completion, &on_chunk);
    }

    on_chunk(StreamChunk {
        delta: String::new(),
        done: true,
    });
    Ok(completion)
}

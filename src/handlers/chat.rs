use super::conversations::truncate_title;
use super::{ApiJson, AppState};
use crate::auth::AuthUser;
use crate::config::ProviderConfig;
use crate::db::conversations::NewConversation;
use crate::db::messages::NewMessage;
use crate::db::models::{Attachment, Conversation, Persona, PersonaMemory, Role};
use crate::db::{DbError, MAIN_BRANCH};
use crate::error::{AppError, FieldError, Result};
use crate::llm::{ChatMessage, ChatRequest, ImageInput, Provider, StreamChunk, Usage};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub conversation_id: Option<String>,
    pub branch: Option<String>,
    /// `{provider}/{model}`, e.g. `openai/gpt-4o`.
    pub model: String,
    pub messages: Vec<IncomingMessage>,
    pub api_key: Option<String>,
    pub persona_id: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct DeltaEvent<'a> {
    delta: &'a str,
}

#[derive(Debug, Serialize)]
struct DoneEvent {
    conversation_id: String,
    branch: String,
    user_message_id: String,
    assistant_message_id: String,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct ErrorEvent {
    error: String,
}

fn validate(body: &ChatBody) -> Result<()> {
    let mut errors = Vec::new();
    if body.model.trim().is_empty() {
        errors.push(FieldError::new("model", "model is required"));
    }
    match body.messages.last() {
        None => errors.push(FieldError::new("messages", "at least one message is required")),
        Some(last) if last.role != Role::User => errors.push(FieldError::new(
            "messages",
            "the last message must come from the user",
        )),
        Some(last) if last.content.trim().is_empty() && last.attachment_ids.is_empty() => {
            errors.push(FieldError::new("messages", "the last message is empty"))
        }
        _ => {}
    }
    if let Some(t) = body.temperature {
        if !(0.0..=2.0).contains(&t) {
            errors.push(FieldError::new("temperature", "temperature must be between 0 and 2"));
        }
    }
    if body.max_tokens == Some(0) {
        errors.push(FieldError::new("max_tokens", "max_tokens must be positive"));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(errors))
    }
}

/// Splits `provider/model`. The model part may itself contain slashes.
pub fn split_model(model: &str) -> Option<(&str, &str)> {
    model
        .split_once('/')
        .filter(|(provider, id)| !provider.is_empty() && !id.is_empty())
}

/// Picks the provider and the key for this request. Only the caller's own key
/// is ever used.
fn resolve_provider<'a>(
    state: &'a AppState,
    model: &str,
    api_key: Option<&str>,
) -> Result<(&'a ProviderConfig, String, String)> {
    let (name, model_id) = split_model(model)
        .ok_or_else(|| AppError::field("model", "model must look like provider/model"))?;
    let provider = state
        .config
        .provider(name)
        .ok_or_else(|| AppError::field("model", format!("unknown provider {}", name)))?;

    let api_key = api_key.map(str::trim).filter(|k| !k.is_empty());
    let api_key = match (provider.requires_key, api_key) {
        (true, None) => return Err(AppError::MissingApiKey(provider.name.clone())),
        (_, key) => key.unwrap_or_default().to_string(),
    };
    Ok((provider, model_id.to_string(), api_key))
}

/// Request prompt wins, then the persona with its memories, then the
/// conversation's own prompt.
pub fn build_system_prompt(
    request_prompt: Option<&str>,
    persona: Option<(&Persona, &[PersonaMemory])>,
    conversation_prompt: Option<&str>,
) -> Option<String> {
    if let Some(prompt) = request_prompt.filter(|p| !p.trim().is_empty()) {
        return Some(prompt.to_string());
    }
    if let Some((persona, memories)) = persona {
        let mut prompt = persona.system_prompt.clone();
        if !memories.is_empty() {
            prompt.push_str("\n\nThings to remember about the user:");
            for memory in memories {
                prompt.push_str("\n- ");
                prompt.push_str(&memory.content);
            }
        }
        return Some(prompt);
    }
    conversation_prompt
        .filter(|p| !p.trim().is_empty())
        .map(str::to_string)
}

/// Text block appended to the user message for an attached document.
pub fn document_block(file_name: &str, text: &str) -> String {
    format!("\n\n[Attached file: {}]\n{}", file_name, text)
}

fn resolve_persona(
    state: &AppState,
    user_id: &str,
    requested: Option<&str>,
    conversation: &Conversation,
) -> Result<Option<(Persona, Vec<PersonaMemory>)>> {
    let persona = match requested.or(conversation.persona_id.as_deref()) {
        Some(id) => Some(state.db.get_persona(user_id, id)?),
        None => default_persona(state, user_id)?,
    };
    match persona {
        Some(persona) => {
            let memories = state.db.list_memories(user_id, &persona.id)?;
            Ok(Some((persona, memories)))
        }
        None => Ok(None),
    }
}

/// The persona chosen in settings, falling back to the one flagged
/// `is_default`. A setting left pointing at a deleted persona is skipped.
fn default_persona(state: &AppState, user_id: &str) -> Result<Option<Persona>> {
    if let Some(id) = state.db.get_settings(user_id)?.default_persona_id {
        match state.db.get_persona(user_id, &id) {
            Ok(persona) => return Ok(Some(persona)),
            Err(DbError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(state.db.default_persona(user_id)?)
}

/// Writes a new conversation, with its `main` branch, before any message.
fn create_conversation(state: &AppState, user_id: &str, body: &ChatBody) -> Result<Conversation> {
    let first_user = body
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| truncate_title(&m.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New conversation".to_string());
    let conversation = state.db.create_conversation(
        user_id,
        NewConversation {
            id: body.conversation_id.clone(),
            title: first_user,
            model: body.model.clone(),
            system_prompt: None,
            persona_id: body.persona_id.clone(),
        },
    )?;
    tracing::info!(conversation_id = %conversation.id, "conversation created from chat");
    Ok(conversation)
}

/// Builds the outgoing user message: images inline as base64, document text
/// appended to the content.
async fn inline_attachments(
    state: &AppState,
    content: &str,
    attachments: &[Attachment],
) -> Result<ChatMessage> {
    let mut message = ChatMessage::text("user", content);
    for attachment in attachments {
        if attachment.is_image() {
            let bytes = state.store.get(&attachment.storage_path).await?;
            message.images.push(ImageInput {
                mime_type: attachment.mime_type.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            });
        } else if let Some(text) = &attachment.extracted_text {
            message
                .content
                .push_str(&document_block(&attachment.file_name, text));
        }
    }
    Ok(message)
}

fn sse_event(name: &str, payload: &impl Serialize) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    ApiJson(body): ApiJson<ChatBody>,
) -> Result<Response> {
    validate(&body)?;
    let (provider_config, model_id, api_key) =
        resolve_provider(&state, &body.model, body.api_key.as_deref())?;
    let Some(last) = body.messages.last() else {
        return Err(AppError::field("messages", "at least one message is required"));
    };

    // Everything the request points at is checked before the first write.
    if let Some(persona_id) = body.persona_id.as_deref() {
        state.db.get_persona(&user.id, persona_id)?;
    }
    let attachments = state.db.get_attachments(&user.id, &last.attachment_ids)?;
    let outgoing = inline_attachments(&state, &last.content, &attachments).await?;
    let existing = match body.conversation_id.as_deref() {
        Some(id) => state.db.find_conversation(&user.id, id)?,
        None => None,
    };
    if let Some(branch) = body.branch.as_deref() {
        match &existing {
            Some(conversation) => {
                state.db.get_branch(&user.id, &conversation.id, branch)?;
            }
            None if branch != MAIN_BRANCH => return Err(DbError::NotFound("branch").into()),
            None => {}
        }
    }

    let conversation = match existing {
        Some(conversation) => conversation,
        None => create_conversation(&state, &user.id, &body)?,
    };
    let branch = match body.branch.clone() {
        Some(branch) => branch,
        None => state.db.active_branch(&user.id, &conversation.id)?,
    };
    let history = state
        .db
        .list_messages(&user.id, &conversation.id, Some(&branch))?;

    let persona = resolve_persona(&state, &user.id, body.persona_id.as_deref(), &conversation)?;
    let system_prompt = build_system_prompt(
        body.system_prompt.as_deref(),
        persona.as_ref().map(|(p, m)| (p, m.as_slice())),
        conversation.system_prompt.as_deref(),
    );
    let temperature = body
        .temperature
        .or_else(|| persona.as_ref().and_then(|(p, _)| p.temperature));
    let max_tokens = body.max_tokens.or_else(|| {
        persona
            .as_ref()
            .and_then(|(p, _)| p.max_tokens)
            .and_then(|m| u32::try_from(m).ok())
    });

    let mut messages = Vec::new();
    if let Some(prompt) = system_prompt {
        messages.push(ChatMessage::text("system", prompt));
    }
    if history.is_empty() {
        // A fresh branch has nothing stored yet; earlier client turns are context only.
        let earlier = &body.messages[..body.messages.len() - 1];
        messages.extend(
            earlier
                .iter()
                .map(|m| ChatMessage::text(m.role.as_str(), m.content.clone())),
        );
    } else {
        messages.extend(
            history
                .iter()
                .map(|m| ChatMessage::text(m.role.as_str(), m.content.clone())),
        );
    }
    messages.push(outgoing);

    let mut user_message = NewMessage::new(&conversation.id, &branch, Role::User, &last.content);
    user_message.attachments = attachments.iter().map(Attachment::to_ref).collect();
    let user_message = state.db.add_message(&user.id, user_message)?;

    let request = ChatRequest {
        messages,
        model: model_id,
        temperature,
        max_tokens,
    };
    let provider = Provider::new(provider_config.kind, &provider_config.base_url, api_key);
    let stream = provider.open_stream(&state.http, &request).await?;

    tracing::info!(
        conversation_id = %conversation.id,
        branch = %branch,
        model = %body.model,
        "streaming completion"
    );

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let task_state = state.clone();
    let user_id = user.id.clone();
    let conversation_id = conversation.id.clone();
    let model = body.model.clone();
    tokio::spawn(async move {
        let chunk_tx = tx.clone();
        let on_chunk = move |chunk: StreamChunk| {
            if !chunk.done && !chunk.delta.is_empty() {
                // A closed receiver means the client left; keep collecting anyway.
                let _ = chunk_tx.send(sse_event("delta", &DeltaEvent { delta: &chunk.delta }));
            }
        };

        let completion = match stream.collect(on_chunk).await {
            Ok(completion) => completion,
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, "completion failed: {}", e);
                let _ = tx.send(sse_event(
                    "error",
                    &ErrorEvent {
                        error: e.to_string(),
                    },
                ));
                return;
            }
        };

        let mut assistant = NewMessage::new(
            &conversation_id,
            &branch,
            Role::Assistant,
            &completion.content,
        );
        assistant.parent_message_id = Some(user_message.id.clone());
        assistant.model = Some(model);
        assistant.completion_tokens = completion.usage.completion_tokens;

        let saved = task_state
            .db
            .add_message(&user_id, assistant)
            .and_then(|assistant| {
                task_state
                    .db
                    .record_usage(&user_message.id, completion.usage.prompt_tokens, None)?;
                Ok(assistant)
            });
        match saved {
            Ok(assistant) => {
                let _ = tx.send(sse_event(
                    "done",
                    &DoneEvent {
                        conversation_id,
                        branch,
                        user_message_id: user_message.id,
                        assistant_message_id: assistant.id,
                        usage: completion.usage,
                    },
                ));
            }
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, "failed to save completion: {}", e);
                let _ = tx.send(sse_event(
                    "error",
                    &ErrorEvent {
                        error: "failed to save the response".to_string(),
                    },
                ));
            }
        }
    });

    let events = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let headers = [("x-conversation-id", conversation.id)];
    Ok((headers, Sse::new(events).keep_alive(KeepAlive::default())).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(prompt: &str) -> Persona {
        Persona {
            id: "p1".into(),
            user_id: "u1".into(),
            name: "Tutor".into(),
            system_prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            is_default: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn memory(content: &str) -> PersonaMemory {
        PersonaMemory {
            id: "m1".into(),
            persona_id: "p1".into(),
            content: content.into(),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_split_model() {
        assert_eq!(split_model("openai/gpt-4o"), Some(("openai", "gpt-4o")));
        assert_eq!(
            split_model("openrouter/meta-llama/llama-3-70b"),
            Some(("openrouter", "meta-llama/llama-3-70b"))
        );
        assert_eq!(split_model("gpt-4o"), None);
        assert_eq!(split_model("/gpt-4o"), None);
    }

    #[test]
    fn test_system_prompt_precedence() {
        let p = persona("You are a tutor.");
        let memories = vec![memory("prefers metric units")];

        assert_eq!(
            build_system_prompt(Some("Override"), Some((&p, &memories)), Some("conv")),
            Some("Override".to_string())
        );
        assert_eq!(
            build_system_prompt(None, Some((&p, &memories)), Some("conv")),
            Some("You are a tutor.\n\nThings to remember about the user:\n- prefers metric units".to_string())
        );
        assert_eq!(
            build_system_prompt(Some("  "), None, Some("conv")),
            Some("conv".to_string())
        );
        assert_eq!(build_system_prompt(None, None, None), None);
    }

    #[test]
    fn test_validate_requires_trailing_user_message() {
        let mut body = ChatBody {
            conversation_id: None,
            branch: None,
            model: "openai/gpt-4o".into(),
            messages: vec![IncomingMessage {
                role: Role::Assistant,
                content: "hi".into(),
                attachment_ids: Vec::new(),
            }],
            api_key: None,
            persona_id: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        };
        assert!(validate(&body).is_err());

        body.messages[0].role = Role::User;
        assert!(validate(&body).is_ok());

        body.messages.clear();
        assert!(validate(&body).is_err());
    }

    #[test]
    fn test_document_block() {
        assert_eq!(
            document_block("notes.md", "# Title"),
            "\n\n[Attached file: notes.md]\n# Title"
        );
    }
}

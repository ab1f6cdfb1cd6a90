use serde_json::{json, Value};

use crate::error::EngineError;
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::routing::has_handover_intent;
use crate::types::{AppState, Conversation, KbEntry, MessageType, WidgetConfig};

const TRANSCRIPT_WINDOW: usize = 14;
const KB_CONTEXT_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct AiDecision {
    pub reply: String,
    pub handover: bool,
    pub close_chat: bool,
}

/// Generates a bot reply via the LLM provider.
///
/// Called with a conversation snapshot and no locks held; the engine
/// re-validates state before applying the result. Every failure mode is a
/// `Provider` error the engine converts into a fallback message.
pub async fn generate_reply(
    state: &AppState,
    snapshot: &Conversation,
    config: &WidgetConfig,
    kb_entries: &[KbEntry],
    visitor_text: &str,
) -> Result<AiDecision, EngineError> {
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.trim().is_empty() {
        return Err(EngineError::Provider(
            "OPENAI_API_KEY not configured".to_string(),
        ));
    }

    let system_instruction = render_system_prompt(&SystemPromptContext {
        widget_name: &config.widget_name,
        bot_name: &config.bot_name,
        bot_personality: &config.bot_personality,
        kb_block: &kb_context_block(kb_entries),
    });

    let transcript = transcript_tail(snapshot, TRANSCRIPT_WINDOW);
    let user_content = if transcript.is_empty() {
        format!("Visitor message: {}", visitor_text.trim())
    } else {
        format!(
            "Conversation so far:\n{}\n\nVisitor message: {}",
            transcript,
            visitor_text.trim()
        )
    };

    let model = std::env::var("OPENAI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4.1".to_string());
    let raw_text =
        chat_completion_text(state, &api_key, &model, &system_instruction, &user_content).await?;

    if let Some(parsed) = parse_ai_decision(&raw_text) {
        return Ok(parsed);
    }
    // Model ignored the JSON contract; use the plain text and keep the
    // heuristic handover signal.
    Ok(AiDecision {
        reply: raw_text,
        handover: has_handover_intent(visitor_text),
        close_chat: false,
    })
}

fn transcript_tail(conversation: &Conversation, limit: usize) -> String {
    let start = conversation.messages.len().saturating_sub(limit);
    conversation.messages[start..]
        .iter()
        .map(|message| {
            let label = match message.message_type {
                MessageType::Visitor => "visitor",
                MessageType::Bot => "bot",
                MessageType::Agent => "agent",
                MessageType::System => "system",
            };
            format!("{label}: {}", message.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn kb_context_block(entries: &[KbEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut block = String::from("Practice knowledge base:\n");
    for entry in entries.iter().take(KB_CONTEXT_LIMIT) {
        block.push_str(&format!("Q: {}\nA: {}\n", entry.question, entry.answer));
    }
    block
}

async fn chat_completion_text(
    state: &AppState,
    api_key: &str,
    model: &str,
    system: &str,
    user: &str,
) -> Result<String, EngineError> {
    let response = state
        .http_client
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(api_key)
        .json(&json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "temperature": 0.2
        }))
        .send()
        .await
        .map_err(|err| EngineError::Provider(format!("openai request failed: {err}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(EngineError::Provider(format!(
            "openai returned {status}: {body}"
        )));
    }

    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| EngineError::Provider(format!("openai parse failed: {err}")))?;
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return Err(EngineError::Provider(
            "openai response had empty content".to_string(),
        ));
    }
    Ok(text)
}

/// Extracts the JSON decision from a model response, tolerating code fences
/// and surrounding prose.
pub fn parse_ai_decision(raw: &str) -> Option<AiDecision> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidates = Vec::<String>::new();
    candidates.push(trimmed.to_string());

    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };

        let reply = parsed
            .get("reply")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .unwrap_or_default();
        if reply.is_empty() {
            continue;
        }

        let handover = parsed
            .get("handover")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let close_chat = parsed
            .get("closeChat")
            .and_then(Value::as_bool)
            .or_else(|| parsed.get("close_chat").and_then(Value::as_bool))
            .unwrap_or(false);

        return Some(AiDecision {
            reply,
            handover,
            close_chat,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_decision() {
        let decision =
            parse_ai_decision(r#"{"reply": "We open at 9am.", "handover": false, "closeChat": true}"#)
                .unwrap();
        assert_eq!(decision.reply, "We open at 9am.");
        assert!(!decision.handover);
        assert!(decision.close_chat);
    }

    #[test]
    fn parses_fenced_json_decision() {
        let raw = "```json\n{\"reply\": \"Sure.\", \"handover\": true}\n```";
        let decision = parse_ai_decision(raw).unwrap();
        assert_eq!(decision.reply, "Sure.");
        assert!(decision.handover);
        assert!(!decision.close_chat);
    }

    #[test]
    fn rejects_empty_or_replyless_payloads() {
        assert!(parse_ai_decision("").is_none());
        assert!(parse_ai_decision(r#"{"handover": true}"#).is_none());
        assert!(parse_ai_decision("just some prose").is_none());
    }
}

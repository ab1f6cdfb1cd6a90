use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::ai::{self, AiDecision};
use crate::error::EngineError;
use crate::handover::{self, ChoiceOutcome, HandoverReason, HandoverStart};
use crate::intro::{self, IntroStep};
use crate::persist;
use crate::routing::{self, RouteDecision};
use crate::sweeper;
use crate::types::{
    AppState, ChatMessage, Conversation, ConversationState, HandoverMethod, KbEntry, MessageType,
    WidgetConfig,
};
use crate::whatsapp;

const MAX_MESSAGE_LEN: usize = 4000;

const PROVIDER_FALLBACK: &str =
    "We're having trouble answering right now. Please try again in a moment, or ask to speak \
     with a human.";
const THROTTLE_NOTICE: &str =
    "You're sending messages a little quickly. Please wait a moment before sending more.";
const TRANSFERRED_TO_AGENT: &str =
    "Conversation transferred to a human agent. Our team will reply here shortly.";
const MOVED_TO_WHATSAPP: &str =
    "Connecting you with our team on WhatsApp. We'll continue the conversation there.";
const WHATSAPP_DELIVERY_FAILED: &str =
    "We couldn't reach WhatsApp right now. Our team has been notified and will follow up here.";
const RESOLVED_BY_BOT: &str = "Conversation resolved.";
const CLOSED_BY_AGENT: &str =
    "This conversation has been ended by our team. Thanks for reaching out!";

/// Every external trigger the engine reacts to, as one tagged variant so the
/// per-state dispatch stays exhaustive.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    VisitorMessage {
        widget_id: String,
        text: String,
        dedupe_key: Option<String>,
    },
    AgentMessage {
        text: String,
    },
    WhatsAppInbound {
        text: String,
    },
    SweepTick,
}

#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    pub conversation_id: String,
    pub state: Option<ConversationState>,
    /// Messages appended while handling the event, excluding the inbound one.
    pub outbound: Vec<ChatMessage>,
    pub reminders_sent: u32,
    pub closed_now: bool,
}

/// Work that must run without the per-conversation lock held: LLM calls and
/// WhatsApp sends are the only potentially slow operations in the subsystem.
enum FollowUp {
    GenerateReply {
        snapshot: Conversation,
        config: Arc<WidgetConfig>,
        kb_entries: Vec<KbEntry>,
        text: String,
    },
    SendHandoverTemplate {
        number: String,
        content_sid: String,
        variables: serde_json::Value,
    },
    ForwardWhatsApp {
        number: String,
        text: String,
    },
}

/// Single mutation authority for a conversation. Serializes per conversation
/// id; slow external calls run between lock acquisitions against a snapshot
/// and re-validate before applying their result.
pub async fn handle_event(
    state: &Arc<AppState>,
    conversation_id: &str,
    event: ConversationEvent,
) -> Result<EventOutcome, EngineError> {
    validate_event(&event)?;

    let lock = state.conversation_lock(conversation_id).await;

    let (mut outcome, mut pending) = {
        let _guard = lock.lock().await;
        apply_event(state, conversation_id, &event).await?
    };

    while let Some(follow_up) = pending.pop() {
        match follow_up {
            FollowUp::GenerateReply {
                snapshot,
                config,
                kb_entries,
                text,
            } => {
                let result =
                    ai::generate_reply(state, &snapshot, &config, &kb_entries, &text).await;
                let _guard = lock.lock().await;
                let more =
                    apply_bot_reply(state, conversation_id, &config, result, &mut outcome).await;
                pending.extend(more);
            }
            FollowUp::SendHandoverTemplate {
                number,
                content_sid,
                variables,
            } => {
                let result = whatsapp::send_template(state, &number, &content_sid, &variables).await;
                let _guard = lock.lock().await;
                apply_handover_delivery(state, conversation_id, result, &mut outcome).await;
            }
            FollowUp::ForwardWhatsApp { number, text } => {
                // Best-effort forward; a failure here never touches state.
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = whatsapp::send_text(&state, &number, &text).await {
                        warn!(error = %err, "whatsapp forward failed");
                    }
                });
            }
        }
    }

    Ok(outcome)
}

fn validate_event(event: &ConversationEvent) -> Result<(), EngineError> {
    let text = match event {
        ConversationEvent::VisitorMessage { text, .. } => Some(text),
        ConversationEvent::AgentMessage { text } => Some(text),
        ConversationEvent::WhatsAppInbound { text } => Some(text),
        ConversationEvent::SweepTick => None,
    };
    if let Some(text) = text {
        if text.trim().is_empty() {
            return Err(EngineError::Validation("text is required".to_string()));
        }
        if text.len() > MAX_MESSAGE_LEN {
            return Err(EngineError::Validation("message too long".to_string()));
        }
    }
    Ok(())
}

async fn apply_event(
    state: &Arc<AppState>,
    conversation_id: &str,
    event: &ConversationEvent,
) -> Result<(EventOutcome, Vec<FollowUp>), EngineError> {
    let existing_widget_id = {
        let conversations = state.conversations.read().await;
        conversations
            .get(conversation_id)
            .map(|c| c.widget_id.clone())
    };

    let widget_id = match (&existing_widget_id, event) {
        (Some(id), _) => id.clone(),
        (None, ConversationEvent::VisitorMessage { widget_id, .. }) => widget_id.clone(),
        (None, _) => {
            return Err(EngineError::NotFound(conversation_id.to_string()));
        }
    };

    let config = state
        .widget_config(&widget_id)
        .await
        .ok_or_else(|| EngineError::Validation(format!("unknown widget: {widget_id}")))?;
    let kb_entries = state.kb_entries(&widget_id).await;

    let mut outcome = EventOutcome {
        conversation_id: conversation_id.to_string(),
        ..EventOutcome::default()
    };
    let mut follow_ups = Vec::new();
    let now = Utc::now();

    let snapshot = {
        let mut conversations = state.conversations.write().await;

        let created_now = if conversations.contains_key(conversation_id) {
            false
        } else {
            let mut conversation = Conversation::new(&widget_id, config.intro_flow_enabled);
            conversation.id = conversation_id.to_string();
            conversations.insert(conversation_id.to_string(), conversation);
            true
        };
        let conversation = conversations
            .get_mut(conversation_id)
            .expect("conversation present after insert");

        // Terminal state: audit-log and drop, nothing mutates.
        if conversation.state.is_closed() {
            info!(conversation_id, ?event, "event ignored on closed conversation");
            outcome.state = Some(ConversationState::Closed);
            return Ok((outcome, follow_ups));
        }

        // Replay protection for visitor messages.
        if let ConversationEvent::VisitorMessage {
            dedupe_key: Some(key),
            ..
        } = event
        {
            if !conversation.seen_event_keys.insert(key.clone()) {
                info!(conversation_id, key, "duplicate visitor message dropped");
                outcome.state = Some(conversation.state);
                return Ok((outcome, follow_ups));
            }
        }

        // Activity stamps update regardless of what the dispatch decides.
        match event {
            ConversationEvent::VisitorMessage { .. } | ConversationEvent::WhatsAppInbound { .. } => {
                conversation.last_visitor_activity_at = Some(now);
            }
            ConversationEvent::AgentMessage { .. } => {
                conversation.last_agent_activity_at = Some(now);
            }
            ConversationEvent::SweepTick => {}
        }

        dispatch(
            state,
            conversation,
            &config,
            &kb_entries,
            event,
            created_now,
            &mut outcome,
            &mut follow_ups,
        )?;

        outcome.state = Some(conversation.state);
        conversation.clone()
    };

    persist::save_conversation(state, &snapshot).await;
    Ok((outcome, follow_ups))
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    state: &Arc<AppState>,
    conversation: &mut Conversation,
    config: &Arc<WidgetConfig>,
    kb_entries: &[KbEntry],
    event: &ConversationEvent,
    created_now: bool,
    outcome: &mut EventOutcome,
    follow_ups: &mut Vec<FollowUp>,
) -> Result<(), EngineError> {
    let now = Utc::now();

    match (conversation.state, event) {
        (ConversationState::IntroPending, ConversationEvent::VisitorMessage { text, .. }) => {
            conversation.append(MessageType::Visitor, text);
            if created_now {
                // The opening message starts the flow; it is not an answer.
                match intro::first_question(config) {
                    Some(question) => {
                        emit(outcome, conversation, MessageType::Bot, &question.prompt);
                    }
                    None => complete_intro(conversation, outcome),
                }
            } else {
                match intro::advance(conversation, config, text) {
                    IntroStep::Ask(question) => {
                        emit(outcome, conversation, MessageType::Bot, &question.prompt);
                    }
                    IntroStep::Done => complete_intro(conversation, outcome),
                }
            }
        }
        (ConversationState::IntroPending, ConversationEvent::AgentMessage { text }) => {
            // An agent jumping in mid-intro is unusual; the message is kept
            // but the questionnaire keeps running.
            conversation.append(MessageType::Agent, text);
            info!(conversation_id = %conversation.id, "agent message during intro flow");
        }
        (ConversationState::IntroPending, ConversationEvent::WhatsAppInbound { .. })
        | (ConversationState::ActiveBot, ConversationEvent::WhatsAppInbound { .. }) => {
            return Err(EngineError::StateConflict(format!(
                "whatsapp inbound without an active whatsapp handover on {}",
                conversation.id
            )));
        }

        (ConversationState::ActiveBot, ConversationEvent::VisitorMessage { text, .. }) => {
            if let Some(minutes) = extension_request(text, config) {
                if conversation.visitor_extension_reminders_count > 0 {
                    grant_extension(conversation, minutes, outcome);
                    return Ok(());
                }
            }
            conversation.append(MessageType::Visitor, text);

            match routing::route(conversation, config, kb_entries, text, now) {
                RouteDecision::Handover(reason) => {
                    start_handover(conversation, config, reason, outcome, follow_ups);
                }
                RouteDecision::KbReply(reply) => {
                    conversation.consecutive_bot_misses = 0;
                    emit(outcome, conversation, MessageType::Bot, &reply);
                }
                RouteDecision::GenerateLlm => {
                    follow_ups.push(FollowUp::GenerateReply {
                        snapshot: conversation.clone(),
                        config: config.clone(),
                        kb_entries: kb_entries.to_vec(),
                        text: text.clone(),
                    });
                }
                RouteDecision::Fallback(reply) => {
                    conversation.consecutive_bot_misses += 1;
                    emit(outcome, conversation, MessageType::Bot, &reply);
                }
                RouteDecision::Throttled { notify } => {
                    if notify {
                        conversation.throttle_notice_at = Some(now);
                        emit(outcome, conversation, MessageType::System, THROTTLE_NOTICE);
                    }
                }
            }
        }
        (ConversationState::ActiveBot, ConversationEvent::AgentMessage { text }) => {
            // Implicit handover: the agent stepping in claims the conversation.
            conversation.append(MessageType::Agent, text);
            info!(
                conversation_id = %conversation.id,
                reason = HandoverReason::AgentIntervention.describe(),
                "implicit handover"
            );
            activate_handover(
                conversation,
                config,
                HandoverMethod::Agent,
                outcome,
                follow_ups,
            );
        }

        (ConversationState::HandoverRequested, ConversationEvent::VisitorMessage { text, .. }) => {
            conversation.append(MessageType::Visitor, text);
            match handover::consume_choice(config, text) {
                ChoiceOutcome::Selected(method) => {
                    activate_handover(conversation, config, method, outcome, follow_ups);
                }
                ChoiceOutcome::Reprompt(prompt) => {
                    emit(outcome, conversation, MessageType::Bot, &prompt);
                }
            }
        }
        (ConversationState::HandoverRequested, ConversationEvent::AgentMessage { text }) => {
            // Agent reply while the choice is pending: treat as acceptance.
            conversation.append(MessageType::Agent, text);
            activate_handover(
                conversation,
                config,
                HandoverMethod::Agent,
                outcome,
                follow_ups,
            );
        }
        (ConversationState::HandoverRequested, ConversationEvent::WhatsAppInbound { text }) => {
            conversation.append(MessageType::Visitor, text);
        }

        (ConversationState::HandoverActive, ConversationEvent::VisitorMessage { text, .. }) => {
            if let Some(minutes) = extension_request(text, config) {
                if conversation.visitor_extension_reminders_count > 0 {
                    grant_extension(conversation, minutes, outcome);
                    return Ok(());
                }
            }
            conversation.append(MessageType::Visitor, text);
            if conversation.handover_method == HandoverMethod::Whatsapp
                && !conversation.handover_target.is_empty()
            {
                follow_ups.push(FollowUp::ForwardWhatsApp {
                    number: conversation.handover_target.clone(),
                    text: forwarded_text(conversation, text),
                });
            }
            // The bot stays silent; an agent owns the conversation now.
        }
        (ConversationState::HandoverActive, ConversationEvent::AgentMessage { text }) => {
            if is_close_command(text) {
                close_conversation(conversation, "agent_closed", CLOSED_BY_AGENT, outcome);
                return Ok(());
            }
            if let Some(minutes) = extension_request(text, config) {
                if conversation.extension_reminders_count > 0 {
                    grant_extension(conversation, minutes, outcome);
                    return Ok(());
                }
            }
            conversation.append(MessageType::Agent, text);
        }
        (ConversationState::HandoverActive, ConversationEvent::WhatsAppInbound { text }) => {
            // Mapped through the handover target; visitor-originated.
            if let Some(minutes) = extension_request(text, config) {
                if conversation.visitor_extension_reminders_count > 0 {
                    grant_extension(conversation, minutes, outcome);
                    return Ok(());
                }
            }
            conversation.append(MessageType::Visitor, text);
        }

        (_, ConversationEvent::SweepTick) => {
            let tick = sweeper::apply_tick(conversation, config, now);
            outcome.reminders_sent = tick.reminders_sent;
            outcome.closed_now = tick.closed_now;
            outcome.outbound.extend(tick.appended);
            if !config.handover_whatsapp_number.is_empty() {
                for notice in tick.agent_notices {
                    follow_ups.push(FollowUp::ForwardWhatsApp {
                        number: config.handover_whatsapp_number.clone(),
                        text: notice,
                    });
                }
            }
        }

        (ConversationState::Closed, _) => unreachable!("closed handled before dispatch"),
    }

    Ok(())
}

/// Appends an outbound message and records it on the outcome.
fn emit(
    outcome: &mut EventOutcome,
    conversation: &mut Conversation,
    message_type: MessageType,
    text: &str,
) {
    let message = conversation.append(message_type, text);
    outcome.outbound.push(message);
}

fn complete_intro(conversation: &mut Conversation, outcome: &mut EventOutcome) {
    if conversation.intro_completed {
        return;
    }
    conversation.intro_completed = true;
    conversation.state = ConversationState::ActiveBot;
    let welcome = if conversation.visitor_name.is_empty() {
        "Thanks! You're all set. How can we help you today?".to_string()
    } else {
        format!(
            "Thanks, {}! You're all set. How can we help you today?",
            conversation.visitor_name
        )
    };
    emit(outcome, conversation, MessageType::Bot, &welcome);
}

fn start_handover(
    conversation: &mut Conversation,
    config: &WidgetConfig,
    reason: HandoverReason,
    outcome: &mut EventOutcome,
    follow_ups: &mut Vec<FollowUp>,
) {
    info!(
        conversation_id = %conversation.id,
        reason = reason.describe(),
        "handover triggered"
    );
    if reason == HandoverReason::Emergency && !config.emergency_message.is_empty() {
        emit(
            outcome,
            conversation,
            MessageType::System,
            &config.emergency_message,
        );
    }

    match handover::initiate(config) {
        HandoverStart::PromptChoice(prompt) => {
            conversation.state = ConversationState::HandoverRequested;
            emit(outcome, conversation, MessageType::Bot, &prompt);
        }
        HandoverStart::Direct(method) => {
            activate_handover(conversation, config, method, outcome, follow_ups);
        }
    }
}

fn activate_handover(
    conversation: &mut Conversation,
    config: &WidgetConfig,
    method: HandoverMethod,
    outcome: &mut EventOutcome,
    follow_ups: &mut Vec<FollowUp>,
) {
    conversation.state = ConversationState::HandoverActive;
    conversation.handover_method = method;
    match method {
        HandoverMethod::Agent | HandoverMethod::None => {
            conversation.handover_method = HandoverMethod::Agent;
            conversation.handover_target = "agent-dashboard".to_string();
            emit(outcome, conversation, MessageType::System, TRANSFERRED_TO_AGENT);
        }
        HandoverMethod::Whatsapp => {
            conversation.handover_target = config.handover_whatsapp_number.clone();
            emit(outcome, conversation, MessageType::System, MOVED_TO_WHATSAPP);
            follow_ups.push(FollowUp::SendHandoverTemplate {
                number: config.handover_whatsapp_number.clone(),
                content_sid: config.whatsapp_handover_content_sid.clone(),
                variables: json!({
                    "1": if conversation.visitor_name.is_empty() {
                        "Visitor"
                    } else {
                        conversation.visitor_name.as_str()
                    },
                    "2": conversation.id,
                }),
            });
        }
    }
}

/// Applies an LLM decision computed while the lock was released. The
/// conversation may have closed or been claimed by an agent in the meantime;
/// a late bot reply must never land on such a conversation.
async fn apply_bot_reply(
    state: &Arc<AppState>,
    conversation_id: &str,
    config: &Arc<WidgetConfig>,
    result: Result<AiDecision, EngineError>,
    outcome: &mut EventOutcome,
) -> Vec<FollowUp> {
    let mut follow_ups = Vec::new();
    let snapshot = {
        let mut conversations = state.conversations.write().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return follow_ups;
        };

        if conversation.state != ConversationState::ActiveBot {
            info!(
                conversation_id,
                state = ?conversation.state,
                "discarding bot reply computed for a conversation no longer bot-handled"
            );
            outcome.state = Some(conversation.state);
            return follow_ups;
        }

        match result {
            Ok(decision) => {
                conversation.consecutive_bot_misses = 0;
                emit(outcome, conversation, MessageType::Bot, &decision.reply);
                if decision.handover {
                    start_handover(
                        conversation,
                        config,
                        HandoverReason::LlmSignal,
                        outcome,
                        &mut follow_ups,
                    );
                } else if decision.close_chat {
                    close_conversation(conversation, "resolved", RESOLVED_BY_BOT, outcome);
                }
            }
            Err(err) => {
                warn!(conversation_id, error = %err, "bot reply generation failed");
                conversation.consecutive_bot_misses += 1;
                emit(outcome, conversation, MessageType::System, PROVIDER_FALLBACK);
            }
        }

        outcome.state = Some(conversation.state);
        conversation.clone()
    };

    persist::save_conversation(state, &snapshot).await;
    follow_ups
}

/// Records the WhatsApp template delivery result. Failure is surfaced as a
/// dashboard-visible system note; the handover state stands either way.
async fn apply_handover_delivery(
    state: &Arc<AppState>,
    conversation_id: &str,
    result: Result<String, EngineError>,
    outcome: &mut EventOutcome,
) {
    let (delivered_sid, snapshot) = {
        let mut conversations = state.conversations.write().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return;
        };
        if conversation.state.is_closed() {
            return;
        }

        match result {
            Ok(sid) => {
                conversation.whatsapp_message_sid = sid.clone();
                (Some(sid), conversation.clone())
            }
            Err(err) => {
                warn!(conversation_id, error = %err, "whatsapp handover delivery failed");
                emit(
                    outcome,
                    conversation,
                    MessageType::System,
                    WHATSAPP_DELIVERY_FAILED,
                );
                (None, conversation.clone())
            }
        }
    };

    if let Some(sid) = delivered_sid {
        let mut routes = state.whatsapp_routes.write().await;
        routes.insert(sid, conversation_id.to_string());
    }
    persist::save_conversation(state, &snapshot).await;
}

fn close_conversation(
    conversation: &mut Conversation,
    reason: &str,
    message: &str,
    outcome: &mut EventOutcome,
) {
    conversation.state = ConversationState::Closed;
    conversation.ended_at = Some(Utc::now());
    conversation.close_reason = reason.to_string();
    emit(outcome, conversation, MessageType::System, message);
    outcome.closed_now = true;
}

fn grant_extension(conversation: &mut Conversation, minutes: i64, outcome: &mut EventOutcome) {
    let until = Utc::now() + Duration::minutes(minutes);
    conversation.extension_granted_until = Some(until);
    emit(
        outcome,
        conversation,
        MessageType::System,
        &format!(
            "Conversation extended by {minutes} minute{}.",
            if minutes == 1 { "" } else { "s" }
        ),
    );
}

/// Parses "yes" / "yes 10" / "5 minutes" style extension replies. Minutes
/// clamp to 1..=60; a bare "yes" uses the configured extension duration.
fn extension_request(text: &str, config: &WidgetConfig) -> Option<i64> {
    static YES: OnceLock<Regex> = OnceLock::new();
    static MINUTES: OnceLock<Regex> = OnceLock::new();
    let yes = YES.get_or_init(|| Regex::new(r"(?i)\byes\b").expect("valid regex"));
    let minutes_re = MINUTES
        .get_or_init(|| Regex::new(r"(?i)\b(\d{1,3})\s*(?:min|mins|minute|minutes)?\b").expect("valid regex"));

    let trimmed = text.trim();
    if !yes.is_match(trimmed) {
        return None;
    }

    let minutes = minutes_re
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .unwrap_or(config.extension_duration_mins);
    Some(minutes.clamp(1, 60))
}

fn is_close_command(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    normalized == "stop conversation" || normalized == "end conversation"
}

fn forwarded_text(conversation: &Conversation, text: &str) -> String {
    let visitor = if conversation.visitor_name.is_empty() {
        "Visitor"
    } else {
        conversation.visitor_name.as_str()
    };
    format!("New message from {visitor}:\n\n{text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HandoverOptions, IntroField, IntroQuestion};

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(None))
    }

    fn no_intro_config(widget_id: &str) -> WidgetConfig {
        let mut config = WidgetConfig::default_for(widget_id);
        config.intro_flow_enabled = false;
        config
    }

    async fn seed(state: &Arc<AppState>, config: WidgetConfig) {
        state.put_widget_config(config).await;
    }

    fn visitor(widget_id: &str, text: &str) -> ConversationEvent {
        ConversationEvent::VisitorMessage {
            widget_id: widget_id.to_string(),
            text: text.to_string(),
            dedupe_key: None,
        }
    }

    async fn conversation(state: &Arc<AppState>, id: &str) -> Conversation {
        state
            .conversations
            .read()
            .await
            .get(id)
            .cloned()
            .expect("conversation exists")
    }

    #[tokio::test]
    async fn scenario_a_intro_flow_with_skip() {
        let state = state();
        let mut config = WidgetConfig::default_for("w1");
        config.intro_questions = vec![
            IntroQuestion {
                id: "name".to_string(),
                prompt: "What is your name?".to_string(),
                field: IntroField::Name,
                required: true,
            },
            IntroQuestion {
                id: "company".to_string(),
                prompt: "What company are you with?".to_string(),
                field: IntroField::Company,
                required: false,
            },
        ];
        seed(&state, config).await;

        let outcome = handle_event(&state, "c1", visitor("w1", "hello"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::IntroPending));
        assert_eq!(outcome.outbound[0].text, "What is your name?");

        handle_event(&state, "c1", visitor("w1", "Jane")).await.unwrap();
        let outcome = handle_event(&state, "c1", visitor("w1", "skip"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::ActiveBot));

        let conv = conversation(&state, "c1").await;
        assert!(conv.intro_completed);
        assert_eq!(conv.intro_answers.len(), 2);
        assert_eq!(conv.intro_answers[0].answer, "Jane");
        assert_eq!(conv.intro_answers[1].answer, "");
        assert_eq!(conv.visitor_name, "Jane");
    }

    #[tokio::test]
    async fn scenario_b_explicit_handover_with_choice_prompt() {
        let state = state();
        let mut config = no_intro_config("w1");
        config.handover_options = HandoverOptions {
            agent: true,
            whatsapp: true,
        };
        config.enable_handover_choice = true;
        config.handover_whatsapp_number = "+15550001111".to_string();
        seed(&state, config).await;

        let outcome = handle_event(&state, "c1", visitor("w1", "I need to speak to a human"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::HandoverRequested));
        assert!(outcome
            .outbound
            .iter()
            .any(|m| m.text == handover::choice_prompt()));
        // No KB or LLM reply was generated.
        assert!(outcome
            .outbound
            .iter()
            .all(|m| m.message_type != MessageType::Bot || m.text == handover::choice_prompt()));
    }

    #[tokio::test]
    async fn choice_reply_selects_agent_method() {
        let state = state();
        let mut config = no_intro_config("w1");
        config.handover_options = HandoverOptions {
            agent: true,
            whatsapp: true,
        };
        config.enable_handover_choice = true;
        config.handover_whatsapp_number = "+15550001111".to_string();
        seed(&state, config).await;

        handle_event(&state, "c1", visitor("w1", "talk to a human please"))
            .await
            .unwrap();
        let outcome = handle_event(&state, "c1", visitor("w1", "1")).await.unwrap();
        assert_eq!(outcome.state, Some(ConversationState::HandoverActive));

        let conv = conversation(&state, "c1").await;
        assert_eq!(conv.handover_method, HandoverMethod::Agent);
        assert_ne!(conv.handover_method, HandoverMethod::None);
    }

    #[tokio::test]
    async fn scenario_e_agent_message_claims_conversation_and_silences_bot() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;
        state
            .put_kb_entries(
                "w1",
                vec![KbEntry {
                    id: "hours".to_string(),
                    question: "What are your opening hours?".to_string(),
                    answer: "9-5 weekdays.".to_string(),
                    keywords: vec![],
                }],
            )
            .await;

        handle_event(&state, "c1", visitor("w1", "hello there")).await.unwrap();
        let outcome = handle_event(
            &state,
            "c1",
            ConversationEvent::AgentMessage {
                text: "Hi, I can take it from here.".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::HandoverActive));
        let conv = conversation(&state, "c1").await;
        assert_eq!(conv.handover_method, HandoverMethod::Agent);

        // A KB-answerable question now gets no bot reply.
        let outcome = handle_event(&state, "c1", visitor("w1", "What are your opening hours?"))
            .await
            .unwrap();
        assert!(outcome
            .outbound
            .iter()
            .all(|m| m.message_type != MessageType::Bot));
    }

    #[tokio::test]
    async fn closed_conversations_ignore_all_events() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;
        handle_event(&state, "c1", visitor("w1", "hello")).await.unwrap();

        {
            let mut conversations = state.conversations.write().await;
            let conv = conversations.get_mut("c1").unwrap();
            conv.state = ConversationState::Closed;
            conv.ended_at = Some(Utc::now());
        }
        let before = conversation(&state, "c1").await;

        let outcome = handle_event(&state, "c1", visitor("w1", "anyone there?"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::Closed));
        assert!(outcome.outbound.is_empty());

        let outcome = handle_event(
            &state,
            "c1",
            ConversationEvent::AgentMessage {
                text: "hello?".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(outcome.outbound.is_empty());

        handle_event(&state, "c1", ConversationEvent::SweepTick)
            .await
            .unwrap();

        let after = conversation(&state, "c1").await;
        assert_eq!(after.message_count, before.message_count);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.ended_at, before.ended_at);
    }

    #[tokio::test]
    async fn duplicate_dedupe_key_is_a_no_op() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;

        let event = ConversationEvent::VisitorMessage {
            widget_id: "w1".to_string(),
            text: "hello".to_string(),
            dedupe_key: Some("evt-1".to_string()),
        };
        handle_event(&state, "c1", event.clone()).await.unwrap();
        let count_after_first = conversation(&state, "c1").await.message_count;

        let outcome = handle_event(&state, "c1", event).await.unwrap();
        assert!(outcome.outbound.is_empty());
        let conv = conversation(&state, "c1").await;
        assert_eq!(conv.message_count, count_after_first);
    }

    #[tokio::test]
    async fn provider_failure_yields_fallback_message() {
        // LLM enabled but no OPENAI_API_KEY: the provider error is absorbed
        // into a fallback system message.
        std::env::remove_var("OPENAI_API_KEY");
        let state = state();
        let mut config = no_intro_config("w1");
        config.llm_enabled = true;
        seed(&state, config).await;

        let outcome = handle_event(&state, "c1", visitor("w1", "what are your prices?"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::ActiveBot));
        assert!(outcome
            .outbound
            .iter()
            .any(|m| m.message_type == MessageType::System && m.text == PROVIDER_FALLBACK));
    }

    #[tokio::test]
    async fn unknown_conversation_on_agent_event_is_not_found() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;
        let result = handle_event(
            &state,
            "missing",
            ConversationEvent::AgentMessage {
                text: "hello".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_mutation() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;
        let result = handle_event(&state, "c1", visitor("w1", "   ")).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(state.conversations.read().await.get("c1").is_none());
    }

    #[tokio::test]
    async fn visitor_extension_grant_requires_prior_reminder() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;
        handle_event(&state, "c1", visitor("w1", "hello")).await.unwrap();

        // No reminder yet: "yes 10" is just a message, not a grant.
        handle_event(&state, "c1", visitor("w1", "yes 10")).await.unwrap();
        assert!(conversation(&state, "c1").await.extension_granted_until.is_none());

        {
            let mut conversations = state.conversations.write().await;
            let conv = conversations.get_mut("c1").unwrap();
            conv.visitor_extension_reminders_count = 2;
        }
        let outcome = handle_event(&state, "c1", visitor("w1", "yes 10")).await.unwrap();
        let conv = conversation(&state, "c1").await;
        let until = conv.extension_granted_until.expect("extension granted");
        assert!(until > Utc::now() + Duration::minutes(9));
        assert!(until <= Utc::now() + Duration::minutes(11));
        assert!(outcome
            .outbound
            .iter()
            .any(|m| m.message_type == MessageType::System && m.text.contains("extended")));
    }

    #[tokio::test]
    async fn agent_stop_command_closes_conversation() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;
        handle_event(&state, "c1", visitor("w1", "hello")).await.unwrap();
        handle_event(
            &state,
            "c1",
            ConversationEvent::AgentMessage {
                text: "taking over".to_string(),
            },
        )
        .await
        .unwrap();

        let outcome = handle_event(
            &state,
            "c1",
            ConversationEvent::AgentMessage {
                text: "stop conversation".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::Closed));
        let conv = conversation(&state, "c1").await;
        assert!(conv.ended_at.is_some());
        assert_eq!(conv.close_reason, "agent_closed");
    }

    #[tokio::test]
    async fn bot_miss_escalation_reaches_handover() {
        let state = state();
        let mut config = no_intro_config("w1");
        config.handover_after_misses = 2;
        seed(&state, config).await;

        let outcome = handle_event(&state, "c1", visitor("w1", "qwerty asdf"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::ActiveBot));
        assert_eq!(conversation(&state, "c1").await.consecutive_bot_misses, 1);

        let outcome = handle_event(&state, "c1", visitor("w1", "zxcv uiop"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::HandoverActive));
    }

    #[tokio::test]
    async fn throttle_notice_fires_once_per_window() {
        let state = state();
        let mut config = no_intro_config("w1");
        config.rate_limit_messages = 2;
        config.rate_limit_window_secs = 300;
        seed(&state, config).await;

        for i in 0..2 {
            handle_event(&state, "c1", visitor("w1", &format!("msg {i} xyzzy")))
                .await
                .unwrap();
        }
        let outcome = handle_event(&state, "c1", visitor("w1", "third xyzzy"))
            .await
            .unwrap();
        assert!(outcome
            .outbound
            .iter()
            .any(|m| m.text == THROTTLE_NOTICE));

        let outcome = handle_event(&state, "c1", visitor("w1", "fourth xyzzy"))
            .await
            .unwrap();
        assert!(outcome.outbound.is_empty());
    }

    #[tokio::test]
    async fn whatsapp_handover_without_credentials_stays_active_with_failure_note() {
        std::env::remove_var("TWILIO_ACCOUNT_SID");
        std::env::remove_var("TWILIO_AUTH_TOKEN");
        let state = state();
        let mut config = no_intro_config("w1");
        config.handover_options = HandoverOptions {
            agent: false,
            whatsapp: true,
        };
        config.handover_whatsapp_number = "+15550001111".to_string();
        config.whatsapp_handover_content_sid = "HX123".to_string();
        seed(&state, config).await;

        let outcome = handle_event(&state, "c1", visitor("w1", "let me talk to a human"))
            .await
            .unwrap();
        // Delivery failed (no credentials) but the handover stands; the
        // failure is surfaced as a system note.
        assert_eq!(outcome.state, Some(ConversationState::HandoverActive));
        let conv = conversation(&state, "c1").await;
        assert_eq!(conv.handover_method, HandoverMethod::Whatsapp);
        assert_eq!(conv.handover_target, "+15550001111");
        assert!(conv
            .messages
            .iter()
            .any(|m| m.text == WHATSAPP_DELIVERY_FAILED));
    }

    #[tokio::test]
    async fn whatsapp_inbound_is_visitor_originated() {
        let state = state();
        let mut config = no_intro_config("w1");
        config.handover_options = HandoverOptions {
            agent: false,
            whatsapp: true,
        };
        config.handover_whatsapp_number = "+15550001111".to_string();
        seed(&state, config).await;

        handle_event(&state, "c1", visitor("w1", "get me a real person"))
            .await
            .unwrap();
        let before = conversation(&state, "c1").await;
        assert_eq!(before.state, ConversationState::HandoverActive);

        let outcome = handle_event(
            &state,
            "c1",
            ConversationEvent::WhatsAppInbound {
                text: "Continuing from my phone".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(outcome.outbound.is_empty());

        let conv = conversation(&state, "c1").await;
        let last = conv.messages.last().unwrap();
        assert_eq!(last.message_type, MessageType::Visitor);
        assert_eq!(last.text, "Continuing from my phone");
        assert!(conv.last_visitor_activity_at >= before.last_visitor_activity_at);
    }

    #[tokio::test]
    async fn whatsapp_inbound_outside_handover_is_dropped() {
        let state = state();
        seed(&state, no_intro_config("w1")).await;
        handle_event(&state, "c1", visitor("w1", "hello")).await.unwrap();

        let result = handle_event(
            &state,
            "c1",
            ConversationEvent::WhatsAppInbound {
                text: "stray message".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(EngineError::StateConflict(_))));
        // Dropped means dropped: the stray text was not appended.
        let conv = conversation(&state, "c1").await;
        assert!(conv.messages.iter().all(|m| m.text != "stray message"));
    }

    #[tokio::test]
    async fn emergency_trigger_prepends_emergency_message() {
        let state = state();
        let config = no_intro_config("w1");
        let emergency_message = config.emergency_message.clone();
        seed(&state, config).await;

        let outcome = handle_event(&state, "c1", visitor("w1", "I think this is an emergency"))
            .await
            .unwrap();
        assert_eq!(outcome.state, Some(ConversationState::HandoverActive));
        assert_eq!(outcome.outbound[0].text, emergency_message);
    }

    #[tokio::test]
    async fn extension_request_parsing() {
        let config = WidgetConfig::default_for("w1");
        assert_eq!(extension_request("yes", &config), Some(10));
        assert_eq!(extension_request("Yes 5", &config), Some(5));
        assert_eq!(extension_request("yes 120 minutes", &config), Some(60));
        assert_eq!(extension_request("yesterday was fine", &config), None);
        assert_eq!(extension_request("no", &config), None);
    }
}

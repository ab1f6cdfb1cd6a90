use chrono::{DateTime, Duration, Utc};

use crate::handover::HandoverReason;
use crate::kb::{self, KbMatch};
use crate::types::{Conversation, KbEntry, WidgetConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    Handover(HandoverReason),
    KbReply(String),
    /// LLM generation happens in the engine, outside the conversation lock.
    GenerateLlm,
    Fallback(String),
    Throttled {
        notify: bool,
    },
}

/// Decides how to answer an inbound visitor message while the bot handles
/// the conversation. Pure decision function: never mutates state; the engine
/// applies the resulting transition.
///
/// Check order: emergency keyword, explicit human intent, rate limit,
/// knowledge base (LLM disabled), LLM (enabled), configured fallback.
pub fn route(
    conversation: &Conversation,
    config: &WidgetConfig,
    kb_entries: &[KbEntry],
    text: &str,
    now: DateTime<Utc>,
) -> RouteDecision {
    let lower = text.to_lowercase();

    if config
        .emergency_keywords
        .iter()
        .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    {
        return RouteDecision::Handover(HandoverReason::Emergency);
    }

    if has_handover_intent(text) {
        return RouteDecision::Handover(HandoverReason::Explicit);
    }

    let window_start = now - Duration::seconds(config.rate_limit_window_secs.max(1));
    if conversation.visitor_messages_since(window_start) > config.rate_limit_messages {
        let notify = conversation
            .throttle_notice_at
            .map(|at| at <= window_start)
            .unwrap_or(true);
        return RouteDecision::Throttled { notify };
    }

    if config.llm_enabled {
        return RouteDecision::GenerateLlm;
    }

    match kb::match_knowledge_base(kb_entries, text) {
        Some(KbMatch::Answer(answer)) => RouteDecision::KbReply(answer),
        Some(KbMatch::Suggestions(suggestions)) => {
            RouteDecision::KbReply(kb::suggestion_reply(&suggestions))
        }
        None => {
            if config.handover_after_misses > 0
                && conversation.consecutive_bot_misses + 1 >= config.handover_after_misses
            {
                RouteDecision::Handover(HandoverReason::BotMiss)
            } else {
                RouteDecision::Fallback(config.fallback_message.clone())
            }
        }
    }
}

pub fn has_handover_intent(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    let terms = [
        "human",
        "real person",
        "representative",
        "live agent",
        "transfer",
        "handover",
        "talk to agent",
        "speak to agent",
        "speak with agent",
        "talk to someone",
    ];
    terms.iter().any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;

    fn base_config() -> WidgetConfig {
        let mut config = WidgetConfig::default_for("w1");
        config.intro_flow_enabled = false;
        config
    }

    fn kb_entry() -> KbEntry {
        KbEntry {
            id: "hours".to_string(),
            question: "What are your opening hours?".to_string(),
            answer: "We are open 9-5 weekdays.".to_string(),
            keywords: vec![],
        }
    }

    #[test]
    fn explicit_human_request_triggers_handover() {
        let conv = Conversation::new("w1", false);
        let decision = route(
            &conv,
            &base_config(),
            &[kb_entry()],
            "I need to speak to a human",
            Utc::now(),
        );
        assert_eq!(decision, RouteDecision::Handover(HandoverReason::Explicit));
    }

    #[test]
    fn emergency_keyword_wins_over_everything() {
        let config = base_config();
        let mut conv = Conversation::new("w1", false);
        // Even a throttled conversation escalates emergencies.
        for _ in 0..50 {
            conv.append(MessageType::Visitor, "hello");
        }
        let decision = route(
            &conv,
            &config,
            &[],
            "I am having chest pain right now",
            Utc::now(),
        );
        assert_eq!(decision, RouteDecision::Handover(HandoverReason::Emergency));
    }

    #[test]
    fn kb_match_answers_when_llm_disabled() {
        let conv = Conversation::new("w1", false);
        let decision = route(
            &conv,
            &base_config(),
            &[kb_entry()],
            "What are your opening hours?",
            Utc::now(),
        );
        match decision {
            RouteDecision::KbReply(answer) => assert_eq!(answer, "We are open 9-5 weekdays."),
            other => panic!("expected kb reply, got {other:?}"),
        }
    }

    #[test]
    fn llm_enabled_routes_to_generation() {
        let mut config = base_config();
        config.llm_enabled = true;
        let conv = Conversation::new("w1", false);
        let decision = route(&conv, &config, &[], "anything at all", Utc::now());
        assert_eq!(decision, RouteDecision::GenerateLlm);
    }

    #[test]
    fn no_match_falls_back_then_escalates_after_misses() {
        let mut config = base_config();
        config.handover_after_misses = 2;
        let mut conv = Conversation::new("w1", false);

        let decision = route(&conv, &config, &[], "gibberish zzz", Utc::now());
        assert_eq!(
            decision,
            RouteDecision::Fallback(config.fallback_message.clone())
        );

        conv.consecutive_bot_misses = 1;
        let decision = route(&conv, &config, &[], "gibberish zzz", Utc::now());
        assert_eq!(decision, RouteDecision::Handover(HandoverReason::BotMiss));
    }

    #[test]
    fn rate_limit_notifies_once_per_window() {
        let mut config = base_config();
        config.rate_limit_messages = 2;
        config.rate_limit_window_secs = 60;
        let mut conv = Conversation::new("w1", false);
        for _ in 0..3 {
            conv.append(MessageType::Visitor, "spam");
        }

        let now = Utc::now();
        assert_eq!(
            route(&conv, &config, &[], "more spam", now),
            RouteDecision::Throttled { notify: true }
        );

        conv.throttle_notice_at = Some(now);
        assert_eq!(
            route(&conv, &config, &[], "more spam", now),
            RouteDecision::Throttled { notify: false }
        );
    }
}

use crate::types::{HandoverMethod, WidgetConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverReason {
    Emergency,
    Explicit,
    BotMiss,
    LlmSignal,
    AgentIntervention,
}

impl HandoverReason {
    pub fn describe(self) -> &'static str {
        match self {
            HandoverReason::Emergency => "emergency keyword detected",
            HandoverReason::Explicit => "visitor asked for a human",
            HandoverReason::BotMiss => "bot could not answer",
            HandoverReason::LlmSignal => "assistant requested transfer",
            HandoverReason::AgentIntervention => "agent joined the conversation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandoverStart {
    /// Park in `handover_requested` and ask the visitor to pick a channel.
    PromptChoice(String),
    /// Single viable method; activate immediately.
    Direct(HandoverMethod),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceOutcome {
    Selected(HandoverMethod),
    Reprompt(String),
}

/// Picks the handover path from the widget's configured options. The choice
/// step only happens when both methods are enabled and the widget opted into
/// it; otherwise the single enabled (or default) method activates directly.
pub fn initiate(config: &WidgetConfig) -> HandoverStart {
    let agent = config.handover_options.agent;
    let whatsapp =
        config.handover_options.whatsapp && !config.handover_whatsapp_number.trim().is_empty();

    match (agent, whatsapp) {
        (true, true) if config.enable_handover_choice => {
            HandoverStart::PromptChoice(choice_prompt())
        }
        (true, true) => HandoverStart::Direct(resolve_default(config)),
        (true, false) => HandoverStart::Direct(HandoverMethod::Agent),
        (false, true) => HandoverStart::Direct(HandoverMethod::Whatsapp),
        // Nothing enabled: the agent queue always exists as a last resort.
        (false, false) => HandoverStart::Direct(HandoverMethod::Agent),
    }
}

fn resolve_default(config: &WidgetConfig) -> HandoverMethod {
    match config.default_handover_method {
        HandoverMethod::None => HandoverMethod::Agent,
        method => method,
    }
}

/// Consumes the visitor's reply to the choice prompt. Runs instead of the
/// Response Router while the conversation sits in `handover_requested`.
pub fn consume_choice(config: &WidgetConfig, text: &str) -> ChoiceOutcome {
    let normalized = text.trim().to_lowercase();

    let wants_agent = normalized == "1"
        || normalized.contains("agent")
        || normalized.contains("live chat")
        || normalized.contains("here");
    let wants_whatsapp = normalized == "2" || normalized.contains("whatsapp");

    if wants_whatsapp && config.handover_options.whatsapp {
        return ChoiceOutcome::Selected(HandoverMethod::Whatsapp);
    }
    if wants_agent && config.handover_options.agent {
        return ChoiceOutcome::Selected(HandoverMethod::Agent);
    }
    ChoiceOutcome::Reprompt(choice_prompt())
}

pub fn choice_prompt() -> String {
    "How would you like to continue? Reply 1 to chat with a live agent here, or 2 to continue \
     on WhatsApp."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HandoverOptions;

    fn config(agent: bool, whatsapp: bool, choice: bool) -> WidgetConfig {
        let mut config = WidgetConfig::default_for("w1");
        config.handover_options = HandoverOptions { agent, whatsapp };
        config.enable_handover_choice = choice;
        config.handover_whatsapp_number = if whatsapp {
            "+15550001111".to_string()
        } else {
            String::new()
        };
        config
    }

    #[test]
    fn both_methods_with_choice_prompts_visitor() {
        assert_eq!(
            initiate(&config(true, true, true)),
            HandoverStart::PromptChoice(choice_prompt())
        );
    }

    #[test]
    fn both_methods_without_choice_uses_default() {
        let mut cfg = config(true, true, false);
        cfg.default_handover_method = HandoverMethod::Whatsapp;
        assert_eq!(initiate(&cfg), HandoverStart::Direct(HandoverMethod::Whatsapp));
    }

    #[test]
    fn single_method_skips_choice_even_when_enabled() {
        assert_eq!(
            initiate(&config(true, false, true)),
            HandoverStart::Direct(HandoverMethod::Agent)
        );
        assert_eq!(
            initiate(&config(false, true, true)),
            HandoverStart::Direct(HandoverMethod::Whatsapp)
        );
    }

    #[test]
    fn whatsapp_without_number_falls_back_to_agent() {
        let mut cfg = config(false, true, false);
        cfg.handover_whatsapp_number = String::new();
        assert_eq!(initiate(&cfg), HandoverStart::Direct(HandoverMethod::Agent));
    }

    #[test]
    fn choice_reply_parsing() {
        let cfg = config(true, true, true);
        assert_eq!(
            consume_choice(&cfg, "1"),
            ChoiceOutcome::Selected(HandoverMethod::Agent)
        );
        assert_eq!(
            consume_choice(&cfg, " WhatsApp please "),
            ChoiceOutcome::Selected(HandoverMethod::Whatsapp)
        );
        assert_eq!(
            consume_choice(&cfg, "neither thanks"),
            ChoiceOutcome::Reprompt(choice_prompt())
        );
    }

    #[test]
    fn disabled_method_cannot_be_chosen() {
        let cfg = config(true, false, true);
        assert_eq!(
            consume_choice(&cfg, "2"),
            ChoiceOutcome::Reprompt(choice_prompt())
        );
    }
}

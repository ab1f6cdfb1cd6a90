use crate::types::{Conversation, IntroAnswer, IntroField, IntroQuestion, WidgetConfig};

pub const SKIP_KEYWORD: &str = "skip";

#[derive(Debug, Clone, PartialEq)]
pub enum IntroStep {
    /// Ask (or re-ask) this question next.
    Ask(IntroQuestion),
    Done,
}

/// The question to open with when a conversation is created mid-intro.
pub fn first_question(config: &WidgetConfig) -> Option<&IntroQuestion> {
    config.intro_questions.first()
}

/// Consumes one visitor answer and returns the next step.
///
/// Questions are asked strictly in configured order. Required questions are
/// re-asked until a non-empty, non-skip answer arrives; optional questions
/// accept "skip" and record an empty marker. Progress is measured against the
/// current config list, so an admin shrinking the list mid-conversation
/// resolves to `Done` instead of indexing out of range.
pub fn advance(conversation: &mut Conversation, config: &WidgetConfig, answer: &str) -> IntroStep {
    let index = conversation.intro_answers.len();
    let Some(question) = config.intro_questions.get(index) else {
        return IntroStep::Done;
    };

    let trimmed = answer.trim();
    let skipped = trimmed.eq_ignore_ascii_case(SKIP_KEYWORD);

    if question.required && (trimmed.is_empty() || skipped) {
        return IntroStep::Ask(question.clone());
    }

    let recorded = if skipped { "" } else { trimmed };
    conversation.intro_answers.push(IntroAnswer {
        question_id: question.id.clone(),
        answer: recorded.to_string(),
    });
    apply_identity(conversation, question.field, recorded);

    match config.intro_questions.get(index + 1) {
        Some(next) => IntroStep::Ask(next.clone()),
        None => IntroStep::Done,
    }
}

fn apply_identity(conversation: &mut Conversation, field: IntroField, answer: &str) {
    if answer.is_empty() {
        return;
    }
    match field {
        IntroField::Name => conversation.visitor_name = answer.to_string(),
        IntroField::Email => conversation.visitor_email = answer.to_string(),
        IntroField::Phone => conversation.visitor_phone = answer.to_string(),
        IntroField::Company | IntroField::None => {}
    }
}

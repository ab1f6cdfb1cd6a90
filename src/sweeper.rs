use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{self, ConversationEvent};
use crate::types::{AppState, Conversation, ConversationState, MessageType, WidgetConfig};

pub const VISITOR_REMINDER: &str =
    "This conversation has been inactive for a while. Are you still there?";
pub const VISITOR_EXTENSION_OFFER: &str =
    "Do you need more time? Reply \"yes\" or \"yes 10\" to keep this conversation open.";
pub const AGENT_REMINDER: &str =
    "Reminder: this conversation has been waiting on a reply for a while.";
pub const AGENT_EXTENSION_OFFER: &str =
    "Do you need more time with this conversation? Reply \"yes\" or \"yes 10\" to extend, or \
     \"stop conversation\" to end it.";
pub const CLOSED_BY_SWEEP: &str =
    "This conversation has been automatically closed due to inactivity. Please start a new \
     conversation if you need further assistance.";

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub closed_count: u32,
    pub reminders_sent: u32,
}

/// One pass over every non-closed conversation, delivered as `SweepTick`
/// events so each evaluation serializes with inbound traffic on the
/// per-conversation lock. Ticks never overlap: a sweep that finds another
/// one in flight returns immediately.
pub async fn run_inactivity_sweep(state: &Arc<AppState>) -> SweepReport {
    let Ok(_gate) = state.sweep_gate.try_lock() else {
        info!("inactivity sweep already running; skipping this tick");
        return SweepReport::default();
    };

    let ids: Vec<String> = {
        let conversations = state.conversations.read().await;
        conversations
            .values()
            .filter(|c| !c.state.is_closed())
            .map(|c| c.id.clone())
            .collect()
    };

    let mut report = SweepReport::default();
    for id in ids {
        match engine::handle_event(state, &id, ConversationEvent::SweepTick).await {
            Ok(outcome) => {
                report.reminders_sent += outcome.reminders_sent;
                if outcome.closed_now {
                    report.closed_count += 1;
                }
            }
            Err(err) => warn!(conversation_id = %id, error = %err, "sweep tick failed"),
        }
    }
    report
}

/// Background scheduler for the sweep, spawned at boot.
pub fn spawn_interval(state: Arc<AppState>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let report = run_inactivity_sweep(&state).await;
            if report.closed_count > 0 || report.reminders_sent > 0 {
                info!(
                    closed = report.closed_count,
                    reminders = report.reminders_sent,
                    "inactivity sweep finished"
                );
            }
        }
    });
}

#[derive(Debug, Default, Clone)]
pub struct TickOutcome {
    pub reminders_sent: u32,
    pub closed_now: bool,
    /// Reminder texts to forward to the handover WhatsApp number.
    pub agent_notices: Vec<String>,
    /// Messages appended during the tick, in order.
    pub appended: Vec<crate::types::ChatMessage>,
}

/// One inactivity evaluation for one conversation, run by the engine under
/// the per-conversation lock.
///
/// Idle time is measured from the newest of visitor activity, agent activity
/// and any granted extension; a future `extension_granted_until` therefore
/// pushes the whole schedule out, and a past one simply stops counting
/// (lazy invalidation). Reminder counters gate each stage exactly once and
/// never decrease, so re-running a sweep inside the same threshold window is
/// a no-op.
pub fn apply_tick(
    conversation: &mut Conversation,
    config: &WidgetConfig,
    now: DateTime<Utc>,
) -> TickOutcome {
    let mut outcome = TickOutcome::default();
    if conversation.state.is_closed() {
        return outcome;
    }

    let warn = Duration::minutes(config.warn_after_mins);
    let grace = Duration::minutes(config.grace_after_mins);
    let close = Duration::minutes(config.close_after_mins);

    let basis = idle_basis(conversation);
    let idle = now - basis;

    if idle >= close {
        let valid_extension = conversation
            .extension_granted_until
            .map(|until| until > now)
            .unwrap_or(false);
        if !valid_extension {
            conversation.state = ConversationState::Closed;
            conversation.ended_at = Some(now);
            conversation.close_reason = close_reason(conversation);
            let message = conversation.append(MessageType::System, CLOSED_BY_SWEEP);
            outcome.appended.push(message);
            outcome.closed_now = true;
            return outcome;
        }
    }

    // Visitor reminder track.
    if let Some(last) = conversation.last_visitor_activity_at {
        let visitor_idle = now - effective_basis(last, conversation.extension_granted_until);
        let count = conversation.visitor_extension_reminders_count;
        if count < config.max_extension_reminders {
            if count == 0 && visitor_idle >= warn {
                let message = conversation.append(MessageType::System, VISITOR_REMINDER);
                outcome.appended.push(message);
                conversation.visitor_extension_reminders_count += 1;
                conversation.last_visitor_reminder_at = Some(now);
                outcome.reminders_sent += 1;
            } else if count == 1 && visitor_idle >= grace {
                let message = conversation.append(MessageType::System, VISITOR_EXTENSION_OFFER);
                outcome.appended.push(message);
                conversation.visitor_extension_reminders_count += 1;
                conversation.last_visitor_reminder_at = Some(now);
                outcome.reminders_sent += 1;
            }
        }
    }

    // Agent reminder track: only meaningful once a human is engaged.
    if conversation.state == ConversationState::HandoverActive {
        if let Some(last) = conversation.last_agent_activity_at {
            let agent_idle = now - effective_basis(last, conversation.extension_granted_until);
            let count = conversation.extension_reminders_count;
            if count < config.max_extension_reminders {
                if count == 0 && agent_idle >= warn {
                    let message = conversation.append(MessageType::System, AGENT_REMINDER);
                    outcome.appended.push(message);
                    outcome.agent_notices.push(agent_notice(conversation, AGENT_REMINDER));
                    conversation.extension_reminders_count += 1;
                    conversation.last_agent_reminder_at = Some(now);
                    outcome.reminders_sent += 1;
                } else if count == 1 && agent_idle >= grace {
                    let message = conversation.append(MessageType::System, AGENT_EXTENSION_OFFER);
                    outcome.appended.push(message);
                    outcome
                        .agent_notices
                        .push(agent_notice(conversation, AGENT_EXTENSION_OFFER));
                    conversation.extension_reminders_count += 1;
                    conversation.last_agent_reminder_at = Some(now);
                    outcome.reminders_sent += 1;
                }
            }
        }
    }

    outcome
}

fn idle_basis(conversation: &Conversation) -> DateTime<Utc> {
    let mut basis = conversation.created_at;
    for candidate in [
        conversation.last_visitor_activity_at,
        conversation.last_agent_activity_at,
        conversation.extension_granted_until,
    ]
    .into_iter()
    .flatten()
    {
        if candidate > basis {
            basis = candidate;
        }
    }
    basis
}

fn effective_basis(last: DateTime<Utc>, extension: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match extension {
        Some(until) if until > last => until,
        _ => last,
    }
}

fn close_reason(conversation: &Conversation) -> String {
    match (
        conversation.last_visitor_activity_at,
        conversation.last_agent_activity_at,
    ) {
        (Some(visitor), Some(agent)) if agent < visitor => "agent_inactivity".to_string(),
        (_, _) => "visitor_inactivity".to_string(),
    }
}

fn agent_notice(conversation: &Conversation, text: &str) -> String {
    let visitor = if conversation.visitor_name.is_empty() {
        "Visitor"
    } else {
        conversation.visitor_name.as_str()
    };
    format!("[{} / conversation {}] {}", visitor, conversation.id, text)
}

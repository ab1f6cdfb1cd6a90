use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::types::{
    AppState, ChatMessage, Conversation, ConversationState, HandoverMethod, IntroAnswer, KbEntry,
    MessageType, WidgetConfig,
};

fn iso(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn iso_opt(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(iso)
}

fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn state_str(state: ConversationState) -> &'static str {
    match state {
        ConversationState::IntroPending => "intro_pending",
        ConversationState::ActiveBot => "active_bot",
        ConversationState::HandoverRequested => "handover_requested",
        ConversationState::HandoverActive => "handover_active",
        ConversationState::Closed => "closed",
    }
}

fn parse_state(value: &str) -> ConversationState {
    match value {
        "intro_pending" => ConversationState::IntroPending,
        "handover_requested" => ConversationState::HandoverRequested,
        "handover_active" => ConversationState::HandoverActive,
        "closed" => ConversationState::Closed,
        _ => ConversationState::ActiveBot,
    }
}

fn method_str(method: HandoverMethod) -> &'static str {
    match method {
        HandoverMethod::None => "none",
        HandoverMethod::Agent => "agent",
        HandoverMethod::Whatsapp => "whatsapp",
    }
}

fn parse_method(value: &str) -> HandoverMethod {
    match value {
        "agent" => HandoverMethod::Agent,
        "whatsapp" => HandoverMethod::Whatsapp,
        _ => HandoverMethod::None,
    }
}

fn message_type_str(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Visitor => "visitor",
        MessageType::Bot => "bot",
        MessageType::Agent => "agent",
        MessageType::System => "system",
    }
}

fn parse_message_type(value: &str) -> MessageType {
    match value {
        "bot" => MessageType::Bot,
        "agent" => MessageType::Agent,
        "system" => MessageType::System,
        _ => MessageType::Visitor,
    }
}

/// Write-through persistence. The in-memory map is the authority; a failed
/// write is logged and the conversation keeps flowing.
pub async fn save_conversation(state: &AppState, conversation: &Conversation) {
    let Some(pool) = &state.db else {
        return;
    };

    let result = sqlx::query(
        "INSERT INTO conversations ( \
             id, widget_id, visitor_name, visitor_email, visitor_phone, state, \
             intro_completed, intro_answers, handover_method, handover_target, \
             whatsapp_message_sid, last_visitor_activity_at, last_agent_activity_at, \
             extension_reminders_count, visitor_extension_reminders_count, \
             extension_granted_until, last_agent_reminder_at, last_visitor_reminder_at, \
             consecutive_bot_misses, message_count, created_at, updated_at, ended_at, \
             close_reason \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                   $17, $18, $19, $20, $21, $22, $23, $24) \
         ON CONFLICT (id) DO UPDATE SET \
             visitor_name = EXCLUDED.visitor_name, \
             visitor_email = EXCLUDED.visitor_email, \
             visitor_phone = EXCLUDED.visitor_phone, \
             state = EXCLUDED.state, \
             intro_completed = EXCLUDED.intro_completed, \
             intro_answers = EXCLUDED.intro_answers, \
             handover_method = EXCLUDED.handover_method, \
             handover_target = EXCLUDED.handover_target, \
             whatsapp_message_sid = EXCLUDED.whatsapp_message_sid, \
             last_visitor_activity_at = EXCLUDED.last_visitor_activity_at, \
             last_agent_activity_at = EXCLUDED.last_agent_activity_at, \
             extension_reminders_count = EXCLUDED.extension_reminders_count, \
             visitor_extension_reminders_count = EXCLUDED.visitor_extension_reminders_count, \
             extension_granted_until = EXCLUDED.extension_granted_until, \
             last_agent_reminder_at = EXCLUDED.last_agent_reminder_at, \
             last_visitor_reminder_at = EXCLUDED.last_visitor_reminder_at, \
             consecutive_bot_misses = EXCLUDED.consecutive_bot_misses, \
             message_count = EXCLUDED.message_count, \
             updated_at = EXCLUDED.updated_at, \
             ended_at = EXCLUDED.ended_at, \
             close_reason = EXCLUDED.close_reason",
    )
    .bind(&conversation.id)
    .bind(&conversation.widget_id)
    .bind(&conversation.visitor_name)
    .bind(&conversation.visitor_email)
    .bind(&conversation.visitor_phone)
    .bind(state_str(conversation.state))
    .bind(conversation.intro_completed)
    .bind(serde_json::to_string(&conversation.intro_answers).unwrap_or_else(|_| "[]".to_string()))
    .bind(method_str(conversation.handover_method))
    .bind(&conversation.handover_target)
    .bind(&conversation.whatsapp_message_sid)
    .bind(iso_opt(conversation.last_visitor_activity_at))
    .bind(iso_opt(conversation.last_agent_activity_at))
    .bind(conversation.extension_reminders_count as i32)
    .bind(conversation.visitor_extension_reminders_count as i32)
    .bind(iso_opt(conversation.extension_granted_until))
    .bind(iso_opt(conversation.last_agent_reminder_at))
    .bind(iso_opt(conversation.last_visitor_reminder_at))
    .bind(conversation.consecutive_bot_misses as i32)
    .bind(conversation.message_count as i64)
    .bind(iso(conversation.created_at))
    .bind(iso(conversation.updated_at))
    .bind(iso_opt(conversation.ended_at))
    .bind(&conversation.close_reason)
    .execute(pool)
    .await;
    if let Err(err) = result {
        warn!(conversation_id = %conversation.id, error = %err, "conversation write failed");
    }

    for message in &conversation.messages {
        let _ = sqlx::query(
            "INSERT INTO conversation_messages (id, conversation_id, message_type, text, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message_type_str(message.message_type))
        .bind(&message.text)
        .bind(iso(message.created_at))
        .execute(pool)
        .await;
    }
}

pub async fn load_widget_config(pool: &PgPool, widget_id: &str) -> Option<WidgetConfig> {
    let row = sqlx::query("SELECT config FROM widget_configs WHERE widget_id = $1")
        .bind(widget_id)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()?;
    let raw: String = row.get("config");
    serde_json::from_str::<WidgetConfig>(&raw).ok()
}

pub async fn load_kb_entries(pool: &PgPool, widget_id: &str) -> Vec<KbEntry> {
    let rows = sqlx::query(
        "SELECT id, question, answer, keywords FROM widget_knowledge_base \
         WHERE widget_id = $1 ORDER BY created_at",
    )
    .bind(widget_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    rows.iter()
        .map(|row| KbEntry {
            id: row.get("id"),
            question: row.get("question"),
            answer: row.get("answer"),
            keywords: serde_json::from_str(&row.get::<String, _>("keywords")).unwrap_or_default(),
        })
        .collect()
}

/// Loads non-closed conversations into the in-memory store at boot, and
/// rebuilds the WhatsApp external-id correlation map.
pub async fn hydrate(state: &AppState) {
    let Some(pool) = &state.db else {
        return;
    };

    let rows = sqlx::query("SELECT * FROM conversations WHERE state <> 'closed'")
        .fetch_all(pool)
        .await
        .unwrap_or_default();

    let mut loaded = 0usize;
    for row in rows {
        let mut conversation = row_to_conversation(&row);
        conversation.messages = load_messages(pool, &conversation.id).await;

        if !conversation.whatsapp_message_sid.is_empty() {
            let mut routes = state.whatsapp_routes.write().await;
            routes.insert(
                conversation.whatsapp_message_sid.clone(),
                conversation.id.clone(),
            );
        }

        let mut conversations = state.conversations.write().await;
        conversations.insert(conversation.id.clone(), conversation);
        loaded += 1;
    }
    tracing::info!(loaded, "hydrated open conversations");
}

async fn load_messages(pool: &PgPool, conversation_id: &str) -> Vec<ChatMessage> {
    let rows = sqlx::query(
        "SELECT id, conversation_id, message_type, text, created_at \
         FROM conversation_messages WHERE conversation_id = $1 ORDER BY created_at",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default();

    rows.iter()
        .map(|row| ChatMessage {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            message_type: parse_message_type(&row.get::<String, _>("message_type")),
            text: row.get("text"),
            created_at: parse_iso(&row.get::<String, _>("created_at")).unwrap_or_else(Utc::now),
        })
        .collect()
}

fn row_to_conversation(row: &sqlx::postgres::PgRow) -> Conversation {
    let opt_ts = |column: &str| -> Option<DateTime<Utc>> {
        row.get::<Option<String>, _>(column)
            .as_deref()
            .and_then(parse_iso)
    };

    let intro_answers: Vec<IntroAnswer> =
        serde_json::from_str(&row.get::<String, _>("intro_answers")).unwrap_or_default();

    Conversation {
        id: row.get("id"),
        widget_id: row.get("widget_id"),
        visitor_name: row.get("visitor_name"),
        visitor_email: row.get("visitor_email"),
        visitor_phone: row.get("visitor_phone"),
        state: parse_state(&row.get::<String, _>("state")),
        intro_completed: row.get("intro_completed"),
        intro_answers,
        handover_method: parse_method(&row.get::<String, _>("handover_method")),
        handover_target: row.get("handover_target"),
        whatsapp_message_sid: row.get("whatsapp_message_sid"),
        last_visitor_activity_at: opt_ts("last_visitor_activity_at"),
        last_agent_activity_at: opt_ts("last_agent_activity_at"),
        extension_reminders_count: row.get::<i32, _>("extension_reminders_count") as u32,
        visitor_extension_reminders_count: row
            .get::<i32, _>("visitor_extension_reminders_count")
            as u32,
        extension_granted_until: opt_ts("extension_granted_until"),
        last_agent_reminder_at: opt_ts("last_agent_reminder_at"),
        last_visitor_reminder_at: opt_ts("last_visitor_reminder_at"),
        consecutive_bot_misses: row.get::<i32, _>("consecutive_bot_misses") as u32,
        throttle_notice_at: None,
        message_count: row.get::<i64, _>("message_count") as u64,
        messages: Vec::new(),
        seen_event_keys: Default::default(),
        created_at: parse_iso(&row.get::<String, _>("created_at")).unwrap_or_else(Utc::now),
        updated_at: parse_iso(&row.get::<String, _>("updated_at")).unwrap_or_else(Utc::now),
        ended_at: opt_ts("ended_at"),
        close_reason: row.get("close_reason"),
    }
}

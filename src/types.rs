use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    IntroPending,
    ActiveBot,
    HandoverRequested,
    HandoverActive,
    Closed,
}

impl ConversationState {
    pub fn is_closed(self) -> bool {
        matches!(self, ConversationState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Visitor,
    Bot,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverMethod {
    None,
    Agent,
    Whatsapp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub message_type: MessageType,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(conversation_id: &str, message_type: MessageType, text: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_type,
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroAnswer {
    pub question_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub widget_id: String,
    #[serde(default)]
    pub visitor_name: String,
    #[serde(default)]
    pub visitor_email: String,
    #[serde(default)]
    pub visitor_phone: String,
    pub state: ConversationState,
    pub intro_completed: bool,
    #[serde(default)]
    pub intro_answers: Vec<IntroAnswer>,
    pub handover_method: HandoverMethod,
    #[serde(default)]
    pub handover_target: String,
    #[serde(default)]
    pub whatsapp_message_sid: String,
    pub last_visitor_activity_at: Option<DateTime<Utc>>,
    pub last_agent_activity_at: Option<DateTime<Utc>>,
    pub extension_reminders_count: u32,
    pub visitor_extension_reminders_count: u32,
    pub extension_granted_until: Option<DateTime<Utc>>,
    pub last_agent_reminder_at: Option<DateTime<Utc>>,
    pub last_visitor_reminder_at: Option<DateTime<Utc>>,
    pub consecutive_bot_misses: u32,
    pub throttle_notice_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(skip)]
    pub seen_event_keys: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: String,
}

impl Conversation {
    pub fn new(widget_id: &str, intro_flow_enabled: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            widget_id: widget_id.to_string(),
            visitor_name: String::new(),
            visitor_email: String::new(),
            visitor_phone: String::new(),
            state: if intro_flow_enabled {
                ConversationState::IntroPending
            } else {
                ConversationState::ActiveBot
            },
            intro_completed: !intro_flow_enabled,
            intro_answers: Vec::new(),
            handover_method: HandoverMethod::None,
            handover_target: String::new(),
            whatsapp_message_sid: String::new(),
            last_visitor_activity_at: None,
            last_agent_activity_at: None,
            extension_reminders_count: 0,
            visitor_extension_reminders_count: 0,
            extension_granted_until: None,
            last_agent_reminder_at: None,
            last_visitor_reminder_at: None,
            consecutive_bot_misses: 0,
            throttle_notice_at: None,
            message_count: 0,
            messages: Vec::new(),
            seen_event_keys: HashSet::new(),
            created_at: now,
            updated_at: now,
            ended_at: None,
            close_reason: String::new(),
        }
    }

    /// Appends to the append-only log and bumps the derived counters.
    pub fn append(&mut self, message_type: MessageType, text: &str) -> ChatMessage {
        let message = ChatMessage::new(&self.id, message_type, text);
        self.messages.push(message.clone());
        self.message_count += 1;
        self.updated_at = message.created_at;
        message
    }

    /// Number of visitor messages newer than `window_start`.
    pub fn visitor_messages_since(&self, window_start: DateTime<Utc>) -> u32 {
        self.messages
            .iter()
            .filter(|m| m.message_type == MessageType::Visitor && m.created_at > window_start)
            .count() as u32
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            widget_id: self.widget_id.clone(),
            visitor_name: self.visitor_name.clone(),
            state: self.state,
            handover_method: self.handover_method,
            last_message: self.messages.last().cloned(),
            message_count: self.message_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub widget_id: String,
    pub visitor_name: String,
    pub state: ConversationState,
    pub handover_method: HandoverMethod,
    pub last_message: Option<ChatMessage>,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntroField {
    Name,
    Email,
    Phone,
    Company,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroQuestion {
    pub id: String,
    pub prompt: String,
    pub field: IntroField,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoverOptions {
    pub agent: bool,
    pub whatsapp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbEntry {
    pub id: String,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    pub widget_id: String,
    pub widget_name: String,
    #[serde(default)]
    pub bot_name: String,
    #[serde(default)]
    pub bot_personality: String,
    pub intro_flow_enabled: bool,
    #[serde(default)]
    pub intro_questions: Vec<IntroQuestion>,
    pub handover_options: HandoverOptions,
    pub enable_handover_choice: bool,
    pub default_handover_method: HandoverMethod,
    #[serde(default)]
    pub handover_whatsapp_number: String,
    #[serde(default)]
    pub whatsapp_handover_content_sid: String,
    pub llm_enabled: bool,
    pub fallback_message: String,
    #[serde(default)]
    pub emergency_keywords: Vec<String>,
    #[serde(default)]
    pub emergency_message: String,
    pub rate_limit_messages: u32,
    pub rate_limit_window_secs: i64,
    pub warn_after_mins: i64,
    pub grace_after_mins: i64,
    pub close_after_mins: i64,
    pub extension_duration_mins: i64,
    pub max_extension_reminders: u32,
    pub handover_after_misses: u32,
}

impl WidgetConfig {
    /// Baseline config used when the server runs without a database.
    pub fn default_for(widget_id: &str) -> Self {
        Self {
            widget_id: widget_id.to_string(),
            widget_name: "Chat Widget".to_string(),
            bot_name: "Support Bot".to_string(),
            bot_personality: String::new(),
            intro_flow_enabled: true,
            intro_questions: vec![
                IntroQuestion {
                    id: "name".to_string(),
                    prompt: "Hi! Before we start, what is your name?".to_string(),
                    field: IntroField::Name,
                    required: true,
                },
                IntroQuestion {
                    id: "email".to_string(),
                    prompt: "Thanks! What email can we reach you at? (type \"skip\" to skip)"
                        .to_string(),
                    field: IntroField::Email,
                    required: false,
                },
            ],
            handover_options: HandoverOptions {
                agent: true,
                whatsapp: false,
            },
            enable_handover_choice: false,
            default_handover_method: HandoverMethod::Agent,
            handover_whatsapp_number: String::new(),
            whatsapp_handover_content_sid: String::new(),
            llm_enabled: false,
            fallback_message:
                "I'm not sure I have the answer to that yet. Could you rephrase, or would you \
                 like to speak with one of our team members?"
                    .to_string(),
            emergency_keywords: vec![
                "emergency".to_string(),
                "chest pain".to_string(),
                "overdose".to_string(),
                "suicidal".to_string(),
            ],
            emergency_message:
                "If this is a medical emergency, please call 911 or your local emergency number \
                 right away."
                    .to_string(),
            rate_limit_messages: 20,
            rate_limit_window_secs: 60,
            warn_after_mins: 5,
            grace_after_mins: 12,
            close_after_mins: 15,
            extension_duration_mins: 10,
            max_extension_reminders: 3,
            handover_after_misses: 3,
        }
    }
}

pub struct AppState {
    pub db: Option<PgPool>,
    pub conversations: RwLock<HashMap<String, Conversation>>,
    pub conversation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub widget_configs: RwLock<HashMap<String, Arc<WidgetConfig>>>,
    pub knowledge_base: RwLock<HashMap<String, Vec<KbEntry>>>,
    pub whatsapp_routes: RwLock<HashMap<String, String>>,
    pub sweep_gate: Mutex<()>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(db: Option<PgPool>) -> Self {
        Self {
            db,
            conversations: RwLock::new(HashMap::new()),
            conversation_locks: Mutex::new(HashMap::new()),
            widget_configs: RwLock::new(HashMap::new()),
            knowledge_base: RwLock::new(HashMap::new()),
            whatsapp_routes: RwLock::new(HashMap::new()),
            sweep_gate: Mutex::new(()),
            http_client: reqwest::Client::new(),
        }
    }

    /// Per-conversation mutual exclusion. A sweep tick and an inbound message
    /// for the same conversation serialize here; distinct conversations run
    /// in parallel.
    pub async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read-mostly config lookup: cache hit, then database, then (when
    /// running without a database) a baseline default.
    pub async fn widget_config(&self, widget_id: &str) -> Option<Arc<WidgetConfig>> {
        {
            let configs = self.widget_configs.read().await;
            if let Some(config) = configs.get(widget_id) {
                return Some(config.clone());
            }
        }

        let loaded = match &self.db {
            Some(pool) => crate::persist::load_widget_config(pool, widget_id).await?,
            None => WidgetConfig::default_for(widget_id),
        };

        let config = Arc::new(loaded);
        let mut configs = self.widget_configs.write().await;
        Some(
            configs
                .entry(widget_id.to_string())
                .or_insert_with(|| config.clone())
                .clone(),
        )
    }

    pub async fn put_widget_config(&self, config: WidgetConfig) {
        let mut configs = self.widget_configs.write().await;
        configs.insert(config.widget_id.clone(), Arc::new(config));
    }

    /// Invalidation signal published on admin-side config updates.
    pub async fn invalidate_widget_config(&self, widget_id: &str) {
        let mut configs = self.widget_configs.write().await;
        configs.remove(widget_id);
    }

    pub async fn put_kb_entries(&self, widget_id: &str, entries: Vec<KbEntry>) {
        let mut kb = self.knowledge_base.write().await;
        kb.insert(widget_id.to_string(), entries);
    }

    pub async fn kb_entries(&self, widget_id: &str) -> Vec<KbEntry> {
        {
            let kb = self.knowledge_base.read().await;
            if let Some(entries) = kb.get(widget_id) {
                return entries.clone();
            }
        }

        let loaded = match &self.db {
            Some(pool) => crate::persist::load_kb_entries(pool, widget_id).await,
            None => Vec::new(),
        };
        let mut kb = self.knowledge_base.write().await;
        kb.entry(widget_id.to_string()).or_insert(loaded).clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorMessageBody {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppWebhookBody {
    pub external_message_id: String,
    pub text: String,
}

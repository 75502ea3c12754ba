use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender as ReplyTx};
use serde::{Deserialize, Serialize};

use crate::store::{KeyValueStore, CONVERSATION_HISTORY_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Voice,
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Clip length in seconds, voice messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Message {
    fn new(sender: Sender, kind: MessageKind, text: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        Self {
            id: new_message_id(timestamp),
            text: text.into(),
            sender,
            timestamp,
            kind,
            image_url: None,
            audio_url: None,
            duration: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Sender::User, MessageKind::Text, text)
    }

    pub fn ai_text(text: impl Into<String>) -> Self {
        Self::new(Sender::Ai, MessageKind::Text, text)
    }

    pub fn user_image(image_url: impl Into<String>, caption: impl Into<String>) -> Self {
        let mut message = Self::new(Sender::User, MessageKind::Image, caption);
        message.image_url = Some(image_url.into());
        message
    }

    pub fn user_voice(transcript: impl Into<String>, audio_url: impl Into<String>, duration: f64) -> Self {
        let mut message = Self::new(Sender::User, MessageKind::Voice, transcript);
        message.audio_url = Some(audio_url.into());
        message.duration = Some(duration);
        message
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == Sender::User
    }
}

/// Creation time in milliseconds plus a short random suffix, so ids sort
/// roughly by time but never collide within the same millisecond.
fn new_message_id(timestamp: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", timestamp.timestamp_millis(), &suffix[..8])
}

/// RFC 3339 in UTC with millisecond precision, e.g. `2024-05-01T08:30:00.123Z`.
/// Fixed width, so stored timestamps sort lexicographically.
pub(crate) mod timestamp_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(timestamp: &DateTime<Utc>) -> String {
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn decode(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw.trim()).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(
        timestamp: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(timestamp))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        decode(&raw).map_err(serde::de::Error::custom)
    }
}

/// Loads and saves the whole message log as one JSON blob.
#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn KeyValueStore>,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read the stored history. Missing or unreadable data yields an empty log.
    pub async fn load(&self) -> Vec<Message> {
        let raw = match self.store.get(CONVERSATION_HISTORY_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read conversation history: {}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Message>>(&raw) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("Discarding malformed conversation history: {}", e);
                Vec::new()
            }
        }
    }

    /// Overwrite the stored history with `messages`.
    pub async fn save(&self, messages: &[Message]) -> Result<()> {
        let json =
            serde_json::to_string(messages).context("Failed to serialize conversation history")?;
        self.store
            .set(CONVERSATION_HISTORY_KEY, &json)
            .await
            .context("Failed to write conversation history")
    }

    pub async fn clear(&self) -> Result<()> {
        self.store
            .remove(CONVERSATION_HISTORY_KEY)
            .await
            .context("Failed to clear conversation history")
    }
}

enum LogCommand {
    Snapshot {
        reply: ReplyTx<LogSnapshot>,
    },
    Append {
        generation: u64,
        messages: Vec<Message>,
        only_if_empty: bool,
        reply: ReplyTx<Result<AppendOutcome>>,
    },
    Clear {
        reply: ReplyTx<Result<()>>,
    },
}

/// History as seen at one point in time, tagged with the clear-generation it
/// belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSnapshot {
    pub generation: u64,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(Vec<Message>),
    /// The history was cleared (or, for a seed, is no longer empty) since the
    /// snapshot was taken. Nothing was written.
    Stale,
}

/// Single-writer front for the conversation history.
///
/// Every read-modify-write goes through one task that owns the in-memory log,
/// so two flows appending at the same time (a user turn and a proactive
/// message) cannot overwrite each other's messages. Each `clear` starts a new
/// generation; appends computed against an older one are rejected.
#[derive(Clone)]
pub struct ConversationLog {
    tx: flume::Sender<LogCommand>,
}

impl ConversationLog {
    /// Start the writer task. Must be called from within a tokio runtime.
    pub fn spawn(store: ConversationStore) -> Self {
        let (tx, rx) = flume::unbounded();
        tokio::spawn(run_writer(store, rx));
        Self { tx }
    }

    pub async fn snapshot(&self) -> Result<LogSnapshot> {
        self.request(|reply| LogCommand::Snapshot { reply }).await
    }

    /// Append messages in order if `generation` is still current.
    pub async fn append(&self, generation: u64, messages: Vec<Message>) -> Result<AppendOutcome> {
        self.request(|reply| LogCommand::Append {
            generation,
            messages,
            only_if_empty: false,
            reply,
        })
        .await?
    }

    /// Append `message` only while the history of `generation` is still empty.
    pub async fn seed(&self, generation: u64, message: Message) -> Result<AppendOutcome> {
        self.request(|reply| LogCommand::Append {
            generation,
            messages: vec![message],
            only_if_empty: true,
            reply,
        })
        .await?
    }

    pub async fn clear(&self) -> Result<()> {
        self.request(|reply| LogCommand::Clear { reply }).await?
    }

    async fn request<T>(&self, build: impl FnOnce(ReplyTx<T>) -> LogCommand) -> Result<T> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.tx
            .send_async(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Conversation writer has stopped"))?;
        reply_rx
            .recv_async()
            .await
            .map_err(|_| anyhow::anyhow!("Conversation writer dropped the request"))
    }
}

async fn run_writer(store: ConversationStore, rx: Receiver<LogCommand>) {
    let mut cache: Option<Vec<Message>> = None;
    let mut current_generation: u64 = 0;

    while let Ok(command) = rx.recv_async().await {
        if cache.is_none() {
            cache = Some(store.load().await);
        }
        let history = cache.get_or_insert_with(Vec::new);

        match command {
            LogCommand::Snapshot { reply } => {
                let _ = reply.send(LogSnapshot {
                    generation: current_generation,
                    messages: history.clone(),
                });
            }
            LogCommand::Append {
                generation,
                messages,
                only_if_empty,
                reply,
            } => {
                if generation != current_generation || (only_if_empty && !history.is_empty()) {
                    tracing::debug!(
                        "Rejecting append of {} message(s) from generation {} (current {})",
                        messages.len(),
                        generation,
                        current_generation
                    );
                    let _ = reply.send(Ok(AppendOutcome::Stale));
                    continue;
                }

                let mut next = history.clone();
                for message in messages {
                    push_ordered(&mut next, message);
                }
                let result = match store.save(&next).await {
                    Ok(()) => {
                        *history = next.clone();
                        Ok(AppendOutcome::Appended(next))
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            LogCommand::Clear { reply } => {
                let result = store.clear().await;
                if result.is_ok() {
                    history.clear();
                    current_generation += 1;
                }
                let _ = reply.send(result);
            }
        }
    }

    tracing::debug!("Conversation writer stopped");
}

fn push_ordered(log: &mut Vec<Message>, mut message: Message) {
    if log.iter().any(|existing| existing.id == message.id) {
        tracing::warn!("Dropping message with duplicate id {}", message.id);
        return;
    }
    if let Some(last) = log.last() {
        if message.timestamp < last.timestamp {
            message.timestamp = last.timestamp;
        }
    }
    log.push(message);
}

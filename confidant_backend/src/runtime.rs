use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use flume::{Receiver, Sender};

use crate::audio::RecordedClip;
use crate::config::CompanionConfig;
use crate::context::ContextAssembler;
use crate::conversation::{AppendOutcome, ConversationLog, ConversationStore, Message};
use crate::database::CompanionDatabase;
use crate::error::TurnError;
use crate::llm_client::{ChatCompletionClient, CompletionOptions};
use crate::notifications::{
    LocalNotificationService, NotificationContent, NotificationEvent, NotificationService,
};
use crate::proactive::{ProactiveScheduler, ScheduleOutcome};
use crate::profile::{AiProfile, ProfileDraft, ProfileStore};
use crate::speech::SpeechClient;
use crate::store::KeyValueStore;

const IMAGE_CAPTION: &str = "shared an image";
const IMAGE_PROMPT: &str = "I see you shared an image!";

/// Published to the front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum CompanionEvent {
    MessageAppended(Message),
    HistoryCleared,
    ProactiveScheduled { delay: Duration },
    /// User-facing alert text for a failed turn.
    Alert(String),
}

/// Application context created once at start-up. Owns every collaborator
/// (storage, clients, scheduler) and is passed by reference to whoever needs it.
pub struct CompanionRuntime {
    pub config: CompanionConfig,
    profiles: ProfileStore,
    log: ConversationLog,
    assembler: ContextAssembler,
    llm: ChatCompletionClient,
    speech: SpeechClient,
    scheduler: ProactiveScheduler,
    event_tx: Sender<CompanionEvent>,
}

pub struct CompanionRuntimeBuilder {
    config: CompanionConfig,
    event_tx: Sender<CompanionEvent>,
    store: Option<Arc<dyn KeyValueStore>>,
    notifier: Option<Arc<dyn NotificationService>>,
}

impl CompanionRuntimeBuilder {
    pub fn new(config: CompanionConfig, event_tx: Sender<CompanionEvent>) -> Self {
        Self {
            config,
            event_tx,
            store: None,
            notifier: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationService>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Must be called from within a tokio runtime (spawns the history writer).
    pub fn build(self) -> Result<CompanionRuntime> {
        let config = self.config;

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                CompanionDatabase::new(&config.database_path)
                    .with_context(|| format!("Failed to open {}", config.database_path))?,
            ),
        };
        let notifier = self
            .notifier
            .context("No notification service configured")?;

        let llm = ChatCompletionClient::with_timeout(
            config.llm_api_url.clone(),
            config.llm_api_key.clone().unwrap_or_default(),
            config.llm_model.clone(),
            config.llm_timeout(),
        )
        .context("Failed to create chat completion client")?;
        let speech =
            SpeechClient::new(config.speech.clone()).context("Failed to create speech client")?;
        let assembler = ContextAssembler::new(config.context_window);
        if config.llm_api_key.as_deref().map(str::is_empty).unwrap_or(true) {
            tracing::warn!("LLM_API_KEY is unset; requests go out without a bearer token");
        }

        let scheduler = ProactiveScheduler::new(
            store.clone(),
            notifier,
            config.proactive_min_interval(),
            config.proactive_max_interval(),
            NotificationContent {
                title: config.notification_title.clone(),
                body: config.notification_body.clone(),
            },
        );

        tracing::info!(
            "Companion runtime ready (model {}, context window {})",
            llm.model(),
            assembler.window()
        );

        Ok(CompanionRuntime {
            profiles: ProfileStore::new(store.clone()),
            log: ConversationLog::spawn(ConversationStore::new(store)),
            assembler,
            llm,
            speech,
            scheduler,
            event_tx: self.event_tx,
            config,
        })
    }
}

impl CompanionRuntime {
    /// SQLite storage plus in-process notification timers. The returned
    /// receiver yields delivered notifications for `run_notification_loop`.
    pub fn bootstrap(
        config: CompanionConfig,
        event_tx: Sender<CompanionEvent>,
    ) -> Result<(Self, Receiver<NotificationEvent>)> {
        let (notification_tx, notification_rx) = flume::unbounded();
        let runtime = CompanionRuntimeBuilder::new(config, event_tx)
            .with_notifier(Arc::new(LocalNotificationService::new(notification_tx)))
            .build()?;
        Ok((runtime, notification_rx))
    }

    fn emit(&self, event: CompanionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn completion_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    pub async fn profile(&self) -> Option<AiProfile> {
        self.profiles.load().await
    }

    pub async fn history(&self) -> Result<Vec<Message>> {
        Ok(self.log.snapshot().await?.messages)
    }

    /// Save a new persona. Prior conversation context belongs to the old
    /// persona, so the history is cleared and the new companion says hello.
    pub async fn onboard(&self, draft: ProfileDraft) -> Result<AiProfile> {
        let profile = draft.into_profile()?;
        self.profiles.save(&profile).await?;
        self.log.clear().await?;
        self.emit(CompanionEvent::HistoryCleared);

        tracing::info!(
            "Onboarded companion {} ({} style)",
            profile.name,
            profile.personality.as_str()
        );
        self.seed_greeting(&profile).await?;
        Ok(profile)
    }

    /// Open an empty conversation with a welcome from the companion.
    pub async fn greet_if_empty(&self) -> Result<Option<Message>> {
        match self.profiles.load().await {
            Some(profile) => self.seed_greeting(&profile).await,
            None => Ok(None),
        }
    }

    async fn seed_greeting(&self, profile: &AiProfile) -> Result<Option<Message>> {
        let snapshot = self.log.snapshot().await?;
        if !snapshot.messages.is_empty() {
            return Ok(None);
        }

        let greeting = Message::ai_text(welcome_text(profile));
        match self.log.seed(snapshot.generation, greeting.clone()).await? {
            AppendOutcome::Appended(_) => {
                self.emit(CompanionEvent::MessageAppended(greeting.clone()));
                Ok(Some(greeting))
            }
            AppendOutcome::Stale => Ok(None),
        }
    }

    pub async fn send_message(&self, text: &str) -> Result<Message, TurnError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TurnError::EmptyMessage);
        }
        self.run_turn(Message::user_text(text), text.to_string())
            .await
    }

    pub async fn send_image(&self, image_url: &str) -> Result<Message, TurnError> {
        self.run_turn(
            Message::user_image(image_url, IMAGE_CAPTION),
            IMAGE_PROMPT.to_string(),
        )
        .await
    }

    /// Transcribe `audio` and send it as a voice message. On transcription
    /// failure the clip comes back inside the error so it can be retried.
    pub async fn send_voice(&self, clip: RecordedClip, audio: &[u8]) -> Result<Message, TurnError> {
        if self.profiles.load().await.is_none() {
            return self.fail_turn(TurnError::NoProfile);
        }

        let transcript = match self.speech.transcribe(audio).await {
            Ok(text) => text,
            Err(source) => return self.fail_turn(TurnError::Transcription { source, clip }),
        };

        let message = Message::user_voice(
            transcript.clone(),
            clip.path.to_string_lossy(),
            clip.duration_secs(),
        );
        self.run_turn(message, transcript).await
    }

    async fn run_turn(&self, user_message: Message, prompt_text: String) -> Result<Message, TurnError> {
        match self.try_turn(user_message, &prompt_text).await {
            Ok(reply) => Ok(reply),
            Err(e) => self.fail_turn(e),
        }
    }

    fn fail_turn<T>(&self, error: TurnError) -> Result<T, TurnError> {
        tracing::warn!("Chat turn failed: {}", error);
        self.emit(CompanionEvent::Alert(error.user_message().to_string()));
        Err(error)
    }

    async fn try_turn(&self, user_message: Message, prompt_text: &str) -> Result<Message, TurnError> {
        let profile = self.profiles.load().await.ok_or(TurnError::NoProfile)?;
        let snapshot = self.log.snapshot().await.map_err(TurnError::Storage)?;

        let prompt = self
            .assembler
            .build_prompt(&profile, &snapshot.messages, prompt_text);
        let reply = self.llm.complete(&prompt, self.completion_options()).await?;
        let ai_message = Message::ai_text(reply);

        let outcome = self
            .log
            .append(
                snapshot.generation,
                vec![user_message.clone(), ai_message.clone()],
            )
            .await
            .map_err(TurnError::Storage)?;
        if outcome == AppendOutcome::Stale {
            return Err(TurnError::Superseded);
        }
        self.emit(CompanionEvent::MessageAppended(user_message));
        self.emit(CompanionEvent::MessageAppended(ai_message.clone()));

        self.reschedule_proactive().await;
        Ok(ai_message)
    }

    async fn reschedule_proactive(&self) {
        match self.scheduler.maybe_schedule_next(Utc::now()).await {
            Ok(ScheduleOutcome::Scheduled { delay, .. }) => {
                self.emit(CompanionEvent::ProactiveScheduled { delay });
            }
            Ok(ScheduleOutcome::Skipped { .. }) => {}
            Err(e) => tracing::warn!("Failed to schedule proactive notification: {:#}", e),
        }
    }

    /// Generate and store an AI-initiated message. Returns `None` when there
    /// is no persona or nothing has been said yet.
    pub async fn deliver_proactive(&self) -> Result<Option<Message>, TurnError> {
        let Some(profile) = self.profiles.load().await else {
            tracing::debug!("Skipping proactive message: no profile");
            return Ok(None);
        };
        let snapshot = self.log.snapshot().await.map_err(TurnError::Storage)?;
        let history = snapshot.messages;
        if history.is_empty() {
            tracing::debug!("Skipping proactive message: empty history");
            return Ok(None);
        }

        let key_info = self.assembler.key_information(&history);
        let opener = self
            .scheduler
            .build_proactive_prompt(&key_info, &mut rand::thread_rng());
        let instruction = format!(
            "You are {}, a {} friend with a {} personality. You're starting a casual \
             conversation with your friend. Keep it natural and reference previous \
             conversations. {}",
            profile.name,
            profile.gender,
            profile.personality.as_str(),
            opener
        );

        let prompt = self.assembler.build_prompt(&profile, &history, &instruction);
        let reply = self.llm.complete(&prompt, self.completion_options()).await?;
        let message = Message::ai_text(reply);

        let outcome = self
            .log
            .append(snapshot.generation, vec![message.clone()])
            .await
            .map_err(TurnError::Storage)?;
        if outcome == AppendOutcome::Stale {
            tracing::debug!("Dropping proactive message: conversation was reset");
            return Ok(None);
        }
        self.emit(CompanionEvent::MessageAppended(message.clone()));

        self.reschedule_proactive().await;
        Ok(Some(message))
    }

    /// React to delivered notifications until the channel closes.
    pub async fn run_notification_loop(&self, events: Receiver<NotificationEvent>) {
        while let Ok(event) = events.recv_async().await {
            match event {
                NotificationEvent::Delivered { handle, .. } => {
                    tracing::info!("Proactive notification {:?} delivered", handle);
                    match self.deliver_proactive().await {
                        Ok(Some(message)) => {
                            tracing::debug!("Proactive message stored: {}", message.id)
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Proactive message failed: {}", e),
                    }
                }
            }
        }
        tracing::info!("Notification channel closed; proactive loop stopped");
    }
}

fn welcome_text(profile: &AiProfile) -> String {
    format!(
        "Hi! I'm {}, and I'm so happy to be your friend! How's your day going?",
        profile.name
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationHandle;
    use crate::profile::Gender;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        scheduled: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl NotificationService for RecordingNotifier {
        async fn schedule(
            &self,
            _content: NotificationContent,
            delay: Duration,
        ) -> Result<NotificationHandle> {
            let mut scheduled = self.scheduled.lock().unwrap();
            scheduled.push(delay);
            Ok(NotificationHandle(scheduled.len() as u64))
        }

        async fn cancel(&self, _handle: NotificationHandle) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Clone)]
    struct FakeModel {
        requests: Arc<Mutex<Vec<Value>>>,
        status: StatusCode,
        reply: String,
        latency: Duration,
    }

    async fn completions(State(model): State<FakeModel>, Json(body): Json<Value>) -> Response {
        model.requests.lock().unwrap().push(body);
        tokio::time::sleep(model.latency).await;
        if !model.status.is_success() {
            return (model.status, "upstream exploded").into_response();
        }
        Json(json!({"choices": [{"message": {"role": "assistant", "content": model.reply}}]}))
            .into_response()
    }

    async fn serve_model(model: FakeModel) -> String {
        let router = Router::new()
            .route("/chat/completions", post(completions))
            .with_state(model);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{}", addr)
    }

    struct Harness {
        runtime: CompanionRuntime,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        events: Receiver<CompanionEvent>,
        requests: Arc<Mutex<Vec<Value>>>,
    }

    async fn harness_with_latency(status: StatusCode, reply: &str, latency: Duration) -> Harness {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let url = serve_model(FakeModel {
            requests: requests.clone(),
            status,
            reply: reply.to_string(),
            latency,
        })
        .await;
        let config = CompanionConfig {
            llm_api_url: url,
            llm_api_key: Some("sk-test".to_string()),
            llm_timeout_secs: 5,
            ..CompanionConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let (event_tx, events) = flume::unbounded();
        let runtime = CompanionRuntimeBuilder::new(config, event_tx)
            .with_store(store.clone())
            .with_notifier(notifier.clone())
            .build()
            .expect("build runtime");
        Harness {
            runtime,
            store,
            notifier,
            events,
            requests,
        }
    }

    async fn harness(status: StatusCode, reply: &str) -> Harness {
        harness_with_latency(status, reply, Duration::ZERO).await
    }

    fn mia() -> ProfileDraft {
        ProfileDraft {
            name: "Mia".to_string(),
            gender: Some(Gender::Female),
            personality: Some("witty".to_string()),
            horoscope: None,
        }
    }

    fn leo() -> ProfileDraft {
        ProfileDraft {
            name: "Leo".to_string(),
            gender: Some(Gender::Male),
            personality: Some("calm".to_string()),
            horoscope: None,
        }
    }

    #[tokio::test]
    async fn onboarding_opens_with_a_greeting() {
        let h = harness(StatusCode::OK, "hey").await;
        h.runtime.onboard(mia()).await.unwrap();

        let history = h.runtime.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_from_user());
        assert!(history[0].text.contains("I'm Mia"));

        assert!(h.runtime.greet_if_empty().await.unwrap().is_none());
        assert_eq!(h.runtime.history().await.unwrap().len(), 1);
        assert!(h.requests.lock().unwrap().is_empty());

        let events: Vec<CompanionEvent> = h.events.drain().collect();
        assert_eq!(events[0], CompanionEvent::HistoryCleared);
        assert_eq!(events[1], CompanionEvent::MessageAppended(history[0].clone()));
    }

    #[tokio::test]
    async fn greeting_needs_a_profile() {
        let h = harness(StatusCode::OK, "hey").await;
        assert!(h.runtime.greet_if_empty().await.unwrap().is_none());
        assert!(h.runtime.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_turn_persists_both_sides_and_schedules_once() {
        let h = harness(StatusCode::OK, "Haha, tell me\nmore!").await;
        h.runtime.onboard(mia()).await.unwrap();

        let reply = h.runtime.send_message("  I love hiking  ").await.unwrap();
        assert_eq!(reply.text, "Haha, tell me more!");

        let history = h.runtime.history().await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].text, "I love hiking");
        assert!(history[1].is_from_user());
        assert_eq!(history[2], reply);

        h.runtime.send_message("also cooking").await.unwrap();
        assert_eq!(h.notifier.scheduled.lock().unwrap().len(), 1);

        let requests = h.requests.lock().unwrap();
        let second = &requests[1]["messages"];
        let system = second[0]["content"].as_str().unwrap();
        assert!(system.contains("I love hiking"));
        assert_eq!(second.as_array().unwrap().len(), 1 + 3 + 1);

        let events: Vec<CompanionEvent> = h.events.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, CompanionEvent::ProactiveScheduled { .. })));
    }

    #[tokio::test]
    async fn re_onboarding_replaces_history_with_new_greeting() {
        let h = harness(StatusCode::OK, "hey").await;
        h.runtime.onboard(mia()).await.unwrap();
        h.runtime.send_message("hello").await.unwrap();
        assert_eq!(h.runtime.history().await.unwrap().len(), 3);

        h.runtime.onboard(leo()).await.unwrap();

        let history = h.runtime.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].text.contains("I'm Leo"));
        assert_eq!(ConversationStore::new(h.store.clone()).load().await, history);
        assert_eq!(h.runtime.profile().await.unwrap().name, "Leo");
    }

    #[tokio::test]
    async fn reply_from_before_re_onboarding_is_discarded() {
        let h = harness_with_latency(
            StatusCode::OK,
            "old persona reply",
            Duration::from_millis(500),
        )
        .await;
        h.runtime.onboard(mia()).await.unwrap();

        let (turn, _) = tokio::join!(h.runtime.send_message("hello Mia"), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.runtime.onboard(leo()).await.unwrap();
        });

        assert!(matches!(turn, Err(TurnError::Superseded)));
        let history = h.runtime.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].text.contains("I'm Leo"));
        assert!(h.notifier.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_failure_alerts_and_leaves_history_untouched() {
        let h = harness(StatusCode::INTERNAL_SERVER_ERROR, "unused").await;
        h.runtime.onboard(mia()).await.unwrap();

        let err = h.runtime.send_message("hello?").await.unwrap_err();
        assert!(matches!(
            err,
            TurnError::Api(crate::error::ApiError::RequestFailed { status: 500, .. })
        ));
        assert_eq!(h.runtime.history().await.unwrap().len(), 1);
        assert!(h.notifier.scheduled.lock().unwrap().is_empty());

        let alerts: Vec<CompanionEvent> = h
            .events
            .drain()
            .filter(|e| matches!(e, CompanionEvent::Alert(_)))
            .collect();
        assert_eq!(
            alerts,
            vec![CompanionEvent::Alert(err.user_message().to_string())]
        );
    }

    #[tokio::test]
    async fn turn_without_profile_is_rejected() {
        let h = harness(StatusCode::OK, "hey").await;
        assert!(matches!(
            h.runtime.send_message("hi").await,
            Err(TurnError::NoProfile)
        ));
        assert!(matches!(
            h.runtime.send_message("   ").await,
            Err(TurnError::EmptyMessage)
        ));
        assert!(h.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_turn_stores_image_message() {
        let h = harness(StatusCode::OK, "What a view!").await;
        h.runtime.onboard(mia()).await.unwrap();

        h.runtime.send_image("file:///photos/lake.jpg").await.unwrap();

        let history = h.runtime.history().await.unwrap();
        assert_eq!(history[1].image_url.as_deref(), Some("file:///photos/lake.jpg"));
        assert_eq!(history[1].text, IMAGE_CAPTION);
        let requests = h.requests.lock().unwrap();
        let messages = requests[0]["messages"].as_array().unwrap();
        assert_eq!(messages.last().unwrap()["content"], IMAGE_PROMPT);
    }

    #[tokio::test]
    async fn proactive_delivery_requires_profile_and_history() {
        let h = harness(StatusCode::OK, "Thinking of you!").await;
        assert!(h.runtime.deliver_proactive().await.unwrap().is_none());

        // Profile present but nothing said yet.
        let profile = mia().into_profile().unwrap();
        ProfileStore::new(h.store.clone()).save(&profile).await.unwrap();
        assert!(h.runtime.deliver_proactive().await.unwrap().is_none());
        assert!(h.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn proactive_delivery_works_right_after_onboarding() {
        let h = harness(StatusCode::OK, "Thinking of you!").await;
        h.runtime.onboard(mia()).await.unwrap();

        let message = h.runtime.deliver_proactive().await.unwrap().expect("delivered");
        assert_eq!(message.text, "Thinking of you!");
        assert_eq!(h.runtime.history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn notification_loop_appends_proactive_message() {
        let h = harness(StatusCode::OK, "Thinking of you!").await;
        h.runtime.onboard(mia()).await.unwrap();
        h.runtime.send_message("I enjoy baking").await.unwrap();

        let (tx, rx) = flume::unbounded();
        tx.send(NotificationEvent::Delivered {
            handle: NotificationHandle(1),
            content: NotificationContent {
                title: "t".to_string(),
                body: "b".to_string(),
            },
        })
        .unwrap();
        drop(tx);
        h.runtime.run_notification_loop(rx).await;

        let history = h.runtime.history().await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].text, "Thinking of you!");
        assert!(!history[3].is_from_user());

        let requests = h.requests.lock().unwrap();
        let proactive = requests.last().unwrap()["messages"].as_array().unwrap().clone();
        let instruction = proactive.last().unwrap()["content"].as_str().unwrap().to_string();
        assert!(instruction.contains("You are Mia"));
        assert!(instruction.contains("starting a casual conversation"));
    }
}

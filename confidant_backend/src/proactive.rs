use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex_lite::Regex;

use crate::conversation::timestamp_format;
use crate::notifications::{NotificationContent, NotificationHandle, NotificationService};
use crate::store::{KeyValueStore, LAST_PROACTIVE_SCHEDULED_KEY};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

const TOPIC_PLACEHOLDER: &str = "{topic}";

const OPENER_TEMPLATES: [&str; 5] = [
    "Based on our previous conversations, I was thinking about you and wanted to check in. How are you doing?",
    "Hey! Something reminded me of our chat about {topic}. What's new with you?",
    "I remembered you mentioned {topic} before. How's that going?",
    "Just wanted to say hi and see how you're doing! Any updates on {topic}?",
    "Been thinking about what you said about {topic}. How are things?",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled {
        delay: Duration,
        handle: NotificationHandle,
    },
    /// The cooldown since the last scheduled notification has not elapsed.
    Skipped { remaining: Duration },
}

/// Arranges the next "come back and chat" notification.
///
/// Only the trigger is scheduled here; the proactive message itself is
/// generated when the notification is delivered.
pub struct ProactiveScheduler {
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn NotificationService>,
    min_interval: Duration,
    max_interval: Duration,
    content: NotificationContent,
    topic_pattern: Regex,
}

impl ProactiveScheduler {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn NotificationService>,
        min_interval: Duration,
        max_interval: Duration,
        content: NotificationContent,
    ) -> Self {
        let (min_interval, max_interval) = if min_interval <= max_interval {
            (min_interval, max_interval)
        } else {
            tracing::warn!(
                "Proactive min interval {:?} exceeds max {:?}; swapping",
                min_interval,
                max_interval
            );
            (max_interval, min_interval)
        };

        Self {
            store,
            notifier,
            min_interval,
            max_interval,
            content,
            topic_pattern: Regex::new(r"(?i)\b(?:like|love|enjoy|into|about)\s+(\w+)")
                .expect("topic pattern is valid"),
        }
    }

    pub async fn last_scheduled_at(&self) -> Option<DateTime<Utc>> {
        let raw = match self.store.get(LAST_PROACTIVE_SCHEDULED_KEY).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Failed to read proactive schedule state: {}", e);
                return None;
            }
        };
        match timestamp_format::decode(&raw) {
            Ok(time) => Some(time),
            Err(e) => {
                tracing::warn!("Ignoring unreadable proactive timestamp {:?}: {}", raw, e);
                None
            }
        }
    }

    /// Schedule the next proactive notification unless the cooldown is active.
    ///
    /// The stored timestamp is `now` (when scheduling happened), not the fire
    /// time, so the cooldown counts from the last scheduling decision.
    pub async fn maybe_schedule_next(&self, now: DateTime<Utc>) -> Result<ScheduleOutcome> {
        if let Some(last) = self.last_scheduled_at().await {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                tracing::debug!(
                    "Proactive notification skipped; cooldown has {}s left",
                    remaining.as_secs()
                );
                return Ok(ScheduleOutcome::Skipped { remaining });
            }
        }

        let delay = self.draw_delay(&mut rand::thread_rng());
        let handle = self
            .notifier
            .schedule(self.content.clone(), delay)
            .await
            .context("Failed to schedule proactive notification")?;

        if let Err(e) = self
            .store
            .set(LAST_PROACTIVE_SCHEDULED_KEY, &timestamp_format::encode(&now))
            .await
        {
            // A pending trigger always has its scheduling time recorded.
            if let Err(cancel_err) = self.notifier.cancel(handle).await {
                tracing::warn!(
                    "Failed to cancel notification {:?} after state write error: {}",
                    handle,
                    cancel_err
                );
            }
            return Err(e.context("Failed to persist proactive schedule time"));
        }

        tracing::info!(
            "Proactive notification scheduled in {:.1}h",
            delay.as_secs_f64() / 3600.0
        );
        Ok(ScheduleOutcome::Scheduled { delay, handle })
    }

    /// Uniform delay in `[min_interval, max_interval]`, whole seconds.
    pub fn draw_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_secs(rng.gen_range(self.min_interval.as_secs()..=self.max_interval.as_secs()))
    }

    /// Opening line for a proactive message, personalised with a topic the
    /// user mentioned when one can be found.
    pub fn build_proactive_prompt<R: Rng + ?Sized>(&self, key_info: &str, rng: &mut R) -> String {
        let topics: Vec<&str> = self
            .topic_pattern
            .captures_iter(key_info)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();

        if topics.is_empty() {
            return OPENER_TEMPLATES[0].to_string();
        }

        let template = OPENER_TEMPLATES[rng.gen_range(0..OPENER_TEMPLATES.len())];
        let topic = topics[rng.gen_range(0..topics.len())];
        template.replace(TOPIC_PLACEHOLDER, topic)
    }
}

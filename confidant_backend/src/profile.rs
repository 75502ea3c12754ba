use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::timestamp_format;
use crate::store::{KeyValueStore, PROFILE_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Some(Gender::Male),
            "female" | "f" => Some(Gender::Female),
            _ => None,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => write!(f, "male"),
            Gender::Female => write!(f, "female"),
        }
    }
}

/// Reply style of the persona. Free-text labels are mapped onto this closed
/// set when the profile is created; anything unrecognized becomes `Friendly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersonaStyle {
    Cheerful,
    Calm,
    Witty,
    Intellectual,
    #[default]
    #[serde(other)]
    Friendly,
}

impl PersonaStyle {
    pub fn from_label(label: Option<&str>) -> Self {
        let Some(label) = label else {
            return PersonaStyle::Friendly;
        };
        match label.trim().to_ascii_lowercase().as_str() {
            "cheerful" => PersonaStyle::Cheerful,
            "calm" => PersonaStyle::Calm,
            "witty" => PersonaStyle::Witty,
            "intellectual" => PersonaStyle::Intellectual,
            _ => PersonaStyle::Friendly,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PersonaStyle::Friendly => "friendly",
            PersonaStyle::Cheerful => "cheerful",
            PersonaStyle::Calm => "calm",
            PersonaStyle::Witty => "witty",
            PersonaStyle::Intellectual => "intellectual",
        }
    }

    /// Style instructions placed in the system prompt.
    pub fn style_template(self) -> &'static str {
        match self {
            PersonaStyle::Friendly => {
                "You are warm and easygoing. You listen well, share small bits of your own day, \
                 and keep the conversation light."
            }
            PersonaStyle::Cheerful => {
                "You are upbeat and optimistic. You notice the bright side, celebrate small wins \
                 and bring playful energy to the chat."
            }
            PersonaStyle::Calm => {
                "You are calm and supportive. You speak gently, validate feelings and never rush \
                 your friend."
            }
            PersonaStyle::Witty => {
                "You are witty and humorous. You tease lightly, enjoy wordplay and keep things \
                 fun without being mean."
            }
            PersonaStyle::Intellectual => {
                "You are curious and thoughtful. You enjoy ideas, ask interesting follow-up \
                 questions and share fun facts casually."
            }
        }
    }
}

/// The configured companion persona. Replaced wholesale on re-onboarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiProfile {
    pub name: String,
    pub gender: Gender,
    #[serde(default)]
    pub personality: PersonaStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horoscope: Option<String>,
    #[serde(with = "timestamp_format")]
    pub created_at: DateTime<Utc>,
}

/// Unvalidated onboarding input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub name: String,
    pub gender: Option<Gender>,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub horoscope: Option<String>,
}

impl ProfileDraft {
    pub fn into_profile(self) -> Result<AiProfile> {
        let name = self.name.trim();
        if name.is_empty() {
            anyhow::bail!("Please enter a name for your companion");
        }
        let Some(gender) = self.gender else {
            anyhow::bail!("Please select a gender for your companion");
        };
        let horoscope = self
            .horoscope
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());

        Ok(AiProfile {
            name: name.to_string(),
            gender,
            personality: PersonaStyle::from_label(self.personality.as_deref()),
            horoscope,
            created_at: Utc::now(),
        })
    }
}

#[derive(Clone)]
pub struct ProfileStore {
    store: Arc<dyn KeyValueStore>,
}

impl ProfileStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Stored profile, or `None` when absent or unreadable.
    pub async fn load(&self) -> Option<AiProfile> {
        let raw = match self.store.get(PROFILE_KEY).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Failed to read companion profile: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!("Ignoring malformed companion profile: {}", e);
                None
            }
        }
    }

    /// Persist `profile`. Callers must also clear the conversation history;
    /// `CompanionRuntime::onboard` does both.
    pub async fn save(&self, profile: &AiProfile) -> Result<()> {
        let json = serde_json::to_string(profile).context("Failed to serialize profile")?;
        self.store
            .set(PROFILE_KEY, &json)
            .await
            .context("Failed to write companion profile")
    }
}

use std::collections::HashSet;

use regex_lite::Regex;

use crate::conversation::{Message, Sender};
use crate::llm_client::ChatMessage;
use crate::profile::AiProfile;

pub const DEFAULT_CONTEXT_WINDOW: usize = 10;

const KEY_INFO_PATTERN: &str =
    r"(?i)\b(my name is|call me|i am|i'm|i’m|like|love|hate|enjoy|because)\b";

const REPLY_RULES: &str = "Rules:\n\
    - Reply with exactly one short, casual sentence, the way a friend texts.\n\
    - No lists, no markdown, no line breaks.\n\
    - Never say or hint that you are an AI, a model or a program.";

/// Builds the bounded prompt sent to the chat-completion API.
///
/// Only the last `window` messages are sent verbatim. Facts the user
/// disclosed earlier (names, likes, reasons) are pulled from the whole
/// history into the system message so they survive leaving the window.
pub struct ContextAssembler {
    window: usize,
    key_info: Regex,
}

impl ContextAssembler {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            key_info: Regex::new(KEY_INFO_PATTERN).expect("key info pattern is valid"),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn build_prompt(
        &self,
        profile: &AiProfile,
        full_history: &[Message],
        latest_user_text: &str,
    ) -> Vec<ChatMessage> {
        let key_info = self.key_information(full_history);
        let start = full_history.len().saturating_sub(self.window);

        let mut prompt = Vec::with_capacity(full_history.len() - start + 2);
        prompt.push(ChatMessage::system(system_prompt(profile, &key_info)));
        prompt.extend(full_history[start..].iter().map(|message| match message.sender {
            Sender::User => ChatMessage::user(message.text.clone()),
            Sender::Ai => ChatMessage::assistant(message.text.clone()),
        }));
        prompt.push(ChatMessage::user(latest_user_text));
        prompt
    }

    /// Deduplicated user statements carrying identity, preference or causal
    /// markers, oldest first, one per line. Empty when nothing matches.
    pub fn key_information(&self, full_history: &[Message]) -> String {
        let mut seen = HashSet::new();
        let mut lines = Vec::new();

        for message in full_history.iter().filter(|m| m.is_from_user()) {
            let text = message.text.trim();
            if text.is_empty() || !self.key_info.is_match(text) {
                continue;
            }
            if seen.insert(text.to_lowercase()) {
                lines.push(text);
            }
        }

        lines.join("\n")
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}

fn system_prompt(profile: &AiProfile, key_info: &str) -> String {
    let mut prompt = format!(
        "You are {}, a {} friend chatting with the user",
        profile.name, profile.gender
    );
    if let Some(horoscope) = &profile.horoscope {
        prompt.push_str(&format!(" (your star sign is {})", horoscope));
    }
    prompt.push_str(".\n");
    prompt.push_str(profile.personality.style_template());
    prompt.push_str("\n\n");

    if !key_info.is_empty() {
        prompt.push_str("Things your friend has told you before:\n");
        prompt.push_str(key_info);
        prompt.push_str("\n\n");
    }

    prompt.push_str(REPLY_RULES);
    prompt
}

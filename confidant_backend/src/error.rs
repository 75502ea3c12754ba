//! Typed failures surfaced by the remote clients and the chat turn flow.

use thiserror::Error;

use crate::audio::RecordedClip;

/// Failure of a chat-completion request.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Chat completion request timed out")]
    Timeout,

    #[error("Chat completion request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Malformed chat completion response: {0}")]
    MalformedResponse(String),

    #[error("Chat completion transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Transport(error.to_string())
        }
    }
}

/// Failure of the speech-to-text service.
#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("Speech request timed out")]
    Timeout,

    #[error("Speech token request failed: {0}")]
    TokenUnavailable(String),

    #[error("Transcription failed ({code}): {message}")]
    TranscriptionFailed { code: i64, message: String },

    #[error("Speech transport error: {0}")]
    Transport(String),
}

impl SpeechError {
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SpeechError::Timeout
        } else {
            SpeechError::Transport(error.to_string())
        }
    }
}

/// Failure of a single user- or schedule-initiated conversation turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("No companion profile configured yet")]
    NoProfile,

    #[error("Message text is empty")]
    EmptyMessage,

    #[error(transparent)]
    Api(#[from] ApiError),

    /// The clip is handed back so the user can retry the transcription.
    #[error("{source}")]
    Transcription {
        source: SpeechError,
        clip: RecordedClip,
    },

    #[error("Conversation storage failed: {0}")]
    Storage(#[source] anyhow::Error),

    /// The companion was re-onboarded while the reply was being generated.
    #[error("Conversation was reset before the reply arrived")]
    Superseded,
}

impl TurnError {
    /// Alert text shown to the user. Never includes transport details.
    pub fn user_message(&self) -> &'static str {
        match self {
            TurnError::NoProfile => "Set up your companion before chatting.",
            TurnError::EmptyMessage => "Type something first.",
            TurnError::Api(ApiError::Timeout) => {
                "Your friend is taking too long to answer. Please try again."
            }
            TurnError::Api(_) => "Couldn't get a reply right now. Please try again.",
            TurnError::Transcription { .. } => {
                "Couldn't turn your voice message into text. Please try again."
            }
            TurnError::Storage(_) => "Couldn't save the conversation. Please try again.",
            TurnError::Superseded => "Your companion changed, so that message was not kept.",
        }
    }
}

use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::SpeechConfig;
use crate::error::SpeechError;
use crate::http_client::build_http_client;

/// Tokens are valid for 30 days; refresh a day early.
pub const TOKEN_TTL: Duration = Duration::from_secs(29 * 24 * 60 * 60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecognitionRequest<'a> {
    format: &'a str,
    rate: u32,
    channel: u8,
    cuid: &'a str,
    dev_pid: u32,
    token: &'a str,
    speech: String,
    len: usize,
}

#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    err_no: i64,
    #[serde(default)]
    err_msg: Option<String>,
    #[serde(default)]
    result: Vec<String>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Speech-to-text client: OAuth client-credentials token, then one
/// recognition request per clip. The token cache lives in the client, so its
/// lifetime is the lifetime of whoever owns the client.
pub struct SpeechClient {
    config: SpeechConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl SpeechClient {
    pub fn new(config: SpeechConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        Ok(Self {
            client: build_http_client(timeout)?,
            config,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, SpeechError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!("Fetching speech access token");
        let response = self
            .client
            .post(&self.config.token_url)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.api_key.as_str()),
                ("client_secret", self.config.secret_key.as_str()),
            ])
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(SpeechError::from_reqwest)?;

        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::TokenUnavailable(format!("unreadable token response: {}", e)))?;

        let Some(value) = body.access_token.filter(|t| !t.is_empty()) else {
            return Err(SpeechError::TokenUnavailable(
                body.error_description
                    .unwrap_or_else(|| format!("no access_token in response ({})", status)),
            ));
        };

        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + TOKEN_TTL,
        });
        Ok(value)
    }

    /// Transcribe a recorded clip. `err_no != 0` or an empty result list is
    /// reported as `TranscriptionFailed`.
    pub async fn transcribe(&self, audio: &[u8]) -> Result<String, SpeechError> {
        let token = self.access_token().await?;
        let speech = base64::engine::general_purpose::STANDARD.encode(audio);

        let request = RecognitionRequest {
            format: &self.config.format,
            rate: self.config.rate,
            channel: 1,
            cuid: &self.config.cuid,
            dev_pid: self.config.dev_pid,
            token: &token,
            speech,
            len: audio.len(),
        };

        tracing::debug!(
            "Sending {} bytes of {} audio for recognition",
            audio.len(),
            self.config.format
        );

        let response = self
            .client
            .post(&self.config.asr_url)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(SpeechError::from_reqwest)?;

        let body: RecognitionResponse = response.json().await.map_err(|e| {
            SpeechError::TranscriptionFailed {
                code: -1,
                message: format!("unreadable recognition response: {}", e),
            }
        })?;

        if body.err_no != 0 {
            return Err(SpeechError::TranscriptionFailed {
                code: body.err_no,
                message: body
                    .err_msg
                    .unwrap_or_else(|| "speech recognition failed".to_string()),
            });
        }

        body.result
            .into_iter()
            .map(|text| text.trim().to_string())
            .find(|text| !text.is_empty())
            .ok_or_else(|| SpeechError::TranscriptionFailed {
                code: 0,
                message: "no speech recognized".to_string(),
            })
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::http_client::build_http_client;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 500,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
///
/// One request per call, no retries. The reply is flattened to a single line.
#[derive(Clone)]
pub struct ChatCompletionClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ChatCompletionClient {
    pub fn with_timeout(
        api_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client: build_http_client(timeout)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: CompletionOptions,
    ) -> Result<String, ApiError> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: false,
        };

        tracing::debug!(
            "Sending chat completion to {} ({} messages, model {})",
            url,
            messages.len(),
            self.model
        );

        let mut req = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(&request);

        // Local models usually run without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.map_err(ApiError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(ApiError::from_reqwest)?;

        if !status.is_success() {
            tracing::warn!("Chat completion returned {}: {}", status, body);
            return Err(ApiError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }

        extract_reply(&body)
    }
}

fn extract_reply(body: &str) -> Result<String, ApiError> {
    let completion: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::MalformedResponse(format!("invalid JSON body: {}", e)))?;

    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ApiError::MalformedResponse("missing choices[0].message.content".to_string()))?;

    let reply = normalize_reply(&content);
    if reply.is_empty() {
        return Err(ApiError::MalformedResponse("empty completion".to_string()));
    }
    Ok(reply)
}

/// Collapse newlines and runs of whitespace into single spaces.
pub fn normalize_reply(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{}", addr)
    }

    fn client(url: String) -> ChatCompletionClient {
        ChatCompletionClient::with_timeout(
            url,
            "sk-test".to_string(),
            "deepseek-chat".to_string(),
            Duration::from_millis(300),
        )
        .expect("build client")
    }

    #[test]
    fn normalizes_multiline_reply() {
        assert_eq!(
            normalize_reply("  Hey!\n\nHow   was\tyour day?\n"),
            "Hey! How was your day?"
        );
    }

    #[test]
    fn extract_reply_classifies_bad_bodies() {
        assert!(matches!(
            extract_reply("<html>oops</html>"),
            Err(ApiError::MalformedResponse(_))
        ));
        assert!(matches!(
            extract_reply(r#"{"choices":[]}"#),
            Err(ApiError::MalformedResponse(_))
        ));
        assert!(matches!(
            extract_reply(r#"{"choices":[{"message":{"role":"assistant"}}]}"#),
            Err(ApiError::MalformedResponse(_))
        ));
        assert!(matches!(
            extract_reply(r#"{"choices":[{"message":{"content":"  \n "}}]}"#),
            Err(ApiError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn sends_request_shape_and_normalizes_reply() {
        let router = Router::new().route(
            "/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(
                    headers.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer sk-test")
                );
                assert_eq!(body["model"], "deepseek-chat");
                assert_eq!(body["stream"], false);
                assert_eq!(body["max_tokens"], 120);
                assert_eq!(body["messages"][0]["role"], "system");
                assert_eq!(body["messages"][1]["content"], "hi");
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "Hey you!\n  Missed   you."}}]
                }))
            }),
        );
        let url = serve(router).await;

        let reply = client(url)
            .complete(
                &[ChatMessage::system("be nice"), ChatMessage::user("hi")],
                CompletionOptions {
                    temperature: 0.5,
                    max_tokens: 120,
                },
            )
            .await
            .expect("completion");

        assert_eq!(reply, "Hey you! Missed you.");
    }

    #[tokio::test]
    async fn non_success_status_is_request_failed() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid api key") }),
        );
        let url = serve(router).await;

        let err = client(url)
            .complete(&[ChatMessage::user("hi")], CompletionOptions::default())
            .await
            .unwrap_err();

        match err {
            ApiError::RequestFailed { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid api key");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Json(json!({"choices": [{"message": {"content": "late"}}]}))
            }),
        );
        let url = serve(router).await;

        let err = client(url)
            .complete(&[ChatMessage::user("hi")], CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout));
    }

    #[tokio::test]
    async fn success_with_wrong_shape_is_malformed() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { Json(json!({"result": "hello"})) }),
        );
        let url = serve(router).await;

        let err = client(url)
            .complete(&[ChatMessage::user("hi")], CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }
}

//! The reasoning model behind a single capability: prompt in, raw text out.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::config::ModelConfig;
use crate::error::ModelError;

/// Everything sent to the model for one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Base64-encoded PNG screenshot, sent only in vision mode.
    pub image_base64: Option<String>,
}

#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn propose(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiModel {
    /// Build a client from config, reading the key from `config.api_key_env`.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| ModelError::MissingApiKey(config.api_key_env.clone()))?;
        Ok(Self::new(api_key, config))
    }

    pub fn new(api_key: impl Into<String>, config: &ModelConfig) -> Self {
        info!(model = %config.model, "reasoning model client ready");
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn user_content(request: &ModelRequest) -> Value {
        match &request.image_base64 {
            Some(image) => json!([
                {"type": "text", "text": request.user_prompt},
                {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{image}")}}
            ]),
            None => json!(request.user_prompt),
        }
    }
}

#[async_trait]
impl ReasoningModel for OpenAiModel {
    async fn propose(&self, request: &ModelRequest) -> Result<String, ModelError> {
        debug!(
            prompt_chars = request.user_prompt.len(),
            with_image = request.image_base64.is_some(),
            "requesting completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": request.system_prompt},
                    {"role": "user", "content": Self::user_content(request)},
                ],
                "temperature": self.temperature,
                "max_tokens": self.max_tokens,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(body);
            error!(status = status.as_u16(), %message, "reasoning model API error");
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let json_resp: Value = serde_json::from_str(&body).map_err(|_| ModelError::EmptyResponse)?;
        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(ModelError::EmptyResponse)?;

        debug!(response_chars = content.len(), "completion received");
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    fn model_for(server: &MockServer) -> OpenAiModel {
        let config = ModelConfig {
            base_url: server.uri(),
            ..ModelConfig::default()
        };
        OpenAiModel::new("test-key", &config)
    }

    fn request(image: Option<&str>) -> ModelRequest {
        ModelRequest {
            system_prompt: "system".into(),
            user_prompt: "user".into(),
            image_base64: image.map(String::from),
        }
    }

    #[tokio::test]
    async fn returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/chat/completions"))
            .and(matchers::header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "  <thinking>ok</thinking>  "}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = model_for(&server).propose(&request(None)).await.unwrap();
        assert_eq!(text, "<thinking>ok</thinking>");
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string(
                r#"{"error": {"message": "Invalid API key", "type": "invalid_request_error"}}"#,
            ))
            .mount(&server)
            .await;

        match model_for(&server).propose(&request(None)).await {
            Err(ModelError::Api { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API key");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_content_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let result = model_for(&server).propose(&request(None)).await;
        assert!(matches!(result, Err(ModelError::EmptyResponse)));
    }

    #[test]
    fn image_is_sent_as_data_url() {
        let content = OpenAiModel::user_content(&request(Some("AAAA")));
        assert_eq!(content[0]["text"], "user");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(OpenAiModel::user_content(&request(None)), json!("user"));
    }

    #[test]
    fn missing_key_is_reported() {
        let config = ModelConfig {
            api_key_env: "WEBPILOT_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..ModelConfig::default()
        };
        assert!(matches!(
            OpenAiModel::from_config(&config),
            Err(ModelError::MissingApiKey(name)) if name == "WEBPILOT_TEST_KEY_THAT_IS_NEVER_SET"
        ));
    }
}

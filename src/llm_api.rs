use crate::config::SummaryConfig;
use crate::error::EngineError;
use crate::summary::SummarizationEngine;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenAI互換 `/chat/completions` を使う要約エンジン（既定は OpenRouter）
pub struct ChatCompletionsSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ChatCompletionsSummarizer {
    /// 設定から作成。APIキーが解決できなければ `MissingCredential`
    pub fn from_config(config: &SummaryConfig) -> Result<Self, EngineError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| EngineError::MissingCredential(config.api_key_env.clone()))?;

        // 外側のタイムアウトとは別に、HTTP層でも少し長めに打ち切る
        let client = reqwest::Client::builder()
            .timeout(config.timeout() + Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
        })
    }

    fn build_request(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_message.to_string(),
                },
            ],
            max_tokens,
            temperature,
        }
    }
}

/// 成功レスポンスから最初の選択肢の本文を取り出す。空なら失敗扱い
fn parse_completion(body: &str) -> Result<String, EngineError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| EngineError::InvalidResponse(format!("JSONパース失敗: {}", e)))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|text| text.trim().to_string())
        .unwrap_or_default();

    if content.is_empty() {
        return Err(EngineError::InvalidResponse("空の補完".to_string()));
    }
    Ok(content)
}

/// エラーレスポンスの本文から人が読めるメッセージを取り出す
fn parse_error(status: reqwest::StatusCode, body: &str) -> EngineError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());
    EngineError::Api(format!("{} - {}", status, message))
}

#[async_trait]
impl SummarizationEngine for ChatCompletionsSummarizer {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, EngineError> {
        let request = self.build_request(system_prompt, user_message, max_tokens, temperature);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(parse_error(status, &body));
        }

        parse_completion(&body)
    }

    fn name(&self) -> &'static str {
        "chat-completions"
    }
}

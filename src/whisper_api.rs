use crate::config::WhisperConfig;
use crate::error::EngineError;
use crate::transcribe_backend::{RecognitionEngine, RecognitionOutcome, StrategyEngine};
use crate::types::{CanonicalWaveform, Chunk, LanguageHint, Strategy};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;

/// OpenAI Whisper API レスポンス
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// OpenAI互換 `/audio/transcriptions` を使う認識エンジン
///
/// チャンク単位（[`RecognitionEngine`]）でも、ファイル全体を1回で処理する
/// ストラテジー（[`StrategyEngine`]、付加情報なし）としても使える。
/// HTTPクライアントは最初の呼び出しで1度だけ作る。
pub struct WhisperApiEngine {
    client: OnceCell<reqwest::Client>,
    endpoint: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
}

impl WhisperApiEngine {
    /// 設定から作成。APIキーが解決できなければ `MissingCredential`
    pub fn from_config(config: &WhisperConfig) -> Result<Self, EngineError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| EngineError::MissingCredential(config.api_key_env.clone()))?;

        Ok(Self {
            client: OnceCell::new(),
            endpoint: format!(
                "{}/audio/transcriptions",
                config.base_url.trim_end_matches('/')
            ),
            api_key,
            model: config.model.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    async fn client(&self) -> Result<&reqwest::Client, EngineError> {
        self.client
            .get_or_try_init(|| async {
                log::debug!("Whisper API: HTTPクライアント作成");
                reqwest::Client::builder()
                    .timeout(self.request_timeout)
                    .build()
                    .map_err(EngineError::from)
            })
            .await
    }

    /// multipart のテキストフィールド（言語は固定指定の時だけ送る）
    fn text_fields(&self, language: &LanguageHint) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("model", self.model.clone()),
            ("response_format", "json".to_string()),
        ];
        if let Some(code) = language.code() {
            fields.push(("language", code.to_string()));
        }
        fields
    }

    /// WAVファイルを文字起こし
    async fn transcribe_file(
        &self,
        path: &Path,
        language: &LanguageHint,
    ) -> Result<String, EngineError> {
        let wav_data = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::Audio(format!("{}: {}", path.display(), e)))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());

        log::debug!(
            "Whisper API: {} を送信 ({} バイト, 言語: {})",
            file_name,
            wav_data.len(),
            language
        );

        let part = multipart::Part::bytes(wav_data)
            .file_name(file_name)
            .mime_str("audio/wav")?;

        let form = self
            .text_fields(language)
            .into_iter()
            .fold(multipart::Form::new().part("file", part), |form, (k, v)| {
                form.text(k, v)
            });

        let response = self
            .client()
            .await?
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(EngineError::Api(format!("Whisper API エラー: {} - {}", status, message)));
        }

        parse_transcription(&body)
    }
}

fn parse_transcription(body: &str) -> Result<String, EngineError> {
    let response: WhisperResponse = serde_json::from_str(body).map_err(|e| {
        EngineError::InvalidResponse(format!("Whisper API レスポンスパース失敗: {}", e))
    })?;
    Ok(response.text.trim().to_string())
}

#[async_trait]
impl RecognitionEngine for WhisperApiEngine {
    async fn recognize(
        &self,
        chunk: &Chunk,
        language: &LanguageHint,
    ) -> Result<String, EngineError> {
        self.transcribe_file(&chunk.path, language).await
    }

    fn name(&self) -> &'static str {
        "whisper-api"
    }

    async fn shutdown(&self) {
        if self.client.initialized() {
            log::debug!("Whisper API: 終了");
        }
    }
}

#[async_trait]
impl StrategyEngine for WhisperApiEngine {
    async fn recognize_with(
        &self,
        waveform: &CanonicalWaveform,
        strategy: &Strategy,
    ) -> Result<RecognitionOutcome, EngineError> {
        if strategy.features.requests_enrichment() {
            log::debug!(
                "Whisper API は付加情報を返せません (ストラテジー {})",
                strategy.label
            );
        }
        let text = self.transcribe_file(&waveform.path, &strategy.language).await?;
        Ok(RecognitionOutcome::completed(text, None))
    }

    fn name(&self) -> &'static str {
        "whisper-api"
    }
}

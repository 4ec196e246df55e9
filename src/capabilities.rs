use crate::config::{Config, RecognitionMode};
use crate::enriched_api::EnrichedApiEngine;
use crate::llm_api::ChatCompletionsSummarizer;
use crate::summary::SummarizationEngine;
use crate::transcribe_backend::{RecognitionEngine, StrategyEngine};
use crate::whisper_api::WhisperApiEngine;
use anyhow::{bail, Context, Result};
use std::sync::Arc;

/// プロセス全体で共有する認識・要約エンジン
///
/// 起動時に1度だけ作り、[`Pipeline`](crate::pipeline::Pipeline) に渡す。
/// リクエスト毎に作り直さない。
#[derive(Clone, Default)]
pub struct Capabilities {
    /// チャンク単位の認識（`chunked` モード）
    pub recognizer: Option<Arc<dyn RecognitionEngine>>,
    /// ストラテジー付き認識（`strategies` モード）
    pub strategy_engine: Option<Arc<dyn StrategyEngine>>,
    /// 要約。なければテンプレート要約になる
    pub summarizer: Option<Arc<dyn SummarizationEngine>>,
}

impl Capabilities {
    pub fn new(
        recognizer: Option<Arc<dyn RecognitionEngine>>,
        strategy_engine: Option<Arc<dyn StrategyEngine>>,
        summarizer: Option<Arc<dyn SummarizationEngine>>,
    ) -> Self {
        Self {
            recognizer,
            strategy_engine,
            summarizer,
        }
    }

    /// 設定からエンジンを組み立てる
    ///
    /// 選ばれた認識モードに必要なエンジンが作れなければエラー。
    /// 要約エンジンの認証情報がないのはエラーにしない。
    pub fn from_config(config: &Config) -> Result<Self> {
        let whisper = match WhisperApiEngine::from_config(&config.whisper) {
            Ok(engine) => Some(Arc::new(engine)),
            Err(e) => {
                log::debug!("Whisper API エンジンなし: {}", e);
                None
            }
        };

        let enriched: Option<Arc<dyn StrategyEngine>> = match &config.enriched {
            Some(enriched_config) => Some(Arc::new(
                EnrichedApiEngine::from_config(enriched_config)
                    .context("付加情報付き認識エンジンの初期化に失敗")?,
            )),
            None => None,
        };

        let recognizer = whisper
            .clone()
            .map(|engine| engine as Arc<dyn RecognitionEngine>);
        let strategy_engine =
            enriched.or_else(|| whisper.map(|engine| engine as Arc<dyn StrategyEngine>));

        match config.recognition.mode {
            RecognitionMode::Chunked if recognizer.is_none() => bail!(
                "chunked モードには Whisper API のキーが必要です ({})",
                config.whisper.api_key_env
            ),
            RecognitionMode::Strategies if strategy_engine.is_none() => bail!(
                "strategies モードには [enriched] 設定か Whisper API のキーが必要です"
            ),
            _ => {}
        }

        let summarizer: Option<Arc<dyn SummarizationEngine>> =
            match ChatCompletionsSummarizer::from_config(&config.summary) {
                Ok(engine) => Some(Arc::new(engine)),
                Err(e) => {
                    log::warn!("要約エンジンなし（テンプレート要約のみ）: {}", e);
                    None
                }
            };

        let capabilities = Self::new(recognizer, strategy_engine, summarizer);
        log::info!("エンジン構成: {}", capabilities.describe());
        Ok(capabilities)
    }

    /// ログ用の構成説明
    pub fn describe(&self) -> String {
        format!(
            "認識={}, ストラテジー={}, 要約={}",
            self.recognizer.as_ref().map_or("なし", |e| e.name()),
            self.strategy_engine.as_ref().map_or("なし", |e| e.name()),
            self.summarizer.as_ref().map_or("なし", |e| e.name()),
        )
    }

    /// プロセス終了時の後始末
    pub async fn shutdown(&self) {
        if let Some(engine) = &self.recognizer {
            engine.shutdown().await;
        }
        if let Some(engine) = &self.strategy_engine {
            engine.shutdown().await;
        }
        log::debug!("エンジンを解放しました");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnrichedConfig;

    fn keyless_config() -> Config {
        let mut config = Config::default();
        config.whisper.api_key_env = "VOICE_SUMMARY_TEST_UNSET_KEY".to_string();
        config.summary.api_key_env = "VOICE_SUMMARY_TEST_UNSET_KEY".to_string();
        config
    }

    #[test]
    fn test_chunked_mode_requires_recognizer() {
        assert!(Capabilities::from_config(&keyless_config()).is_err());
    }

    #[test]
    fn test_whisper_serves_both_modes() {
        let mut config = keyless_config();
        config.whisper.api_key = Some("key".to_string());

        let capabilities = Capabilities::from_config(&config).unwrap();
        assert_eq!(capabilities.recognizer.as_ref().unwrap().name(), "whisper-api");
        assert_eq!(
            capabilities.strategy_engine.as_ref().unwrap().name(),
            "whisper-api"
        );
        assert!(capabilities.summarizer.is_none());
    }

    #[test]
    fn test_enriched_engine_preferred_for_strategies() {
        let mut config = keyless_config();
        config.recognition.mode = RecognitionMode::Strategies;
        config.enriched = Some(EnrichedConfig {
            api_key: Some("key".to_string()),
            ..EnrichedConfig::default()
        });
        config.summary.api_key = Some("key".to_string());

        let capabilities = Capabilities::from_config(&config).unwrap();
        assert!(capabilities.recognizer.is_none());
        assert_eq!(
            capabilities.strategy_engine.as_ref().unwrap().name(),
            "enriched-api"
        );
        assert_eq!(
            capabilities.summarizer.as_ref().unwrap().name(),
            "chat-completions"
        );
    }

    #[tokio::test]
    async fn test_shutdown_without_engines() {
        let capabilities = Capabilities::default();
        capabilities.shutdown().await;
        assert_eq!(capabilities.describe(), "認識=なし, ストラテジー=なし, 要約=なし");
    }
}

use crate::error::EngineError;
use crate::types::{CanonicalWaveform, Chunk, Enrichment, LanguageHint, Strategy};
use async_trait::async_trait;

/// チャンク単位の文字起こしバックエンドの共通トレイト
///
/// 呼び出しはタイムアウト付きで監視され、時間切れの場合は future ごと破棄される。
/// 実装はキャンセル（ドロップ）されても安全でなければならない。
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// チャンクを文字起こし
    ///
    /// # Arguments
    /// * `chunk` - 上限付き長さのチャンク（WAVファイル）
    /// * `language` - 言語ヒント（`Auto` なら自動判定）
    ///
    /// # Returns
    /// 認識テキスト。無音なら空文字列
    async fn recognize(&self, chunk: &Chunk, language: &LanguageHint)
        -> Result<String, EngineError>;

    /// バックエンド名（ログ用）
    fn name(&self) -> &'static str;

    /// プロセス終了時の後始末
    async fn shutdown(&self) {}
}

/// エンジン自身が報告する処理結果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecognitionStatus {
    Completed,
    /// エンジンが終端エラーを報告（理由付き）
    Failed(String),
}

/// ストラテジー付き認識の結果
#[derive(Clone, Debug)]
pub struct RecognitionOutcome {
    pub status: RecognitionStatus,
    pub text: String,
    pub enrichment: Option<Enrichment>,
}

impl RecognitionOutcome {
    pub fn completed(text: impl Into<String>, enrichment: Option<Enrichment>) -> Self {
        Self {
            status: RecognitionStatus::Completed,
            text: text.into(),
            enrichment,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: RecognitionStatus::Failed(reason.into()),
            text: String::new(),
            enrichment: None,
        }
    }
}

/// 複数の認識設定（ストラテジー）を持つ、ファイル全体を1回で処理するバックエンド
#[async_trait]
pub trait StrategyEngine: Send + Sync {
    /// 指定ストラテジーで波形全体を文字起こし
    async fn recognize_with(
        &self,
        waveform: &CanonicalWaveform,
        strategy: &Strategy,
    ) -> Result<RecognitionOutcome, EngineError>;

    fn name(&self) -> &'static str;

    async fn shutdown(&self) {}
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// チャンク毎の振る舞い
    #[derive(Clone, Debug)]
    pub enum Behavior {
        Text(String),
        Fail(String),
        Sleep(Duration, String),
        Panic,
    }

    /// チャンク番号毎に結果を決めておくモックエンジン
    pub struct ScriptedEngine {
        script: HashMap<usize, Behavior>,
        default: Behavior,
        pub calls: AtomicUsize,
        pub languages: Mutex<Vec<LanguageHint>>,
    }

    impl ScriptedEngine {
        pub fn new(default: Behavior) -> Self {
            Self {
                script: HashMap::new(),
                default,
                calls: AtomicUsize::new(0),
                languages: Mutex::new(Vec::new()),
            }
        }

        pub fn with(mut self, index: usize, behavior: Behavior) -> Self {
            self.script.insert(index, behavior);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecognitionEngine for ScriptedEngine {
        async fn recognize(
            &self,
            chunk: &Chunk,
            language: &LanguageHint,
        ) -> Result<String, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.languages.lock().unwrap().push(language.clone());
            let behavior = self
                .script
                .get(&chunk.index)
                .cloned()
                .unwrap_or_else(|| self.default.clone());
            match behavior {
                Behavior::Text(text) => Ok(text),
                Behavior::Fail(reason) => Err(EngineError::Api(reason)),
                Behavior::Sleep(duration, text) => {
                    tokio::time::sleep(duration).await;
                    Ok(text)
                }
                Behavior::Panic => panic!("engine crashed"),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// ストラテジーラベル毎に結果を決めておくモックエンジン
    pub struct ScriptedStrategyEngine {
        script: HashMap<String, Result<RecognitionOutcome, String>>,
        delay: HashMap<String, Duration>,
        pub invoked: Mutex<Vec<String>>,
    }

    impl ScriptedStrategyEngine {
        pub fn new() -> Self {
            Self {
                script: HashMap::new(),
                delay: HashMap::new(),
                invoked: Mutex::new(Vec::new()),
            }
        }

        pub fn with(mut self, label: &str, outcome: Result<RecognitionOutcome, String>) -> Self {
            self.script.insert(label.to_string(), outcome);
            self
        }

        pub fn with_delay(mut self, label: &str, delay: Duration) -> Self {
            self.delay.insert(label.to_string(), delay);
            self
        }

        pub fn invoked(&self) -> Vec<String> {
            self.invoked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StrategyEngine for ScriptedStrategyEngine {
        async fn recognize_with(
            &self,
            _waveform: &CanonicalWaveform,
            strategy: &Strategy,
        ) -> Result<RecognitionOutcome, EngineError> {
            self.invoked.lock().unwrap().push(strategy.label.clone());
            if let Some(delay) = self.delay.get(&strategy.label) {
                tokio::time::sleep(*delay).await;
            }
            match self.script.get(&strategy.label) {
                Some(Ok(outcome)) => Ok(outcome.clone()),
                Some(Err(reason)) => Err(EngineError::Api(reason.clone())),
                None => Err(EngineError::Api("not scripted".to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "scripted-strategy"
        }
    }
}

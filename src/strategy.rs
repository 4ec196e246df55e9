use crate::config::ProcessingModeConfig;
use crate::error::{diagnostic, PipelineError, StrategyAttempt, REPORT_DIAGNOSTIC_CHARS};
use crate::transcribe_backend::{RecognitionStatus, StrategyEngine};
use crate::types::{CanonicalWaveform, Enrichment, FeatureSet, Strategy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// 処理モード表の1行（入力サイズ上限 → タイムアウト・使えるストラテジー）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessingMode {
    /// 上限なしなら `None`
    pub max_input_bytes: Option<u64>,
    pub timeout: Duration,
    pub strategies: Vec<String>,
}

/// 入力サイズから処理モードを選ぶ
///
/// 表は入力サイズの昇順。大きい入力ほど長いタイムアウトと、少なく保守的な
/// ストラテジーが割り当てられる（検証は `Config::validate` が行う）。
#[derive(Clone, Debug, Default)]
pub struct ModeSelector {
    modes: Vec<ProcessingMode>,
}

impl ModeSelector {
    pub fn new(modes: Vec<ProcessingMode>) -> Self {
        Self { modes }
    }

    pub fn from_config(modes: &[ProcessingModeConfig]) -> Self {
        Self::new(
            modes
                .iter()
                .map(|m| ProcessingMode {
                    max_input_bytes: m.max_input_mb.map(|mb| mb * BYTES_PER_MB),
                    timeout: Duration::from_secs(m.timeout_secs),
                    strategies: m.strategies.clone(),
                })
                .collect(),
        )
    }

    /// `input_bytes` 以上の上限を持つ最初の行。どれにも入らなければ最後の行
    pub fn select(&self, input_bytes: u64) -> Option<&ProcessingMode> {
        self.modes
            .iter()
            .find(|m| m.max_input_bytes.map_or(true, |max| input_bytes <= max))
            .or_else(|| self.modes.last())
    }
}

/// ストラテジーの勝者
#[derive(Clone, Debug)]
pub struct StrategyWin {
    pub label: String,
    pub features: FeatureSet,
    pub text: String,
    pub enrichment: Option<Enrichment>,
    /// 勝者より前に失敗したストラテジー
    pub attempts: Vec<StrategyAttempt>,
}

/// ストラテジーを宣言順に試し、最初に空でないテキストを返したものを採用する
///
/// エンジンのエラー・エンジンが報告した失敗・空のテキスト・タイムアウトは
/// いずれも次のストラテジーへ進む理由になる。全滅したら
/// [`PipelineError::AllStrategiesExhausted`] を理由一覧付きで返す。
pub struct StrategyController {
    engine: Arc<dyn StrategyEngine>,
    strategies: Vec<Strategy>,
    modes: ModeSelector,
    default_timeout: Duration,
}

impl StrategyController {
    pub fn new(
        engine: Arc<dyn StrategyEngine>,
        strategies: Vec<Strategy>,
        modes: ModeSelector,
        default_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            strategies,
            modes,
            default_timeout,
        }
    }

    /// 入力サイズに応じたタイムアウトと、試すストラテジー（宣言順）を決める
    pub fn plan(&self, input_bytes: u64) -> (Duration, Vec<Strategy>) {
        match self.modes.select(input_bytes) {
            Some(mode) => {
                let allowed: Vec<Strategy> = self
                    .strategies
                    .iter()
                    .filter(|s| mode.strategies.contains(&s.label))
                    .cloned()
                    .collect();
                (mode.timeout, allowed)
            }
            None => (self.default_timeout, self.strategies.clone()),
        }
    }

    pub async fn run(
        &self,
        waveform: &CanonicalWaveform,
        input_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<StrategyWin, PipelineError> {
        let (timeout, strategies) = self.plan(input_bytes);
        log::info!(
            "ストラテジー選択: 入力 {} バイト → タイムアウト {:?}, 候補 {:?}",
            input_bytes,
            timeout,
            strategies.iter().map(|s| s.label.as_str()).collect::<Vec<_>>()
        );

        let mut attempts = Vec::new();

        for strategy in strategies {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            log::info!(
                "ストラテジー {} を試行 (言語: {}, 付加情報: {:?})",
                strategy.label,
                strategy.language,
                strategy.features
            );

            match self.attempt(waveform, &strategy, timeout, cancel).await? {
                Ok((text, enrichment)) => {
                    log::info!(
                        "ストラテジー {} 成功: {} 文字",
                        strategy.label,
                        text.chars().count()
                    );
                    return Ok(StrategyWin {
                        label: strategy.label,
                        features: strategy.features,
                        text,
                        enrichment,
                        attempts,
                    });
                }
                Err(reason) => {
                    log::warn!("ストラテジー {} 失敗: {}", strategy.label, reason);
                    attempts.push(StrategyAttempt {
                        label: strategy.label,
                        reason,
                    });
                }
            }
        }

        log::error!("すべてのストラテジーが失敗しました ({} 件)", attempts.len());
        Err(PipelineError::AllStrategiesExhausted { attempts })
    }

    /// 1ストラテジーの試行。外側の `Err` はキャンセルのみ、内側の `Err` は失敗理由
    async fn attempt(
        &self,
        waveform: &CanonicalWaveform,
        strategy: &Strategy,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Result<(String, Option<Enrichment>), String>, PipelineError> {
        let engine = Arc::clone(&self.engine);
        let task_waveform = waveform.clone();
        let task_strategy = strategy.clone();
        let mut handle = AbortOnDropHandle::new(tokio::spawn(async move {
            engine.recognize_with(&task_waveform, &task_strategy).await
        }));

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                return Err(PipelineError::Cancelled);
            }
            joined = tokio::time::timeout(timeout, &mut handle) => joined,
        };

        let outcome = match joined {
            Err(_) => {
                handle.abort();
                return Ok(Err(format!("timeout after {:?}", timeout)));
            }
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "engine panicked".to_string()
                } else {
                    join_error.to_string()
                };
                return Ok(Err(reason));
            }
            Ok(Ok(Err(e))) => {
                return Ok(Err(diagnostic(&e.to_string(), REPORT_DIAGNOSTIC_CHARS)));
            }
            Ok(Ok(Ok(outcome))) => outcome,
        };

        if let RecognitionStatus::Failed(reason) = outcome.status {
            return Ok(Err(format!(
                "engine reported error: {}",
                diagnostic(&reason, REPORT_DIAGNOSTIC_CHARS)
            )));
        }

        let text = outcome.text.trim().to_string();
        if text.is_empty() {
            return Ok(Err("empty transcript".to_string()));
        }

        Ok(Ok((text, outcome.enrichment)))
    }
}

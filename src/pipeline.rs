use crate::assembler::assemble;
use crate::capabilities::Capabilities;
use crate::config::{Config, RecognitionMode};
use crate::error::{PipelineError, StrategyAttempt};
use crate::normalizer::normalize;
use crate::segmenter::Segmenter;
use crate::strategy::{ModeSelector, StrategyController};
use crate::summary::{PromptVariant, SummaryBuilder, SummarySource};
use crate::supervisor::SegmentSupervisor;
use crate::types::{
    AudioFile, CanonicalWaveform, Enrichment, FeatureSet, SegmentResult, SegmentStatus,
};
use anyhow::{bail, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// 1リクエスト分の応答
#[derive(Clone, Debug, Serialize)]
pub struct PipelineOutput {
    pub transcript: String,
    pub summary: String,
    pub summary_source: SummarySource,
    /// 勝ったストラテジー（`strategies` モードのみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// 勝者より前に失敗したストラテジー
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_strategies: Vec<StrategyAttempt>,
    /// チャンク毎の結果（`chunked` モードのみ）
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<SegmentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
    pub duration_secs: f64,
    /// RFC 3339
    pub processed_at: String,
}

/// 認識ステージの結果
struct Recognition {
    transcript: String,
    strategy: Option<String>,
    features: Option<FeatureSet>,
    failed_strategies: Vec<StrategyAttempt>,
    segments: Vec<SegmentResult>,
    enrichment: Option<Enrichment>,
}

/// 音声ファイル → 文字起こし → 要約 のパイプライン
///
/// リクエストは互いに状態を共有しない。一時ファイルはリクエスト毎の
/// ディレクトリに置き、成功・失敗・キャンセルのどの経路でも削除される。
pub struct Pipeline {
    config: Config,
    segmenter: Segmenter,
    supervisor: Option<SegmentSupervisor>,
    strategies: Option<StrategyController>,
    summary: SummaryBuilder,
}

impl Pipeline {
    /// 設定とエンジンからパイプラインを組み立てる
    ///
    /// 設定された認識モードに必要なエンジンがなければエラー。
    pub fn new(config: Config, capabilities: Capabilities) -> Result<Self> {
        let supervisor = capabilities.recognizer.clone().map(|engine| {
            SegmentSupervisor::new(engine, config.whisper.language.clone(), &config.supervisor)
        });

        let strategies = capabilities.strategy_engine.clone().map(|engine| {
            StrategyController::new(
                engine,
                config.recognition.strategies.clone(),
                ModeSelector::from_config(&config.recognition.modes),
                config.pipeline.request_timeout(),
            )
        });

        match config.recognition.mode {
            RecognitionMode::Chunked if supervisor.is_none() => {
                bail!("chunked モードに必要な認識エンジンがありません")
            }
            RecognitionMode::Strategies if strategies.is_none() => {
                bail!("strategies モードに必要な認識エンジンがありません")
            }
            _ => {}
        }

        let summary = SummaryBuilder::new(capabilities.summarizer.clone(), &config.summary);

        Ok(Self {
            segmenter: Segmenter::new(&config.segmenter),
            supervisor,
            strategies,
            summary,
            config,
        })
    }

    /// 音声ファイルを1件処理する
    ///
    /// 全体に `pipeline.request_timeout_secs` の上限がかかり、超えると
    /// [`PipelineError::ProcessingTimeExceeded`]。`cancel` が発火すると
    /// [`PipelineError::Cancelled`] で即座に戻る。
    pub async fn process(
        &self,
        file: AudioFile,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        let limit = self.config.pipeline.request_timeout();
        let started = Instant::now();
        log::info!("処理開始: {} ({} バイト)", file.filename, file.bytes.len());

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            outcome = tokio::time::timeout(limit, self.run(file, cancel)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(PipelineError::ProcessingTimeExceeded(limit)),
            },
        };

        match &result {
            Ok(output) => log::info!(
                "処理完了: {:.1}秒の音声, {} 文字, 要約={:?} ({:.2}秒)",
                output.duration_secs,
                output.transcript.chars().count(),
                output.summary_source,
                started.elapsed().as_secs_f64()
            ),
            Err(e) => log::error!("処理失敗: {} ({:.2}秒)", e, started.elapsed().as_secs_f64()),
        }

        result
    }

    async fn run(
        &self,
        file: AudioFile,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        let size = file.bytes.len();
        if size == 0 {
            return Err(PipelineError::EmptyInput);
        }
        let limit = self.config.pipeline.max_input_bytes;
        if size > limit {
            return Err(PipelineError::InputTooLarge { size, limit });
        }

        // 途中で future が破棄されても、ブロッキング処理が終わるまでは
        // ディレクトリを消さない
        let scratch = Arc::new(self.create_scratch_dir()?);
        log::debug!("一時ディレクトリ: {:?}", scratch.path());

        // 外側のタイムアウトで future が破棄されたらデコードも止める
        let stop = cancel.child_token();
        let _stop_on_drop = stop.clone().drop_guard();

        let waveform = self
            .normalize_audio(file, Arc::clone(&scratch), stop)
            .await?;
        let duration_secs = waveform.duration_secs();

        let recognition = match self.config.recognition.mode {
            RecognitionMode::Chunked => {
                self.recognize_chunked(waveform, Arc::clone(&scratch), cancel)
                    .await?
            }
            RecognitionMode::Strategies => {
                self.recognize_with_strategies(&waveform, size as u64, cancel)
                    .await?
            }
        };

        let variant =
            PromptVariant::for_recognition(recognition.features, recognition.enrichment.as_ref());
        let summary = self
            .summary
            .summarize(
                &recognition.transcript,
                recognition.enrichment.as_ref(),
                variant,
            )
            .await;

        Ok(PipelineOutput {
            transcript: recognition.transcript,
            summary: summary.text,
            summary_source: summary.source,
            strategy: recognition.strategy,
            failed_strategies: recognition.failed_strategies,
            segments: recognition.segments,
            enrichment: recognition.enrichment,
            duration_secs,
            processed_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    fn create_scratch_dir(&self) -> Result<TempDir, PipelineError> {
        let parent: PathBuf = self
            .config
            .pipeline
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent)?;
        let dir = tempfile::Builder::new()
            .prefix("voice-summary-")
            .tempdir_in(&parent)?;
        Ok(dir)
    }

    async fn normalize_audio(
        &self,
        file: AudioFile,
        scratch: Arc<TempDir>,
        stop: CancellationToken,
    ) -> Result<CanonicalWaveform, PipelineError> {
        let sample_rate = self.config.audio.sample_rate;
        let started = Instant::now();

        let waveform = tokio::task::spawn_blocking(move || {
            normalize(&file, scratch.path(), sample_rate, &stop)
        })
        .await
        .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))??;

        log::debug!(
            "正規化ステージ: {} サンプル ({:.2}秒)",
            waveform.sample_count,
            started.elapsed().as_secs_f64()
        );
        Ok(waveform)
    }

    async fn recognize_chunked(
        &self,
        waveform: CanonicalWaveform,
        scratch: Arc<TempDir>,
        cancel: &CancellationToken,
    ) -> Result<Recognition, PipelineError> {
        let Some(supervisor) = &self.supervisor else {
            return Err(PipelineError::Artifact(std::io::Error::other(
                "認識エンジンがありません",
            )));
        };

        let segmenter = self.segmenter.clone();
        let chunks = tokio::task::spawn_blocking(move || {
            segmenter.segment(waveform, scratch.path())
        })
        .await
        .map_err(|e| PipelineError::Artifact(std::io::Error::other(e.to_string())))??;

        let segments = supervisor.transcribe_all(chunks, cancel).await?;

        // 無音だけなら入力側の問題。認識失敗を含む場合はプレースホルダ付きで返す
        if segments
            .iter()
            .all(|s| matches!(s.status, SegmentStatus::Empty))
        {
            log::warn!("どのチャンクからも音声を認識できませんでした");
            return Err(PipelineError::NoSpeechRecognized);
        }
        if !segments.iter().any(SegmentResult::is_ok) {
            log::error!(
                "全 {} チャンクの認識に失敗しました。プレースホルダのみのトランスクリプトを返します",
                segments.len()
            );
        }

        let transcript = assemble(&segments, self.config.supervisor.timestamps);

        Ok(Recognition {
            transcript,
            strategy: None,
            features: None,
            failed_strategies: Vec::new(),
            segments,
            enrichment: None,
        })
    }

    async fn recognize_with_strategies(
        &self,
        waveform: &CanonicalWaveform,
        input_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<Recognition, PipelineError> {
        let Some(controller) = &self.strategies else {
            return Err(PipelineError::Artifact(std::io::Error::other(
                "認識エンジンがありません",
            )));
        };

        let win = controller.run(waveform, input_bytes, cancel).await?;

        Ok(Recognition {
            transcript: win.text,
            strategy: Some(win.label),
            features: Some(win.features),
            failed_strategies: win.attempts,
            segments: Vec::new(),
            enrichment: win.enrichment,
        })
    }
}

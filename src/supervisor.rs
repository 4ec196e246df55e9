use crate::config::SupervisorConfig;
use crate::error::{diagnostic, PipelineError};
use crate::transcribe_backend::RecognitionEngine;
use crate::types::{Chunk, LanguageHint, SegmentResult, SegmentStatus};
use futures_util::{stream, StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

/// チャンクファイルの削除ガード
///
/// どの経路で抜けても（成功・失敗・タイムアウト・外側での future 破棄）
/// ドロップ時にファイルを削除する。
struct ChunkFileGuard(PathBuf);

impl Drop for ChunkFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => log::debug!("チャンクファイル削除: {:?}", self.0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("チャンクファイルの削除に失敗: {:?}: {}", self.0, e),
        }
    }
}

/// 認識エンジンをチャンク単位で駆動する監視役
///
/// - エンジン呼び出しには固定のタイムアウトをかける。時間切れの呼び出しは
///   タスクごと中止し、二度と待たない
/// - エンジンのエラーやパニックはチャンク内に閉じ込め、後続チャンクは続行する
/// - 0バイトのチャンクはエンジンを呼ばずに `Empty` とする
/// - 各チャンクの最終ステータスは必ず1つだけ
pub struct SegmentSupervisor {
    engine: Arc<dyn RecognitionEngine>,
    language: LanguageHint,
    timeout: Duration,
    max_concurrent: usize,
    diagnostic_chars: usize,
}

impl SegmentSupervisor {
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        language: LanguageHint,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            engine,
            language,
            timeout: config.chunk_timeout(),
            max_concurrent: config.max_concurrent_chunks.max(1),
            diagnostic_chars: config.diagnostic_chars,
        }
    }

    /// 全チャンクを処理し、チャンク番号順の結果を返す
    ///
    /// `max_concurrent` が2以上なら複数チャンクを同時に投げるが、
    /// 結果の並びは常に完了順ではなくチャンク番号順。
    ///
    /// # Errors
    ///
    /// キャンセルされた場合のみ [`PipelineError::Cancelled`]。チャンク単位の
    /// 失敗はエラーにならず、結果のステータスとして返る。
    pub async fn transcribe_all(
        &self,
        chunks: Vec<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SegmentResult>, PipelineError> {
        let total = chunks.len();
        log::info!(
            "{} チャンクの文字起こしを開始 (エンジン: {}, 同時実行: {}, タイムアウト: {:?})",
            total,
            self.engine.name(),
            self.max_concurrent,
            self.timeout
        );

        // 途中でキャンセルされても未処理チャンクのファイルを残さない
        let _guards: Vec<ChunkFileGuard> = chunks
            .iter()
            .map(|c| ChunkFileGuard(c.path.clone()))
            .collect();

        let mut results: Vec<SegmentResult> = stream::iter(chunks)
            .map(|chunk| self.transcribe_chunk(chunk, cancel))
            .buffered(self.max_concurrent)
            .try_collect()
            .await?;

        results.sort_by_key(|r| r.chunk_index);

        let ok = results.iter().filter(|r| r.is_ok()).count();
        log::info!("文字起こし完了: {}/{} チャンク成功", ok, total);

        Ok(results)
    }

    /// 1チャンクを処理
    ///
    /// チャンクファイルは試行直後に結果に関わらず削除される。
    pub async fn transcribe_chunk(
        &self,
        chunk: Chunk,
        cancel: &CancellationToken,
    ) -> Result<SegmentResult, PipelineError> {
        let _guard = ChunkFileGuard(chunk.path.clone());

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let file_len = match tokio::fs::metadata(&chunk.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                log::error!("チャンク {}: ファイルを読めません: {}", chunk.index + 1, e);
                return Ok(SegmentResult::failed(
                    &chunk,
                    SegmentStatus::EngineError {
                        diagnostic: diagnostic(
                            &format!("chunk file unavailable: {}", e),
                            self.diagnostic_chars,
                        ),
                    },
                ));
            }
        };
        if chunk.sample_count == 0 || file_len == 0 {
            log::warn!("チャンク {}: 空のためスキップ", chunk.index + 1);
            return Ok(SegmentResult::failed(&chunk, SegmentStatus::Empty));
        }

        let started = Instant::now();
        let engine = Arc::clone(&self.engine);
        let language = self.language.clone();
        let task_chunk = chunk.clone();
        // 呼び出し側の future が破棄された場合もタスクは中止される
        let mut handle = AbortOnDropHandle::new(tokio::spawn(async move {
            engine.recognize(&task_chunk, &language).await
        }));

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                return Err(PipelineError::Cancelled);
            }
            joined = tokio::time::timeout(self.timeout, &mut handle) => joined,
        };

        let result = match joined {
            Err(_) => {
                // 時間切れ: タスクを中止し、結果は待たない
                handle.abort();
                log::warn!(
                    "チャンク {}: {:?} 以内に応答がなくタイムアウト",
                    chunk.index + 1,
                    self.timeout
                );
                SegmentResult::failed(&chunk, SegmentStatus::Timeout)
            }
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "engine panicked".to_string()
                } else {
                    join_error.to_string()
                };
                log::error!("チャンク {}: 認識タスク異常終了: {}", chunk.index + 1, reason);
                SegmentResult::failed(
                    &chunk,
                    SegmentStatus::EngineError {
                        diagnostic: diagnostic(&reason, self.diagnostic_chars),
                    },
                )
            }
            Ok(Ok(Err(e))) => {
                log::error!("チャンク {}: 文字起こしエラー: {}", chunk.index + 1, e);
                SegmentResult::failed(
                    &chunk,
                    SegmentStatus::EngineError {
                        diagnostic: diagnostic(&e.to_string(), self.diagnostic_chars),
                    },
                )
            }
            Ok(Ok(Ok(text))) => {
                let text = text.trim();
                if text.is_empty() {
                    log::info!("チャンク {}: 音声は認識されませんでした", chunk.index + 1);
                    SegmentResult::failed(&chunk, SegmentStatus::Empty)
                } else {
                    log::debug!(
                        "チャンク {}: {} 文字 ({:.1}秒)",
                        chunk.index + 1,
                        text.chars().count(),
                        started.elapsed().as_secs_f64()
                    );
                    SegmentResult::ok(&chunk, text)
                }
            }
        };

        Ok(result)
    }
}

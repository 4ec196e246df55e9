//! voice-summary - 録音ファイルの文字起こしと要約
//!
//! このクレートは、任意の形式・長さの音声ファイルを受け取り、外部の音声認識
//! サービスでトランスクリプトを作り、LLMで短い構造化要約を付けて返します。
//!
//! # 主な機能
//!
//! - **正規化**: symphonia でデコードし、モノラル・16kHz・16bit の WAV に変換
//! - **分割**: 長い録音を固定長チャンクに分割（ストリーミング、全体をメモリに載せない）
//! - **チャンク監視**: チャンク毎のタイムアウト・エラー・パニックを隔離し、
//!   失敗箇所はトランスクリプト中のプレースホルダとして残す
//! - **ストラテジー切り替え**: 複数の認識設定を順に試し、最初の成功を採用
//! - **要約**: 1回だけLLMを呼び、失敗時は付加情報からテンプレート要約
//!
//! # アーキテクチャ
//!
//! ```text
//! [AudioFile] → [normalizer] → [CanonicalWaveform]
//!                                      │
//!                        ┌─────────────┴─────────────┐
//!                        │ chunked                   │ strategies
//!                        ↓                           ↓
//!                  [Segmenter]              [StrategyController]
//!                        ↓                           │
//!              [SegmentSupervisor (×N)]              │
//!                        ↓                           │
//!                   [assembler]                      │
//!                        └─────────────┬─────────────┘
//!                                      ↓
//!                               [SummaryBuilder]
//!                                      ↓
//!                               [PipelineOutput]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use voice_summary::capabilities::Capabilities;
//! use voice_summary::config::Config;
//! use voice_summary::pipeline::Pipeline;
//! use voice_summary::types::AudioFile;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load_or_default("config.toml")?;
//! let capabilities = Capabilities::from_config(&config)?;
//! let pipeline = Pipeline::new(config, capabilities)?;
//!
//! let bytes = std::fs::read("meeting.mp3")?;
//! let output = pipeline
//!     .process(AudioFile::new(bytes, "meeting.mp3"), &CancellationToken::new())
//!     .await?;
//! println!("{}", output.summary);
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod capabilities;
pub mod config;
pub mod enriched_api;
pub mod error;
pub mod llm_api;
pub mod normalizer;
pub mod pipeline;
pub mod segmenter;
pub mod strategy;
pub mod summary;
pub mod supervisor;
pub mod transcribe_backend;
pub mod types;
pub mod wav_writer;
pub mod whisper_api;

use crate::types::{FeatureSet, LanguageHint, Strategy};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub segmenter: SegmenterConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub whisper: WhisperConfig,
    pub enriched: Option<EnrichedConfig>,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// 正規化設定
///
/// # デフォルト値
///
/// - `sample_rate`: 16000 Hz（認識エンジンの推奨値）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

/// チャンク分割設定
///
/// # デフォルト値
///
/// - `chunk_length_secs`: 300 秒
/// - `split_threshold_secs`: 300 秒（これを超える録音のみ分割）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmenterConfig {
    #[serde(default = "default_chunk_length_secs")]
    pub chunk_length_secs: u64,
    #[serde(default = "default_split_threshold_secs")]
    pub split_threshold_secs: u64,
}

/// チャンク毎の文字起こし監視設定
///
/// # デフォルト値
///
/// - `chunk_timeout_secs`: 60 秒
/// - `max_concurrent_chunks`: 1（逐次処理）
/// - `diagnostic_chars`: 50 文字
/// - `timestamps`: false
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    #[serde(default = "default_diagnostic_chars")]
    pub diagnostic_chars: usize,
    /// 各セグメントの先頭に `[mm:ss]` を付ける
    #[serde(default)]
    pub timestamps: bool,
}

/// 認識方式
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    /// チャンク分割 + チャンク毎の認識
    Chunked,
    /// ファイル全体を1回で認識し、ストラテジーを順に試す
    Strategies,
}

/// 処理モード表の1行
///
/// `max_input_mb` 以下の入力に `timeout_secs` と `strategies` を適用する。
/// `max_input_mb` 省略時は上限なし（最後の行にのみ使う）。
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProcessingModeConfig {
    pub max_input_mb: Option<u64>,
    pub timeout_secs: u64,
    pub strategies: Vec<String>,
}

/// 認識設定
///
/// `strategies` は優先順。`modes` は入力サイズの昇順で並べる。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_recognition_mode")]
    pub mode: RecognitionMode,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<Strategy>,
    #[serde(default = "default_modes")]
    pub modes: Vec<ProcessingModeConfig>,
}

/// OpenAI互換の音声認識API設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhisperConfig {
    #[serde(default = "default_whisper_base_url")]
    pub base_url: String,
    /// Whisper モデル名（通常 "whisper-1"）
    #[serde(default = "default_whisper_model")]
    pub model: String,
    /// APIキー。省略時は `api_key_env` の環境変数を読む
    pub api_key: Option<String>,
    #[serde(default = "default_whisper_api_key_env")]
    pub api_key_env: String,
    /// 言語ヒント（"auto" または言語コード）
    #[serde(default)]
    pub language: LanguageHint,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// 付加情報付き認識サービスの設定（アップロード → ジョブ投入 → ポーリング）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnrichedConfig {
    #[serde(default = "default_enriched_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_enriched_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// 要約（LLM）設定
///
/// # デフォルト値
///
/// - `base_url`: OpenRouter
/// - `model`: "anthropic/claude-3-haiku"
/// - `max_tokens`: 500
/// - `temperature`: 0.2
/// - `timeout_secs`: 30 秒
/// - `transcript_char_budget`: 12000 文字
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SummaryConfig {
    #[serde(default = "default_summary_base_url")]
    pub base_url: String,
    #[serde(default = "default_summary_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_summary_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_summary_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_transcript_char_budget")]
    pub transcript_char_budget: usize,
    /// 要約を書く言語
    #[serde(default = "default_output_language")]
    pub output_language: String,
}

/// リクエスト全体の設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// リクエスト全体の処理時間上限（チャンク毎のタイムアウトとは別）
    #[serde(default = "default_pipeline_timeout_secs")]
    pub request_timeout_secs: u64,
    /// リクエスト毎の一時ディレクトリを作る場所（省略時はシステムの一時ディレクトリ）
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
}

/// 出力設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_pretty")]
    pub pretty: bool,
}

// Default functions
fn default_sample_rate() -> u32 {
    16000
}

fn default_chunk_length_secs() -> u64 {
    300
}

fn default_split_threshold_secs() -> u64 {
    300
}

fn default_chunk_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_chunks() -> usize {
    1
}

fn default_diagnostic_chars() -> usize {
    crate::error::PLACEHOLDER_DIAGNOSTIC_CHARS
}

fn default_recognition_mode() -> RecognitionMode {
    RecognitionMode::Chunked
}

fn default_strategies() -> Vec<Strategy> {
    vec![
        Strategy::new(
            "fixed-language-full",
            LanguageHint::Fixed("ru".to_string()),
            FeatureSet::Full,
        ),
        Strategy::new("auto-full", LanguageHint::Auto, FeatureSet::Full),
        Strategy::new("auto-minimal", LanguageHint::Auto, FeatureSet::Minimal),
    ]
}

fn default_modes() -> Vec<ProcessingModeConfig> {
    vec![
        ProcessingModeConfig {
            max_input_mb: Some(25),
            timeout_secs: 300,
            strategies: vec![
                "fixed-language-full".to_string(),
                "auto-full".to_string(),
                "auto-minimal".to_string(),
            ],
        },
        ProcessingModeConfig {
            max_input_mb: Some(60),
            timeout_secs: 600,
            strategies: vec!["fixed-language-full".to_string(), "auto-minimal".to_string()],
        },
        ProcessingModeConfig {
            max_input_mb: None,
            timeout_secs: 1500,
            strategies: vec!["auto-minimal".to_string()],
        },
    ]
}

fn default_whisper_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_whisper_model() -> String {
    "whisper-1".to_string()
}

fn default_whisper_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_enriched_base_url() -> String {
    "https://api.assemblyai.com/v2".to_string()
}

fn default_enriched_api_key_env() -> String {
    "ASSEMBLYAI_API_KEY".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_summary_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_summary_model() -> String {
    "anthropic/claude-3-haiku".to_string()
}

fn default_summary_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.2
}

fn default_summary_timeout_secs() -> u64 {
    30
}

fn default_transcript_char_budget() -> usize {
    12000
}

fn default_output_language() -> String {
    "Russian".to_string()
}

fn default_pipeline_timeout_secs() -> u64 {
    1800
}

fn default_max_input_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pretty() -> bool {
    true
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
        }
    }
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            chunk_length_secs: default_chunk_length_secs(),
            split_threshold_secs: default_split_threshold_secs(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: default_chunk_timeout_secs(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            diagnostic_chars: default_diagnostic_chars(),
            timestamps: false,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            mode: default_recognition_mode(),
            strategies: default_strategies(),
            modes: default_modes(),
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            base_url: default_whisper_base_url(),
            model: default_whisper_model(),
            api_key: None,
            api_key_env: default_whisper_api_key_env(),
            language: LanguageHint::Auto,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for EnrichedConfig {
    fn default() -> Self {
        Self {
            base_url: default_enriched_base_url(),
            api_key: None,
            api_key_env: default_enriched_api_key_env(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            base_url: default_summary_base_url(),
            model: default_summary_model(),
            api_key: None,
            api_key_env: default_summary_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_summary_timeout_secs(),
            transcript_char_budget: default_transcript_char_budget(),
            output_language: default_output_language(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_pipeline_timeout_secs(),
            temp_dir: None,
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pretty: default_pretty(),
        }
    }
}

/// 設定値 → 環境変数の順でAPIキーを解決する
fn resolve_api_key(api_key: &Option<String>, env_name: &str) -> Option<String> {
    api_key
        .clone()
        .or_else(|| std::env::var(env_name).ok())
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

impl WhisperConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(&self.api_key, &self.api_key_env)
    }
}

impl EnrichedConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(&self.api_key, &self.api_key_env)
    }
}

impl SummaryConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(&self.api_key, &self.api_key_env)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SupervisorConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースし、検証したうえでConfig構造体を返す。
    ///
    /// # Errors
    ///
    /// 読み込み・パース・検証のいずれかに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use voice_summary::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        config.validate()?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use voice_summary::config::Config;
    /// let config = Config::load_or_default("config.toml").unwrap();
    /// ```
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// 設定値の整合性を検証
    ///
    /// 処理モード表は入力サイズについて単調でなければならない。
    /// 大きい入力ほどタイムアウトは長く（以上）、ストラテジーは少なく（以下）。
    /// 各行のストラテジーを全て時間切れまで試しても、リクエスト全体の
    /// タイムアウトより短く終わらなければならない。
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            bail!("audio.sample_rate は 1 以上を指定してください");
        }
        if self.segmenter.chunk_length_secs == 0 {
            bail!("segmenter.chunk_length_secs は 1 以上を指定してください");
        }
        if self.supervisor.chunk_timeout_secs == 0 {
            bail!("supervisor.chunk_timeout_secs は 1 以上を指定してください");
        }
        if self.supervisor.max_concurrent_chunks == 0 {
            bail!("supervisor.max_concurrent_chunks は 1 以上を指定してください");
        }

        let labels: Vec<&str> = self
            .recognition
            .strategies
            .iter()
            .map(|s| s.label.as_str())
            .collect();
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                bail!("ストラテジーのラベルが重複しています: {}", label);
            }
        }

        if self.recognition.mode == RecognitionMode::Strategies {
            if labels.is_empty() {
                bail!("recognition.mode = \"strategies\" には1つ以上のストラテジーが必要です");
            }
            if self.enriched.is_none()
                && self
                    .recognition
                    .strategies
                    .iter()
                    .any(|s| s.features.requests_enrichment())
            {
                log::warn!("[enriched] 未設定のため、付加情報の要求は無視されます");
            }
        }

        let outer_secs = self.pipeline.request_timeout_secs;
        let modes = &self.recognition.modes;
        for (i, mode) in modes.iter().enumerate() {
            if mode.strategies.is_empty() {
                bail!("処理モード {} にストラテジーがありません", i);
            }
            let worst_case = mode.timeout_secs.saturating_mul(mode.strategies.len() as u64);
            if worst_case >= outer_secs {
                bail!(
                    "処理モード {}: {}秒 × {} ストラテジーが pipeline.request_timeout_secs ({}秒) 以上です",
                    i,
                    mode.timeout_secs,
                    mode.strategies.len(),
                    outer_secs
                );
            }
            for label in &mode.strategies {
                if !labels.contains(&label.as_str()) {
                    bail!("処理モード {} が未定義のストラテジーを参照: {}", i, label);
                }
            }
            if mode.max_input_mb.is_none() && i + 1 != modes.len() {
                bail!("上限なしの処理モードは最後の行にのみ指定できます");
            }
            if i > 0 {
                let prev = &modes[i - 1];
                if let (Some(prev_max), Some(max)) = (prev.max_input_mb, mode.max_input_mb) {
                    if max <= prev_max {
                        bail!("処理モードのサイズ上限は昇順にしてください: {} <= {}", max, prev_max);
                    }
                }
                if mode.timeout_secs < prev.timeout_secs {
                    bail!("大きい入力のタイムアウトが短くなっています (処理モード {})", i);
                }
                if mode.strategies.len() > prev.strategies.len() {
                    bail!("大きい入力のストラテジー数が増えています (処理モード {})", i);
                }
            }
        }

        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// アップロードされた音声ファイル
///
/// 入力側（CLIなど）が所有し、正規化後は破棄される。
#[derive(Clone, Debug)]
pub struct AudioFile {
    /// 生データ（コンテナ・コーデック不明）
    pub bytes: Vec<u8>,

    /// 申告されたファイル名（拡張子はデコーダのヒントに使う）
    pub filename: String,
}

impl AudioFile {
    pub fn new(bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
        }
    }

    /// 拡張子（小文字）
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// 正規化済み波形
///
/// モノラル・16kHz・16ビットPCMのWAVファイル。リクエスト毎の
/// 一時ディレクトリに置かれ、パイプラインが所有する。
///
/// # 不変条件
///
/// - チャンネル数は常に1
/// - サンプルレートは一定
/// - サンプル数は1以上
#[derive(Clone, Debug)]
pub struct CanonicalWaveform {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub sample_count: u64,
}

impl CanonicalWaveform {
    /// 波形の長さ（秒）
    pub fn duration_secs(&self) -> f64 {
        self.sample_count as f64 / self.sample_rate as f64
    }
}

/// 文字起こしの作業単位となる音声チャンク
///
/// チャンク同士は連続し、重ならない。
#[derive(Clone, Debug)]
pub struct Chunk {
    /// 0始まりの連番
    pub index: usize,

    /// 録音先頭からの開始位置（秒）
    pub start_offset_secs: f64,

    /// チャンク長（秒）
    pub duration_secs: f64,

    /// 含まれるサンプル数
    pub sample_count: u64,

    /// チャンクWAVファイル
    pub path: PathBuf,
}

/// チャンク毎の最終ステータス
///
/// 1チャンクにつき必ず1つだけ決まる。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentStatus {
    /// 認識成功
    Ok,
    /// 空チャンク、または認識エンジンが無音と判断
    Empty,
    /// タイムアウト
    Timeout,
    /// 認識エンジンのエラー（切り詰め済みの診断メッセージ付き）
    EngineError { diagnostic: String },
}

impl SegmentStatus {
    /// プレースホルダ用の短いラベル
    pub fn label(&self) -> String {
        match self {
            SegmentStatus::Ok => "ok".to_string(),
            SegmentStatus::Empty => "no speech".to_string(),
            SegmentStatus::Timeout => "timeout".to_string(),
            SegmentStatus::EngineError { diagnostic } => format!("error: {}", diagnostic),
        }
    }
}

/// チャンク毎の文字起こし結果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentResult {
    pub chunk_index: usize,
    pub start_offset_secs: f64,
    #[serde(flatten)]
    pub status: SegmentStatus,
    /// `Ok` 以外では常に空
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl SegmentResult {
    pub fn ok(chunk: &Chunk, text: impl Into<String>) -> Self {
        Self {
            chunk_index: chunk.index,
            start_offset_secs: chunk.start_offset_secs,
            status: SegmentStatus::Ok,
            text: text.into(),
        }
    }

    pub fn failed(chunk: &Chunk, status: SegmentStatus) -> Self {
        Self {
            chunk_index: chunk.index,
            start_offset_secs: chunk.start_offset_secs,
            status,
            text: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SegmentStatus::Ok
    }
}

/// 認識エンジンに渡す言語ヒント
///
/// 設定ファイルでは `"auto"` または言語コード（`"ru"`, `"en"` など）で書く。
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LanguageHint {
    #[default]
    Auto,
    Fixed(String),
}

impl LanguageHint {
    /// 固定言語ならそのコード
    pub fn code(&self) -> Option<&str> {
        match self {
            LanguageHint::Auto => None,
            LanguageHint::Fixed(code) => Some(code),
        }
    }
}

impl From<String> for LanguageHint {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            LanguageHint::Auto
        } else {
            LanguageHint::Fixed(trimmed.to_string())
        }
    }
}

impl From<LanguageHint> for String {
    fn from(value: LanguageHint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for LanguageHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LanguageHint::Auto => f.write_str("auto"),
            LanguageHint::Fixed(code) => f.write_str(code),
        }
    }
}

/// 認識エンジンに要求する付加情報のセット
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSet {
    /// 話者・トピック・重要箇所・感情・固有表現をすべて要求
    Full,
    /// 話者分離のみ（大きな入力向け）
    Minimal,
    /// テキストのみ
    Plain,
}

impl FeatureSet {
    pub fn requests_enrichment(self) -> bool {
        !matches!(self, FeatureSet::Plain)
    }
}

/// 認識ストラテジー（言語ヒント + 付加情報セット）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub label: String,
    #[serde(default)]
    pub language: LanguageHint,
    #[serde(default = "default_features")]
    pub features: FeatureSet,
}

fn default_features() -> FeatureSet {
    FeatureSet::Plain
}

impl Strategy {
    pub fn new(label: impl Into<String>, language: LanguageHint, features: FeatureSet) -> Self {
        Self {
            label: label.into(),
            language,
            features,
        }
    }
}

/// 話者ターン
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub speaker: String,
    pub text: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// トピック区間
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicSpan {
    pub headline: String,
    #[serde(default)]
    pub gist: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// 重要箇所（スコア付き）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SalientSpan {
    pub text: String,
    pub importance: f64,
}

/// 感情の集計
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentTally {
    pub positive: u32,
    pub neutral: u32,
    pub negative: u32,
}

impl SentimentTally {
    pub fn total(&self) -> u32 {
        self.positive + self.neutral + self.negative
    }
}

/// 認識エンジンが本文と一緒に返す付加情報
///
/// すべてのフィールドは任意。欠けていてもパイプラインは失敗しない。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speakers: Vec<SpeakerTurn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<TopicSpan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<SalientSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<SentimentTally>,
    /// 種類別の固有表現（種類 → 出現順の重複なしリスト）
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entities: BTreeMap<String, Vec<String>>,
    /// エンジン組み込みの要約
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_summary: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
            && self.topics.is_empty()
            && self.highlights.is_empty()
            && self.sentiment.map_or(true, |s| s.total() == 0)
            && self.entities.is_empty()
            && self
                .engine_summary
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
    }

    /// 固有表現を重複なしで追加
    pub fn add_entity(&mut self, kind: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let folded = text.to_lowercase();
        let list = self.entities.entry(kind.to_string()).or_default();
        if !list.iter().any(|t| t.to_lowercase() == folded) {
            list.push(text.to_string());
        }
    }

    /// 話者数（重複なし）
    pub fn speaker_count(&self) -> usize {
        let mut speakers: Vec<&str> = self.speakers.iter().map(|s| s.speaker.as_str()).collect();
        speakers.sort_unstable();
        speakers.dedup();
        speakers.len()
    }
}

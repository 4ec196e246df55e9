use regex_lite::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// 失敗したストラテジー1件分の記録
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct StrategyAttempt {
    pub label: String,
    pub reason: String,
}

/// パイプライン全体のエラー
///
/// チャンク単位の失敗（タイムアウト・エンジンエラー）はここには現れない。
/// それらは文字起こし中のプレースホルダとして吸収される。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("入力ファイルが空です")]
    EmptyInput,

    #[error("入力ファイルが大きすぎます: {size} バイト (上限 {limit} バイト)")]
    InputTooLarge { size: usize, limit: usize },

    #[error("音声のデコードに失敗: {0}")]
    Decode(String),

    #[error("すべての認識ストラテジーが失敗しました: {}", format_attempts(.attempts))]
    AllStrategiesExhausted { attempts: Vec<StrategyAttempt> },

    #[error("音声を認識できませんでした")]
    NoSpeechRecognized,

    #[error("処理時間の上限を超えました ({0:?})")]
    ProcessingTimeExceeded(Duration),

    #[error("処理がキャンセルされました")]
    Cancelled,

    #[error("一時ファイルの操作に失敗: {0}")]
    Artifact(#[from] std::io::Error),
}

impl PipelineError {
    /// 入力側の問題か（HTTPでいう4xx相当）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::EmptyInput
                | PipelineError::InputTooLarge { .. }
                | PipelineError::Decode(_)
                | PipelineError::NoSpeechRecognized
        )
    }

    /// HTTPステータス相当のコード
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::InputTooLarge { .. } => 413,
            PipelineError::EmptyInput
            | PipelineError::Decode(_)
            | PipelineError::NoSpeechRecognized => 400,
            PipelineError::ProcessingTimeExceeded(_) => 504,
            PipelineError::Cancelled => 499,
            PipelineError::AllStrategiesExhausted { .. } | PipelineError::Artifact(_) => 500,
        }
    }
}

fn format_attempts(attempts: &[StrategyAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("[{}] {}", a.label, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 認識・要約エンジンのアダプタが返すエラー
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("ネットワークエラー: {0}")]
    Network(#[from] reqwest::Error),

    #[error("APIエラー: {0}")]
    Api(String),

    #[error("不正なレスポンス: {0}")]
    InvalidResponse(String),

    #[error("APIキーが設定されていません: {0}")]
    MissingCredential(String),

    #[error("タイムアウト ({0:?})")]
    Timeout(Duration),

    #[error("音声ファイルエラー: {0}")]
    Audio(String),
}

/// 診断メッセージの最大文字数（トランスクリプト内のプレースホルダ用）
pub const PLACEHOLDER_DIAGNOSTIC_CHARS: usize = 50;

/// 診断メッセージの最大文字数（呼び出し元に返す集約エラー用）
pub const REPORT_DIAGNOSTIC_CHARS: usize = 200;

fn secret_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(bearer\s+[A-Za-z0-9._\-]+|sk-[A-Za-z0-9_\-]{8,}|(api[_-]?key|authorization)[=:]\s*[A-Za-z0-9._\-]+)",
            )
            .ok()
        })
        .as_ref()
}

/// エンジンのエラーテキストを呼び出し元に見せられる形に整える
///
/// 認証情報らしき部分を伏せ、改行を潰し、`max_chars` 文字で切り詰める。
pub fn diagnostic(raw: &str, max_chars: usize) -> String {
    let redacted = match secret_pattern() {
        Some(pattern) => pattern.replace_all(raw, "[redacted]").into_owned(),
        None => raw.to_string(),
    };
    let flattened = redacted.split_whitespace().collect::<Vec<_>>().join(" ");

    if flattened.chars().count() <= max_chars {
        flattened
    } else {
        let truncated: String = flattened.chars().take(max_chars).collect();
        format!("{}...", truncated.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_truncation() {
        let raw = "x".repeat(120);
        let result = diagnostic(&raw, 50);
        assert_eq!(result.chars().count(), 53);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_diagnostic_short_message_untouched() {
        assert_eq!(diagnostic("connection reset", 50), "connection reset");
    }

    #[test]
    fn test_diagnostic_multibyte_safe() {
        let raw = "ошибка ".repeat(20);
        let result = diagnostic(&raw, 10);
        assert!(result.starts_with("ошибка"));
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_diagnostic_redacts_credentials() {
        let raw = "401 Unauthorized: Bearer abc.def-123 rejected, key sk-ABCDEFGH12345678";
        let result = diagnostic(raw, 200);
        assert!(!result.contains("abc.def-123"));
        assert!(!result.contains("sk-ABCDEFGH12345678"));
        assert!(result.contains("[redacted]"));
    }

    #[test]
    fn test_diagnostic_flattens_whitespace() {
        assert_eq!(diagnostic("line one\n\n  line two", 50), "line one line two");
    }

    #[test]
    fn test_error_classification() {
        assert!(PipelineError::EmptyInput.is_client_error());
        assert!(PipelineError::Decode("bad".into()).is_client_error());
        assert_eq!(PipelineError::EmptyInput.status_code(), 400);
        assert_eq!(
            PipelineError::InputTooLarge { size: 2, limit: 1 }.status_code(),
            413
        );

        let exhausted = PipelineError::AllStrategiesExhausted {
            attempts: vec![
                StrategyAttempt {
                    label: "ru".into(),
                    reason: "timeout".into(),
                },
                StrategyAttempt {
                    label: "auto".into(),
                    reason: "empty transcript".into(),
                },
            ],
        };
        assert!(!exhausted.is_client_error());
        assert_eq!(exhausted.status_code(), 500);
        let message = exhausted.to_string();
        assert!(message.contains("[ru] timeout"));
        assert!(message.contains("[auto] empty transcript"));

        assert_eq!(
            PipelineError::ProcessingTimeExceeded(Duration::from_secs(1)).status_code(),
            504
        );
    }
}

use crate::config::SummaryConfig;
use crate::error::EngineError;
use crate::types::{Enrichment, FeatureSet};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// 要約エンジン（LLMのテキスト補完）の共通トレイト
#[async_trait]
pub trait SummarizationEngine: Send + Sync {
    /// システムプロンプトとユーザーメッセージから補完テキストを得る
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, EngineError>;

    fn name(&self) -> &'static str;
}

/// 分析者としての振る舞い
pub const SYSTEM_PROMPT: &str = "You are a concise analyst. You summarize meeting and call \
recordings strictly from the material you are given and never invent facts.";

/// 要約サービスが使えず、付加情報もない場合の固定文
pub const SUMMARY_UNAVAILABLE: &str =
    "Summary unavailable: the summarization service did not respond and no structured analysis of the recording exists.";

/// プロンプトの種類（実際に付加情報が得られたかどうか）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptVariant {
    Enriched,
    Plain,
}

impl PromptVariant {
    /// 付加情報を要求し、かつ空でない付加情報が返った場合だけ `Enriched`
    pub fn for_recognition(
        features: Option<FeatureSet>,
        enrichment: Option<&Enrichment>,
    ) -> Self {
        let requested = features.is_some_and(FeatureSet::requests_enrichment);
        let delivered = enrichment.is_some_and(|e| !e.is_empty());
        if requested && delivered {
            PromptVariant::Enriched
        } else {
            PromptVariant::Plain
        }
    }
}

/// 要約の出どころ
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarySource {
    Engine,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    pub source: SummarySource,
}

/// トランスクリプトと付加情報から要約を作る
///
/// 要約エンジンは1リクエストにつき1回だけ呼ぶ。失敗・タイムアウト・
/// エンジン未設定・空の応答はいずれもテンプレートによる要約に落ちる。
pub struct SummaryBuilder {
    engine: Option<Arc<dyn SummarizationEngine>>,
    char_budget: usize,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    output_language: String,
}

impl SummaryBuilder {
    pub fn new(engine: Option<Arc<dyn SummarizationEngine>>, config: &SummaryConfig) -> Self {
        Self {
            engine,
            char_budget: config.transcript_char_budget,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: config.timeout(),
            output_language: config.output_language.clone(),
        }
    }

    /// 要約エンジンに渡すユーザーメッセージを組み立てる
    ///
    /// トランスクリプトは `char_budget` 文字で打ち切る（後半は捨てる）。
    pub fn build_prompt(
        &self,
        transcript: &str,
        enrichment: Option<&Enrichment>,
        variant: PromptVariant,
    ) -> String {
        let mut prompt = String::new();

        let _ = writeln!(
            prompt,
            "Write a short factual synopsis (at most 220 characters) of the recording, \
then up to four bullet groups: Decisions, Actions, Agreements, Topics. \
Omit any group that would be empty. Do not add anything that is not in the material. \
Write in {}.",
            self.output_language
        );

        if variant == PromptVariant::Enriched {
            prompt.push_str(
                "The recognition service also produced a structured analysis; \
use it to ground the bullet groups.\n",
            );
        }

        if let Some(enrichment) = enrichment.filter(|e| !e.is_empty()) {
            prompt.push('\n');
            prompt.push_str(&render_enrichment(enrichment));
        }

        let truncated: String = transcript.chars().take(self.char_budget).collect();
        let _ = write!(prompt, "\nTranscript:\n{}", truncated);

        prompt
    }

    pub async fn summarize(
        &self,
        transcript: &str,
        enrichment: Option<&Enrichment>,
        variant: PromptVariant,
    ) -> Summary {
        let Some(engine) = &self.engine else {
            log::warn!("要約エンジン未設定: テンプレート要約を使用");
            return self.fallback(enrichment);
        };

        let prompt = self.build_prompt(transcript, enrichment, variant);
        log::info!(
            "要約開始: {} ({} 文字のプロンプト, {:?})",
            engine.name(),
            prompt.chars().count(),
            variant
        );

        let call = engine.complete(SYSTEM_PROMPT, &prompt, self.max_tokens, self.temperature);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                log::info!("要約完了: {} 文字", text.trim().chars().count());
                Summary {
                    text: text.trim().to_string(),
                    source: SummarySource::Engine,
                }
            }
            Ok(Ok(_)) => {
                log::warn!("要約エンジンが空の応答を返しました: テンプレート要約を使用");
                self.fallback(enrichment)
            }
            Ok(Err(e)) => {
                log::warn!("要約失敗: {}: テンプレート要約を使用", e);
                self.fallback(enrichment)
            }
            Err(_) => {
                log::warn!("要約タイムアウト ({:?}): テンプレート要約を使用", self.timeout);
                self.fallback(enrichment)
            }
        }
    }

    fn fallback(&self, enrichment: Option<&Enrichment>) -> Summary {
        Summary {
            text: fallback_summary(enrichment),
            source: SummarySource::Fallback,
        }
    }
}

/// 付加情報をラベル付きのセクションとして書き出す
fn render_enrichment(enrichment: &Enrichment) -> String {
    let mut out = String::new();

    if !enrichment.speakers.is_empty() {
        let _ = writeln!(out, "Speakers: {}", enrichment.speaker_count());
    }

    if !enrichment.topics.is_empty() {
        out.push_str("Topics:\n");
        for topic in &enrichment.topics {
            if topic.gist.is_empty() {
                let _ = writeln!(out, "- {}", topic.headline);
            } else {
                let _ = writeln!(out, "- {} ({})", topic.headline, topic.gist);
            }
        }
    }

    if !enrichment.highlights.is_empty() {
        out.push_str("Key phrases:\n");
        for span in &enrichment.highlights {
            let _ = writeln!(out, "- {}", span.text);
        }
    }

    if let Some(tally) = enrichment.sentiment.filter(|t| t.total() > 0) {
        let _ = writeln!(
            out,
            "Sentiment: positive {}, neutral {}, negative {}",
            tally.positive, tally.neutral, tally.negative
        );
    }

    if !enrichment.entities.is_empty() {
        out.push_str("Entities:\n");
        for (kind, values) in &enrichment.entities {
            let _ = writeln!(out, "- {}: {}", kind, values.join(", "));
        }
    }

    out
}

/// AIを使わない決定的な要約
///
/// エンジン自身の要約・トピック見出し・重要フレーズ・固有表現のうち
/// 存在するものを並べる。何もなければ [`SUMMARY_UNAVAILABLE`]。
pub fn fallback_summary(enrichment: Option<&Enrichment>) -> String {
    let Some(enrichment) = enrichment else {
        return SUMMARY_UNAVAILABLE.to_string();
    };

    let mut sections: Vec<String> = Vec::new();

    if let Some(text) = enrichment
        .engine_summary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        sections.push(text.to_string());
    }

    if !enrichment.topics.is_empty() {
        let lines: Vec<String> = enrichment
            .topics
            .iter()
            .map(|t| format!("- {}", t.headline))
            .collect();
        sections.push(format!("Topics:\n{}", lines.join("\n")));
    }

    if !enrichment.highlights.is_empty() {
        let lines: Vec<String> = enrichment
            .highlights
            .iter()
            .map(|h| format!("- {}", h.text))
            .collect();
        sections.push(format!("Key phrases:\n{}", lines.join("\n")));
    }

    if !enrichment.entities.is_empty() {
        let lines: Vec<String> = enrichment
            .entities
            .iter()
            .map(|(kind, values)| format!("- {}: {}", kind, values.join(", ")))
            .collect();
        sections.push(format!("Entities:\n{}", lines.join("\n")));
    }

    if sections.is_empty() {
        SUMMARY_UNAVAILABLE.to_string()
    } else {
        sections.join("\n\n")
    }
}


#[cfg(test)]
mod tests {
    use super::mock::FixedSummarizer;
    use super::*;
    use crate::types::{SalientSpan, SentimentTally, TopicSpan};

    fn builder(engine: Option<Arc<FixedSummarizer>>, budget: usize) -> SummaryBuilder {
        let mut builder = SummaryBuilder::new(
            engine.map(|e| e as Arc<dyn SummarizationEngine>),
            &SummaryConfig {
                transcript_char_budget: budget,
                output_language: "English".to_string(),
                ..SummaryConfig::default()
            },
        );
        builder.timeout = Duration::from_millis(200);
        builder
    }

    fn rich_enrichment() -> Enrichment {
        let mut enrichment = Enrichment {
            topics: vec![TopicSpan {
                headline: "Budget review".into(),
                gist: "budget".into(),
                start_secs: 0.0,
                end_secs: 30.0,
            }],
            highlights: vec![SalientSpan {
                text: "quarterly target".into(),
                importance: 0.9,
            }],
            sentiment: Some(SentimentTally {
                positive: 2,
                neutral: 5,
                negative: 1,
            }),
            ..Default::default()
        };
        enrichment.add_entity("organization", "Acme");
        enrichment
    }

    const FIVE_LINES: &str = "line one\nline two\nline three\nline four\nline five";

    #[tokio::test]
    async fn test_engine_failure_without_enrichment_yields_fixed_text() {
        let engine = Arc::new(FixedSummarizer::failing("503 service unavailable"));
        let summary = builder(Some(engine.clone()), 12000)
            .summarize(FIVE_LINES, None, PromptVariant::Plain)
            .await;

        assert_eq!(summary.text, SUMMARY_UNAVAILABLE);
        assert_eq!(summary.source, SummarySource::Fallback);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_engine_success() {
        let engine = Arc::new(FixedSummarizer::replying("  Synopsis.\n- Decisions: none  "));
        let summary = builder(Some(engine.clone()), 12000)
            .summarize(FIVE_LINES, None, PromptVariant::Plain)
            .await;

        assert_eq!(summary.text, "Synopsis.\n- Decisions: none");
        assert_eq!(summary.source, SummarySource::Engine);
        assert_eq!(engine.call_count(), 1);
        assert_eq!(*engine.temperatures.lock().unwrap(), vec![0.2]);
    }

    #[tokio::test]
    async fn test_empty_completion_falls_back_to_enrichment() {
        let engine = Arc::new(FixedSummarizer::replying("   "));
        let enrichment = rich_enrichment();
        let summary = builder(Some(engine), 12000)
            .summarize(FIVE_LINES, Some(&enrichment), PromptVariant::Enriched)
            .await;

        assert_eq!(summary.source, SummarySource::Fallback);
        assert!(summary.text.contains("Budget review"));
        assert!(summary.text.contains("quarterly target"));
        assert!(summary.text.contains("organization: Acme"));
    }

    #[tokio::test]
    async fn test_timeout_falls_back_without_retry() {
        let engine =
            Arc::new(FixedSummarizer::replying("late").with_delay(Duration::from_secs(30)));
        let summary = builder(Some(engine.clone()), 12000)
            .summarize(FIVE_LINES, None, PromptVariant::Plain)
            .await;

        assert_eq!(summary.source, SummarySource::Fallback);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_engine_falls_back() {
        let enrichment = Enrichment {
            engine_summary: Some("The team agreed on the plan.".into()),
            ..Default::default()
        };
        let summary = builder(None, 12000)
            .summarize(FIVE_LINES, Some(&enrichment), PromptVariant::Enriched)
            .await;

        assert_eq!(summary.text, "The team agreed on the plan.");
        assert_eq!(summary.source, SummarySource::Fallback);
    }

    #[tokio::test]
    async fn test_deterministic_across_runs() {
        let engine = Arc::new(FixedSummarizer::replying("same"));
        let builder = builder(Some(engine), 12000);
        let first = builder.summarize(FIVE_LINES, None, PromptVariant::Plain).await;
        let second = builder.summarize(FIVE_LINES, None, PromptVariant::Plain).await;
        assert_eq!(first, second);
    }

    #[test]
    fn test_prompt_truncates_transcript() {
        let transcript = "a".repeat(50) + &"b".repeat(50);
        let prompt = builder(None, 50).build_prompt(&transcript, None, PromptVariant::Plain);

        assert!(prompt.ends_with(&format!("Transcript:\n{}", "a".repeat(50))));
        assert!(!prompt.contains("ab"));
    }

    #[test]
    fn test_prompt_truncates_on_char_boundary() {
        let transcript = "привет мир";
        let prompt = builder(None, 6).build_prompt(transcript, None, PromptVariant::Plain);
        assert!(prompt.ends_with("привет"));
    }

    #[test]
    fn test_prompt_contains_enrichment_sections() {
        let enrichment = rich_enrichment();
        let prompt =
            builder(None, 12000).build_prompt(FIVE_LINES, Some(&enrichment), PromptVariant::Enriched);

        assert!(prompt.contains("Decisions, Actions, Agreements, Topics"));
        assert!(prompt.contains("structured analysis"));
        assert!(prompt.contains("Topics:\n- Budget review (budget)"));
        assert!(prompt.contains("Key phrases:\n- quarterly target"));
        assert!(prompt.contains("Sentiment: positive 2, neutral 5, negative 1"));
        assert!(prompt.contains("Entities:\n- organization: Acme"));
        assert!(prompt.ends_with(FIVE_LINES));
    }

    #[test]
    fn test_plain_prompt_has_no_enrichment_note() {
        let prompt = builder(None, 12000).build_prompt(FIVE_LINES, None, PromptVariant::Plain);
        assert!(!prompt.contains("structured analysis"));
        assert!(prompt.contains("Write in English."));
    }

    #[test]
    fn test_prompt_variant_follows_delivered_enrichment() {
        let mut enrichment = Enrichment::default();
        enrichment.add_entity("organization", "Acme");

        assert_eq!(
            PromptVariant::for_recognition(Some(FeatureSet::Full), Some(&enrichment)),
            PromptVariant::Enriched
        );
        // 要求したが何も返らなかった
        assert_eq!(
            PromptVariant::for_recognition(Some(FeatureSet::Full), None),
            PromptVariant::Plain
        );
        assert_eq!(
            PromptVariant::for_recognition(Some(FeatureSet::Full), Some(&Enrichment::default())),
            PromptVariant::Plain
        );
        assert_eq!(
            PromptVariant::for_recognition(Some(FeatureSet::Plain), Some(&enrichment)),
            PromptVariant::Plain
        );
        assert_eq!(PromptVariant::for_recognition(None, None), PromptVariant::Plain);
    }

    #[test]
    fn test_fallback_with_empty_enrichment_is_fixed_text() {
        assert_eq!(fallback_summary(Some(&Enrichment::default())), SUMMARY_UNAVAILABLE);
        assert_eq!(fallback_summary(None), SUMMARY_UNAVAILABLE);
    }
}

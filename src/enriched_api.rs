use crate::config::EnrichedConfig;
use crate::error::EngineError;
use crate::transcribe_backend::{RecognitionOutcome, StrategyEngine};
use crate::types::{
    CanonicalWaveform, Enrichment, FeatureSet, SalientSpan, SentimentTally, SpeakerTurn, Strategy,
    TopicSpan,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// アップロード → ジョブ投入 → ポーリング の REST 認識サービス（AssemblyAI 形式）
///
/// ストラテジーの [`FeatureSet`] に応じて話者分離・チャプター・ハイライト・
/// 感情分析・固有表現を要求し、結果を [`Enrichment`] に変換する。
/// ポーリングは呼び出し側のタイムアウトで打ち切られる。
pub struct EnrichedApiEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Debug, Default, PartialEq, Serialize)]
struct TranscriptRequest {
    audio_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_code: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    language_detection: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    speaker_labels: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    auto_chapters: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    auto_highlights: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    sentiment_analysis: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    entity_detection: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptResponse {
    id: String,
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    utterances: Option<Vec<Utterance>>,
    #[serde(default)]
    chapters: Option<Vec<Chapter>>,
    #[serde(default)]
    auto_highlights_result: Option<HighlightsResult>,
    #[serde(default)]
    sentiment_analysis_results: Option<Vec<SentimentResult>>,
    #[serde(default)]
    entities: Option<Vec<Entity>>,
}

/// 時刻はすべてミリ秒
#[derive(Debug, Deserialize)]
struct Utterance {
    speaker: String,
    text: String,
    start: u64,
    end: u64,
}

#[derive(Debug, Deserialize)]
struct Chapter {
    headline: String,
    #[serde(default)]
    gist: String,
    start: u64,
    end: u64,
}

#[derive(Debug, Deserialize)]
struct HighlightsResult {
    #[serde(default)]
    results: Vec<Highlight>,
}

#[derive(Debug, Deserialize)]
struct Highlight {
    text: String,
    #[serde(default)]
    rank: f64,
}

#[derive(Debug, Deserialize)]
struct SentimentResult {
    sentiment: String,
}

#[derive(Debug, Deserialize)]
struct Entity {
    entity_type: String,
    text: String,
}

impl EnrichedApiEngine {
    pub fn from_config(config: &EnrichedConfig) -> Result<Self, EngineError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| EngineError::MissingCredential(config.api_key_env.clone()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        })
    }

    async fn upload(&self, waveform: &CanonicalWaveform) -> Result<String, EngineError> {
        let data = tokio::fs::read(&waveform.path)
            .await
            .map_err(|e| EngineError::Audio(format!("{}: {}", waveform.path.display(), e)))?;
        log::debug!("認識サービスへアップロード: {} バイト", data.len());

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .header("authorization", &self.api_key)
            .body(data)
            .send()
            .await?;
        let upload: UploadResponse = read_json(response).await?;
        Ok(upload.upload_url)
    }

    async fn submit(&self, request: &TranscriptRequest) -> Result<TranscriptResponse, EngineError> {
        let response = self
            .client
            .post(format!("{}/transcript", self.base_url))
            .header("authorization", &self.api_key)
            .json(request)
            .send()
            .await?;
        read_json(response).await
    }

    async fn fetch(&self, id: &str) -> Result<TranscriptResponse, EngineError> {
        let response = self
            .client
            .get(format!("{}/transcript/{}", self.base_url, id))
            .header("authorization", &self.api_key)
            .send()
            .await?;
        read_json(response).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, EngineError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(EngineError::Api(format!("{} - {}", status, body)));
    }
    serde_json::from_str(&body)
        .map_err(|e| EngineError::InvalidResponse(format!("JSONパース失敗: {}", e)))
}

/// ストラテジーからジョブのパラメータを作る
fn build_request(audio_url: String, strategy: &Strategy) -> TranscriptRequest {
    let full = strategy.features == FeatureSet::Full;
    let language_code = strategy.language.code().map(str::to_string);

    TranscriptRequest {
        audio_url,
        language_detection: language_code.is_none(),
        language_code,
        speaker_labels: strategy.features.requests_enrichment(),
        auto_chapters: full,
        auto_highlights: full,
        sentiment_analysis: full,
        entity_detection: full,
    }
}

fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// サービスのレスポンスを付加情報に変換（欠けたフィールドは空のまま）
fn map_enrichment(response: &TranscriptResponse) -> Enrichment {
    let mut enrichment = Enrichment::default();

    if let Some(utterances) = &response.utterances {
        enrichment.speakers = utterances
            .iter()
            .map(|u| SpeakerTurn {
                speaker: u.speaker.clone(),
                text: u.text.clone(),
                start_secs: ms_to_secs(u.start),
                end_secs: ms_to_secs(u.end),
            })
            .collect();
    }

    if let Some(chapters) = &response.chapters {
        enrichment.topics = chapters
            .iter()
            .map(|c| TopicSpan {
                headline: c.headline.clone(),
                gist: c.gist.clone(),
                start_secs: ms_to_secs(c.start),
                end_secs: ms_to_secs(c.end),
            })
            .collect();
    }

    if let Some(highlights) = &response.auto_highlights_result {
        let mut spans: Vec<SalientSpan> = highlights
            .results
            .iter()
            .map(|h| SalientSpan {
                text: h.text.clone(),
                importance: h.rank,
            })
            .collect();
        spans.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        enrichment.highlights = spans;
    }

    if let Some(results) = &response.sentiment_analysis_results {
        let mut tally = SentimentTally::default();
        for result in results {
            match result.sentiment.to_ascii_uppercase().as_str() {
                "POSITIVE" => tally.positive += 1,
                "NEGATIVE" => tally.negative += 1,
                _ => tally.neutral += 1,
            }
        }
        if tally.total() > 0 {
            enrichment.sentiment = Some(tally);
        }
    }

    if let Some(entities) = &response.entities {
        for entity in entities {
            enrichment.add_entity(&entity.entity_type, &entity.text);
        }
    }

    enrichment.engine_summary = response
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    enrichment
}

/// 終了状態のレスポンスを結果に変換。処理中なら `None`
fn into_outcome(response: &TranscriptResponse) -> Option<RecognitionOutcome> {
    match response.status.as_str() {
        "completed" => {
            let text = response.text.clone().unwrap_or_default();
            let enrichment = map_enrichment(response);
            let enrichment = (!enrichment.is_empty()).then_some(enrichment);
            Some(RecognitionOutcome::completed(text, enrichment))
        }
        "error" => Some(RecognitionOutcome::failed(
            response
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        )),
        _ => None,
    }
}

#[async_trait]
impl StrategyEngine for EnrichedApiEngine {
    async fn recognize_with(
        &self,
        waveform: &CanonicalWaveform,
        strategy: &Strategy,
    ) -> Result<RecognitionOutcome, EngineError> {
        let audio_url = self.upload(waveform).await?;
        let request = build_request(audio_url, strategy);

        let mut job = self.submit(&request).await?;
        log::info!("認識ジョブ投入: {} ({})", job.id, strategy.label);

        loop {
            if let Some(outcome) = into_outcome(&job) {
                log::info!("認識ジョブ終了: {} ({})", job.id, job.status);
                return Ok(outcome);
            }
            log::debug!("認識ジョブ待機中: {} ({})", job.id, job.status);
            tokio::time::sleep(self.poll_interval).await;
            job = self.fetch(&job.id).await?;
        }
    }

    fn name(&self) -> &'static str {
        "enriched-api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe_backend::RecognitionStatus;
    use crate::types::LanguageHint;

    fn response(json: &str) -> TranscriptResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_full_request_with_fixed_language() {
        let strategy = Strategy::new("s", LanguageHint::Fixed("ru".into()), FeatureSet::Full);
        let request = build_request("https://cdn/audio".into(), &strategy);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["audio_url"], "https://cdn/audio");
        assert_eq!(json["language_code"], "ru");
        assert!(json.get("language_detection").is_none());
        for key in [
            "speaker_labels",
            "auto_chapters",
            "auto_highlights",
            "sentiment_analysis",
            "entity_detection",
        ] {
            assert_eq!(json[key], true, "{}", key);
        }
    }

    #[test]
    fn test_minimal_request_with_auto_language() {
        let strategy = Strategy::new("s", LanguageHint::Auto, FeatureSet::Minimal);
        let request = build_request("u".into(), &strategy);

        assert_eq!(
            request,
            TranscriptRequest {
                audio_url: "u".into(),
                language_detection: true,
                speaker_labels: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_plain_request_has_no_features() {
        let strategy = Strategy::new("s", LanguageHint::Auto, FeatureSet::Plain);
        let json = serde_json::to_value(build_request("u".into(), &strategy)).unwrap();
        assert!(json.get("speaker_labels").is_none());
        assert!(json.get("auto_chapters").is_none());
    }

    #[test]
    fn test_pending_status_is_not_terminal() {
        assert!(into_outcome(&response(r#"{"id":"1","status":"queued"}"#)).is_none());
        assert!(into_outcome(&response(r#"{"id":"1","status":"processing"}"#)).is_none());
    }

    #[test]
    fn test_error_status_is_terminal_failure() {
        let outcome =
            into_outcome(&response(r#"{"id":"1","status":"error","error":"bad audio"}"#)).unwrap();
        assert_eq!(outcome.status, RecognitionStatus::Failed("bad audio".into()));
        assert!(outcome.text.is_empty());
    }

    #[test]
    fn test_completed_maps_enrichment() {
        let json = r#"{
            "id": "abc",
            "status": "completed",
            "text": "Hello there. We agreed.",
            "utterances": [
                {"speaker": "A", "text": "Hello there.", "start": 0, "end": 1500},
                {"speaker": "B", "text": "We agreed.", "start": 1500, "end": 3000}
            ],
            "chapters": [
                {"headline": "Greeting and agreement", "gist": "agreement", "summary": "...", "start": 0, "end": 3000}
            ],
            "auto_highlights_result": {"status": "success", "results": [
                {"text": "agreed", "rank": 0.4, "count": 1},
                {"text": "hello there", "rank": 0.8, "count": 1}
            ]},
            "sentiment_analysis_results": [
                {"text": "Hello there.", "sentiment": "POSITIVE"},
                {"text": "We agreed.", "sentiment": "NEUTRAL"}
            ],
            "entities": [
                {"entity_type": "person_name", "text": "Anna"},
                {"entity_type": "person_name", "text": "anna"},
                {"entity_type": "location", "text": "Moscow"}
            ]
        }"#;

        let outcome = into_outcome(&response(json)).unwrap();
        assert_eq!(outcome.status, RecognitionStatus::Completed);
        assert_eq!(outcome.text, "Hello there. We agreed.");

        let enrichment = outcome.enrichment.unwrap();
        assert_eq!(enrichment.speaker_count(), 2);
        assert_eq!(enrichment.speakers[1].start_secs, 1.5);
        assert_eq!(enrichment.topics[0].headline, "Greeting and agreement");
        assert_eq!(enrichment.topics[0].end_secs, 3.0);
        assert_eq!(enrichment.highlights[0].text, "hello there");
        assert_eq!(
            enrichment.sentiment,
            Some(SentimentTally {
                positive: 1,
                neutral: 1,
                negative: 0
            })
        );
        assert_eq!(enrichment.entities["person_name"], vec!["Anna".to_string()]);
        assert_eq!(enrichment.entities["location"], vec!["Moscow".to_string()]);
    }

    #[test]
    fn test_completed_without_enrichment() {
        let outcome =
            into_outcome(&response(r#"{"id":"1","status":"completed","text":"plain"}"#)).unwrap();
        assert_eq!(outcome.text, "plain");
        assert!(outcome.enrichment.is_none());
    }

    #[test]
    fn test_missing_credential() {
        let result = EnrichedApiEngine::from_config(&EnrichedConfig {
            api_key: None,
            api_key_env: "VOICE_SUMMARY_TEST_UNSET_KEY".to_string(),
            ..EnrichedConfig::default()
        });
        assert!(matches!(result, Err(EngineError::MissingCredential(_))));
    }
}

//! External AI collaborator contracts + OpenAI-backed clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use ror_core::{Issue, IssueType, Opportunity, RevenueSignalType, UrgencyLevel};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ror-providers";

pub const DEFAULT_SIGNAL_BATCH_SIZE: usize = 5;
pub const DEFAULT_SIGNAL_BATCH_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("OPENAI_API_KEY environment variable is missing")]
    MissingApiKey,
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Name/description/theme produced for one cluster. Defaults stand in when
/// the provider emits output we cannot use, so a bad summary never fails a
/// clustering run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub name: String,
    pub description: Option<String>,
    pub theme: Option<String>,
}

impl Default for ClusterSummary {
    fn default() -> Self {
        Self {
            name: "Unnamed Cluster".to_string(),
            description: None,
            theme: None,
        }
    }
}

/// Monetizable fact detected in one issue, before it is persisted with ids.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedSignal {
    pub signal_type: RevenueSignalType,
    pub confidence: f64,
    pub deal_size_arr: Option<f64>,
    pub customer_name: Option<String>,
    pub urgency: UrgencyLevel,
    pub extracted_entities: JsonMap<String, JsonValue>,
    pub pain_points: Vec<String>,
    pub competitive_context: Option<String>,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError>;
}

#[async_trait]
pub trait SummarizationProvider: Send + Sync {
    async fn summarize(&self, issues: &[Issue]) -> Result<ClusterSummary, ProviderError>;
}

#[async_trait]
pub trait SignalExtractionProvider: Send + Sync {
    async fn detect_signals(&self, issue: &Issue) -> Result<Vec<DetectedSignal>, ProviderError>;
}

#[async_trait]
pub trait StrategicActionProvider: Send + Sync {
    async fn suggest_actions(&self, draft: &Opportunity) -> Result<Vec<String>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl OpenAiConfig {
    /// Reads credentials and model selection from the environment. A missing
    /// key is a fatal configuration error raised here, before any pipeline
    /// work starts.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| ProviderError::MissingApiKey)?;
        Ok(Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            embedding_model: std::env::var("ROR_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            chat_model: std::env::var("ROR_CHAT_MODEL").unwrap_or_else(|_| "gpt-4".to_string()),
            timeout: Duration::from_secs(
                std::env::var("ROR_PROVIDER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            backoff: BackoffPolicy::default(),
        })
    }
}

/// One explicitly constructed client implements all four provider contracts.
/// Construct once per run or per process and inject where needed.
#[derive(Debug)]
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &JsonValue,
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<T>().await.map_err(ProviderError::Request);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProviderError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProviderError::Request(err));
                }
            }
        }

        Err(ProviderError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        temperature: f64,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.config.chat_model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
            "temperature": temperature,
        });
        let response: ChatResponse = self.post_json("chat/completions", &body).await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                ProviderError::MalformedResponse("chat response contained no choices".to_string())
            })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": text,
        });
        let response: EmbeddingResponse = self.post_json("embeddings", &body).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .ok_or_else(|| {
                ProviderError::MalformedResponse(
                    "embedding response contained no vectors".to_string(),
                )
            })
    }
}

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are an expert at analyzing product issues and identifying patterns.";

#[async_trait]
impl SummarizationProvider for OpenAiClient {
    async fn summarize(&self, issues: &[Issue]) -> Result<ClusterSummary, ProviderError> {
        let issue_texts = issues
            .iter()
            .take(10)
            .enumerate()
            .map(|(i, issue)| {
                format!(
                    "{}. {}\n{}",
                    i + 1,
                    issue.title,
                    issue.description.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Analyze these related issues and provide:\n\
             1. A concise cluster name (max 5 words)\n\
             2. A brief description (1-2 sentences)\n\
             3. The recurring theme/pattern\n\n\
             Issues:\n{issue_texts}\n\n\
             Respond in JSON format:\n\
             {{\n  \"name\": \"...\",\n  \"description\": \"...\",\n  \"theme\": \"...\"\n}}"
        );

        let content = self.chat_json(SUMMARY_SYSTEM_PROMPT, &prompt, 0.3).await?;
        Ok(parse_summary_content(&content))
    }
}

const SIGNAL_SYSTEM_PROMPT: &str = "You are an expert at analyzing product issues for revenue \
                                    impact. Be precise and conservative in your assessments.";

#[async_trait]
impl SignalExtractionProvider for OpenAiClient {
    async fn detect_signals(&self, issue: &Issue) -> Result<Vec<DetectedSignal>, ProviderError> {
        let text = format!(
            "Title: {}\nDescription: {}\nLabels: {}\nPriority: {}\nStatus: {}",
            issue.title,
            issue.description.as_deref().unwrap_or("N/A"),
            issue.labels.join(", "),
            issue.priority.as_deref().unwrap_or("N/A"),
            issue.status.as_deref().unwrap_or("N/A"),
        );

        let prompt = format!(
            "Analyze this issue for revenue impact signals. Identify:\n\n\
             1. Signal Type: deal_blocker, churn_risk, feature_gap, automation_opportunity\n\
             2. Confidence: 0-1 score\n\
             3. Deal Size (ARR): Extract if mentioned\n\
             4. Customer Name: Extract if mentioned\n\
             5. Urgency: low, medium, high, critical\n\
             6. Entities: Extract key entities (features, pain points, competitors, etc.)\n\
             7. Customer Pain Points: Extract specific frustrations (max 3)\n\
             8. Competitive Context: Mention competitors if they appear to be winning/losing \
             ground here\n\n\
             Issue:\n{text}\n\n\
             Respond in JSON format:\n\
             {{\n  \"signals\": [\n    {{\n      \"signalType\": \"deal_blocker\",\n      \
             \"confidence\": 0.85,\n      \"dealSizeArr\": 50000,\n      \
             \"customerName\": \"Acme Corp\",\n      \"urgency\": \"high\",\n      \
             \"extractedEntities\": {{}},\n      \"painPoints\": [\"...\"],\n      \
             \"competitiveContext\": \"...\"\n    }}\n  ]\n}}\n\n\
             Return empty array if no revenue signals detected."
        );

        let content = self.chat_json(SIGNAL_SYSTEM_PROMPT, &prompt, 0.2).await?;
        Ok(parse_signal_content(issue.id, &content))
    }
}

const ACTION_SYSTEM_PROMPT: &str = "You are a world-class strategic revenue consultant. Your \
                                    goal is to maximize ARR and minimize churn through precise \
                                    action items.";

#[async_trait]
impl StrategicActionProvider for OpenAiClient {
    async fn suggest_actions(&self, draft: &Opportunity) -> Result<Vec<String>, ProviderError> {
        let prompt = format!(
            "As a Strategic Revenue Advisor, analyze this identified revenue opportunity and \
             provide 3-4 highly actionable, specific, and strategic next steps.\n\n\
             Opportunity Details:\n\
             - Title: {}\n\
             - Description: {}\n\
             - Category: {}\n\
             - Revenue Impact (ARR): ${}\n\
             - RPS Score: {}\n\
             - Affected Customers: {}\n\n\
             Your recommendations should be:\n\
             1. Specific: Don't just say \"call customers\"; tell them what to say.\n\
             2. Strategic: Consider long-term revenue retention and expansion.\n\
             3. Relevant: Tailor the advice based on whether it's a bug fix, missing feature, \
             or automation gap.\n\n\
             Respond in JSON format:\n{{\n  \"actions\": [\"...\"]\n}}",
            draft.title,
            draft.description.as_deref().unwrap_or("N/A"),
            draft.category.as_str(),
            draft.revenue_impact_arr,
            draft.rps_score,
            if draft.affected_customers.is_empty() {
                "Various".to_string()
            } else {
                draft.affected_customers.join(", ")
            },
        );

        let content = self.chat_json(ACTION_SYSTEM_PROMPT, &prompt, 0.4).await?;
        let envelope: RawActionEnvelope = serde_json::from_str(&content).map_err(|err| {
            ProviderError::MalformedResponse(format!("action list was not valid JSON: {err}"))
        })?;
        Ok(envelope.actions)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSummary {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    theme: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawSignalEnvelope {
    #[serde(default)]
    signals: Vec<RawSignal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignal {
    #[serde(default)]
    signal_type: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    deal_size_arr: Option<f64>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    urgency: String,
    #[serde(default)]
    extracted_entities: JsonMap<String, JsonValue>,
    #[serde(default)]
    pain_points: Vec<String>,
    #[serde(default)]
    competitive_context: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawActionEnvelope {
    #[serde(default)]
    actions: Vec<String>,
}

fn none_if_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Malformed summary output degrades to the default summary rather than an
/// error; clustering must not fail because a model answered off-format.
fn parse_summary_content(content: &str) -> ClusterSummary {
    let raw: RawSummary = match serde_json::from_str(content) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "cluster summary was not valid JSON; using default summary");
            return ClusterSummary::default();
        }
    };
    ClusterSummary {
        name: none_if_empty(raw.name).unwrap_or_else(|| ClusterSummary::default().name),
        description: none_if_empty(raw.description),
        theme: none_if_empty(raw.theme),
    }
}

/// Signals with an unrecognized type are dropped with a warning; urgency is
/// parsed leniently and confidence clamped to the unit interval.
fn parse_signal_content(issue_id: Uuid, content: &str) -> Vec<DetectedSignal> {
    let envelope: RawSignalEnvelope = match serde_json::from_str(content) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(%issue_id, error = %err, "signal payload was not valid JSON; treating as no signals");
            return Vec::new();
        }
    };

    envelope
        .signals
        .into_iter()
        .filter_map(|raw| {
            let signal_type = match raw.signal_type.parse::<RevenueSignalType>() {
                Ok(signal_type) => signal_type,
                Err(err) => {
                    warn!(%issue_id, error = %err, "dropping signal with unknown type");
                    return None;
                }
            };
            Some(DetectedSignal {
                signal_type,
                confidence: raw.confidence.clamp(0.0, 1.0),
                deal_size_arr: raw.deal_size_arr,
                customer_name: raw.customer_name,
                urgency: UrgencyLevel::parse_lenient(&raw.urgency),
                extracted_entities: raw.extracted_entities,
                pain_points: raw.pain_points,
                competitive_context: raw.competitive_context,
            })
        })
        .collect()
}

/// Runs signal extraction over issues in fixed-size batches: full parallel
/// fan-out inside a batch, a cooldown between batches for provider rate
/// limits, and per-item failure isolation.
pub struct SignalExtractionBatcher {
    provider: Arc<dyn SignalExtractionProvider>,
    batch_size: usize,
    cooldown: Duration,
}

impl SignalExtractionBatcher {
    pub fn new(
        provider: Arc<dyn SignalExtractionProvider>,
        batch_size: usize,
        cooldown: Duration,
    ) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            cooldown,
        }
    }

    pub fn with_defaults(provider: Arc<dyn SignalExtractionProvider>) -> Self {
        Self::new(provider, DEFAULT_SIGNAL_BATCH_SIZE, DEFAULT_SIGNAL_BATCH_COOLDOWN)
    }

    /// Detects signals for every issue, in input order. A failing item
    /// yields an empty signal list and never cancels its siblings.
    pub async fn detect_all(&self, issues: &[Issue]) -> Vec<(Uuid, Vec<DetectedSignal>)> {
        let mut results = Vec::with_capacity(issues.len());
        let batches: Vec<&[Issue]> = issues.chunks(self.batch_size).collect();

        for (batch_index, batch) in batches.iter().enumerate() {
            let mut handles = Vec::with_capacity(batch.len());
            for issue in batch.iter() {
                let provider = Arc::clone(&self.provider);
                let issue = issue.clone();
                handles.push((
                    issue.id,
                    tokio::spawn(async move { provider.detect_signals(&issue).await }),
                ));
            }

            for (issue_id, handle) in handles {
                match handle.await {
                    Ok(Ok(signals)) => results.push((issue_id, signals)),
                    Ok(Err(err)) => {
                        warn!(%issue_id, error = %err, "signal extraction failed; skipping issue");
                        results.push((issue_id, Vec::new()));
                    }
                    Err(err) => {
                        warn!(%issue_id, error = %err, "signal extraction task aborted");
                        results.push((issue_id, Vec::new()));
                    }
                }
            }

            if batch_index + 1 < batches.len() {
                tokio::time::sleep(self.cooldown).await;
            }
        }

        results
    }
}

const CRITICAL_KEYWORDS: &[&str] = &[
    "urgent",
    "critical",
    "blocker",
    "asap",
    "immediately",
    "emergency",
];
const HIGH_KEYWORDS: &[&str] = &[
    "important",
    "high priority",
    "soon",
    "deal at risk",
    "losing customer",
];
const MEDIUM_KEYWORDS: &[&str] = &["needed", "requested", "would like", "planning"];

/// Keyword-tier urgency fallback for issues that never reach the extraction
/// provider.
pub fn classify_urgency(issue: &Issue) -> UrgencyLevel {
    let text = format!(
        "{} {}",
        issue.title,
        issue.description.as_deref().unwrap_or_default()
    )
    .to_ascii_lowercase();

    if CRITICAL_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return UrgencyLevel::Critical;
    }
    if HIGH_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return UrgencyLevel::High;
    }
    if MEDIUM_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return UrgencyLevel::Medium;
    }
    UrgencyLevel::Low
}

fn char_at_is_alphanumeric(s: &str, idx: usize) -> bool {
    s.chars().nth(idx).is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Scans free text for deal sizes of the shape `$50k`, `$1.5m`, `120k ARR`,
/// `2m ARR` and returns the value in ARR currency units. Bare numbers with no
/// magnitude suffix (issue ids, version numbers) never match.
pub fn extract_deal_size(text: &str) -> Option<f64> {
    let chars: Vec<char> = text.to_ascii_lowercase().chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let dollar_prefixed = chars[..i]
            .iter()
            .rev()
            .find(|c| **c != ' ')
            .is_some_and(|c| *c == '$');

        let mut raw = String::new();
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == ',' || chars[i] == '.') {
            if chars[i] != ',' {
                raw.push(chars[i]);
            }
            i += 1;
        }
        let Ok(value) = raw.trim_end_matches('.').parse::<f64>() else {
            continue;
        };

        let rest: String = chars[i..].iter().collect();
        let rest = rest.trim_start_matches(' ');
        let (multiplier, after_suffix) = if let Some(tail) = rest.strip_prefix("million") {
            (Some(1_000_000.0), tail)
        } else if let Some(tail) = rest.strip_prefix("thousand") {
            (Some(1_000.0), tail)
        } else if rest.starts_with('m') && !char_at_is_alphanumeric(rest, 1) {
            (Some(1_000_000.0), &rest[1..])
        } else if rest.starts_with('k') && !char_at_is_alphanumeric(rest, 1) {
            (Some(1_000.0), &rest[1..])
        } else {
            (None, rest)
        };
        let Some(multiplier) = multiplier else {
            continue;
        };

        let arr_context = after_suffix.trim_start().starts_with("arr");
        if dollar_prefixed || arr_context {
            return Some(value * multiplier);
        }
    }

    None
}

/// Hours spent on an issue: explicit `timeSpentHours` metadata when present,
/// else base hours by type scaled by priority.
pub fn estimate_time_spent(issue: &Issue) -> f64 {
    if let Some(hours) = issue
        .metadata
        .get("timeSpentHours")
        .and_then(JsonValue::as_f64)
    {
        return hours;
    }

    let base = match issue.issue_type {
        Some(IssueType::Bug) => 4.0,
        Some(IssueType::FeatureRequest) => 8.0,
        Some(IssueType::Support) => 2.0,
        Some(IssueType::Discussion) => 1.0,
        Some(IssueType::Other) | None => 2.0,
    };
    let multiplier = match issue
        .priority
        .as_deref()
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("critical") => 1.5,
        Some("high") => 1.2,
        Some("low") => 0.8,
        _ => 1.0,
    };
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ror_core::IssueSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mk_issue(title: &str, description: Option<&str>) -> Issue {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).single().unwrap();
        Issue {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            external_id: title.to_string(),
            source: IssueSource::Jira,
            issue_type: Some(IssueType::Bug),
            title: title.to_string(),
            description: description.map(ToString::to_string),
            status: None,
            priority: None,
            labels: Vec::new(),
            metadata: JsonMap::new(),
            created_at: now,
            updated_at: now,
            external_created_at: None,
            external_updated_at: None,
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        // from_env would read the ambient environment; assert on the shape of
        // the error type the constructor promises instead.
        let err = ProviderError::MissingApiKey;
        assert_eq!(err.to_string(), "OPENAI_API_KEY environment variable is missing");
    }

    #[test]
    fn summary_parsing_uses_defaults_on_malformed_output() {
        let summary = parse_summary_content("this is not json");
        assert_eq!(summary, ClusterSummary::default());

        let summary = parse_summary_content(r#"{"description": "two sentences"}"#);
        assert_eq!(summary.name, "Unnamed Cluster");
        assert_eq!(summary.description.as_deref(), Some("two sentences"));
        assert_eq!(summary.theme, None);
    }

    #[test]
    fn summary_parsing_keeps_populated_fields() {
        let summary = parse_summary_content(
            r#"{"name": "Export failures", "description": "Large exports hang.", "theme": "reliability"}"#,
        );
        assert_eq!(summary.name, "Export failures");
        assert_eq!(summary.theme.as_deref(), Some("reliability"));
    }

    #[test]
    fn signal_parsing_drops_unknown_types_and_is_lenient_on_urgency() {
        let issue_id = Uuid::new_v4();
        let signals = parse_signal_content(
            issue_id,
            r#"{"signals": [
                {"signalType": "deal_blocker", "confidence": 1.4, "dealSizeArr": 50000,
                 "customerName": "Acme Corp", "urgency": "HIGH"},
                {"signalType": "sales_vibe", "confidence": 0.9, "urgency": "low"}
            ]}"#,
        );
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, RevenueSignalType::DealBlocker);
        assert_eq!(signals[0].confidence, 1.0);
        assert_eq!(signals[0].urgency, UrgencyLevel::High);
        assert_eq!(signals[0].deal_size_arr, Some(50_000.0));
    }

    #[test]
    fn signal_parsing_treats_malformed_payload_as_no_signals() {
        assert!(parse_signal_content(Uuid::new_v4(), "{{nope").is_empty());
        assert!(parse_signal_content(Uuid::new_v4(), r#"{"signals": []}"#).is_empty());
    }

    #[test]
    fn urgency_keywords_classify_by_tier() {
        assert_eq!(
            classify_urgency(&mk_issue("URGENT: login broken", None)),
            UrgencyLevel::Critical
        );
        assert_eq!(
            classify_urgency(&mk_issue("Deal at risk over SSO", None)),
            UrgencyLevel::High
        );
        assert_eq!(
            classify_urgency(&mk_issue("Bulk export requested", None)),
            UrgencyLevel::Medium
        );
        assert_eq!(
            classify_urgency(&mk_issue("Typo on settings page", None)),
            UrgencyLevel::Low
        );
    }

    #[test]
    fn deal_size_extraction_requires_a_magnitude_and_context() {
        assert_eq!(extract_deal_size("the $50k renewal is blocked"), Some(50_000.0));
        assert_eq!(extract_deal_size("worth $1.5m to us"), Some(1_500_000.0));
        assert_eq!(extract_deal_size("roughly 120k ARR at stake"), Some(120_000.0));
        assert_eq!(extract_deal_size("a 2m ARR account"), Some(2_000_000.0));
        assert_eq!(extract_deal_size("$2 million expansion"), Some(2_000_000.0));
        assert_eq!(extract_deal_size("see ticket #12345"), None);
        assert_eq!(extract_deal_size("since version 2.0"), None);
        assert_eq!(extract_deal_size("took 3m to load"), None);
    }

    #[test]
    fn time_estimates_prefer_metadata_then_type_and_priority() {
        let mut issue = mk_issue("slow dashboard", None);
        issue.metadata.insert("timeSpentHours".to_string(), serde_json::json!(12.5));
        assert_eq!(estimate_time_spent(&issue), 12.5);

        let mut issue = mk_issue("slow dashboard", None);
        issue.issue_type = Some(IssueType::FeatureRequest);
        issue.priority = Some("Critical".to_string());
        assert_eq!(estimate_time_spent(&issue), 12.0);

        let mut issue = mk_issue("question", None);
        issue.issue_type = None;
        issue.priority = None;
        assert_eq!(estimate_time_spent(&issue), 2.0);
    }

    struct FlakyExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SignalExtractionProvider for FlakyExtractor {
        async fn detect_signals(
            &self,
            issue: &Issue,
        ) -> Result<Vec<DetectedSignal>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if issue.title == "poison" {
                return Err(ProviderError::MalformedResponse("boom".to_string()));
            }
            Ok(vec![DetectedSignal {
                signal_type: RevenueSignalType::FeatureGap,
                confidence: 0.5,
                deal_size_arr: None,
                customer_name: None,
                urgency: UrgencyLevel::Medium,
                extracted_entities: JsonMap::new(),
                pain_points: Vec::new(),
                competitive_context: None,
            }])
        }
    }

    #[tokio::test]
    async fn batcher_isolates_failures_and_preserves_input_order() {
        let provider = Arc::new(FlakyExtractor {
            calls: AtomicUsize::new(0),
        });
        let batcher = SignalExtractionBatcher::new(
            Arc::clone(&provider) as Arc<dyn SignalExtractionProvider>,
            2,
            Duration::from_millis(1),
        );

        let issues = vec![
            mk_issue("a", None),
            mk_issue("poison", None),
            mk_issue("b", None),
        ];
        let results = batcher.detect_all(&issues).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, issues[0].id);
        assert_eq!(results[1].0, issues[1].id);
        assert_eq!(results[2].0, issues[2].id);
        assert_eq!(results[0].1.len(), 1);
        assert!(results[1].1.is_empty());
        assert_eq!(results[2].1.len(), 1);
    }
}

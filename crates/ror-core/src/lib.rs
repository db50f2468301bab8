//! Core domain model for ROR: issues, clusters, revenue signals, opportunities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ror-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    Jira,
    Slack,
}

impl IssueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jira => "jira",
            Self::Slack => "slack",
        }
    }
}

impl std::str::FromStr for IssueSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jira" => Ok(Self::Jira),
            "slack" => Ok(Self::Slack),
            other => Err(UnknownVariant::new("issue source", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    FeatureRequest,
    Support,
    Discussion,
    Other,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::FeatureRequest => "feature_request",
            Self::Support => "support",
            Self::Discussion => "discussion",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for IssueType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bug" => Ok(Self::Bug),
            "feature_request" => Ok(Self::FeatureRequest),
            "support" => Ok(Self::Support),
            "discussion" => Ok(Self::Discussion),
            "other" => Ok(Self::Other),
            other => Err(UnknownVariant::new("issue type", other)),
        }
    }
}

/// Urgency tiers ordered `low < medium < high < critical`; the derived `Ord`
/// is relied on when aggregating the maximum urgency across signals.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Case-insensitive parse that degrades unrecognized provider output to
    /// `Low` instead of failing, so one bad label never drops a signal.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Low,
        }
    }
}

impl std::str::FromStr for UrgencyLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownVariant::new("urgency level", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenueSignalType {
    DealBlocker,
    ChurnRisk,
    FeatureGap,
    AutomationOpportunity,
}

impl RevenueSignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DealBlocker => "deal_blocker",
            Self::ChurnRisk => "churn_risk",
            Self::FeatureGap => "feature_gap",
            Self::AutomationOpportunity => "automation_opportunity",
        }
    }
}

impl std::str::FromStr for RevenueSignalType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deal_blocker" => Ok(Self::DealBlocker),
            "churn_risk" => Ok(Self::ChurnRisk),
            "feature_gap" => Ok(Self::FeatureGap),
            "automation_opportunity" => Ok(Self::AutomationOpportunity),
            other => Err(UnknownVariant::new("revenue signal type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityCategory {
    MissingFeature,
    AutomationGap,
    BugFix,
    RoadmapMisalignment,
}

impl OpportunityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingFeature => "missing_feature",
            Self::AutomationGap => "automation_gap",
            Self::BugFix => "bug_fix",
            Self::RoadmapMisalignment => "roadmap_misalignment",
        }
    }
}

impl std::str::FromStr for OpportunityCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_feature" => Ok(Self::MissingFeature),
            "automation_gap" => Ok(Self::AutomationGap),
            "bug_fix" => Ok(Self::BugFix),
            "roadmap_misalignment" => Ok(Self::RoadmapMisalignment),
            other => Err(UnknownVariant::new("opportunity category", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Identified,
    InProgress,
    Completed,
    Dismissed,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identified => "identified",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Dismissed => "dismissed",
        }
    }
}

impl std::str::FromStr for OpportunityStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identified" => Ok(Self::Identified),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(UnknownVariant::new("opportunity status", other)),
        }
    }
}

/// Error for string forms that do not map to a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Ingested product/support record. Immutable once ingested except for
/// metadata enrichment; ingestion itself is owned by an external subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub integration_id: Uuid,
    /// Identifier in the upstream system; (integration_id, external_id) is
    /// the upsert natural key.
    pub external_id: String,
    pub source: IssueSource,
    #[serde(rename = "type")]
    pub issue_type: Option<IssueType>,
    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub labels: Vec<String>,
    pub metadata: JsonMap<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_updated_at: Option<DateTime<Utc>>,
}

impl Issue {
    /// Text representation submitted to the embedding provider: title,
    /// description, labels and type, skipping empty parts.
    pub fn embedding_text(&self) -> String {
        let mut parts: Vec<&str> = vec![self.title.as_str()];
        if let Some(description) = self.description.as_deref() {
            parts.push(description);
        }
        let labels = self.labels.join(" ");
        if !labels.is_empty() {
            parts.push(&labels);
        }
        if let Some(issue_type) = &self.issue_type {
            parts.push(issue_type.as_str());
        }
        parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Cached embedding vector for one issue. `content_hash` is the sha-256 of
/// the embedding text at generation time; a mismatch means the issue text
/// changed and the vector must be regenerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEmbedding {
    pub issue_id: Uuid,
    pub vector: Vec<f64>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Density cluster of semantically similar issues. Created once per
/// clustering run; a rerun creates fresh clusters rather than mutating these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub theme: Option<String>,
    pub issue_count: u32,
    pub estimated_effort_hours: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Membership row; issues classified as noise have no row at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub cluster_id: Uuid,
    pub issue_id: Uuid,
    /// Cosine similarity to the cluster centroid, clamped to [0, 1].
    pub similarity_to_centroid: f64,
}

/// One monetizable fact extracted from one issue. Signals are independent
/// observations and are never deduplicated across issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSignal {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub issue_id: Uuid,
    pub signal_type: RevenueSignalType,
    pub confidence: f64,
    pub deal_size_arr: Option<f64>,
    pub customer_name: Option<String>,
    pub urgency: UrgencyLevel,
    pub extracted_entities: JsonMap<String, JsonValue>,
    pub pain_points: Vec<String>,
    pub competitive_context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ranked, revenue-quantified outcome synthesized from one cluster's
/// aggregated signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub cluster_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub category: OpportunityCategory,
    pub rps_score: f64,
    pub revenue_impact_arr: f64,
    pub frequency_score: f64,
    pub urgency_score: f64,
    pub effort_hours: f64,
    pub effort_score: f64,
    pub status: OpportunityStatus,
    pub affected_customers: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate view over one organization's identified opportunities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub total_revenue_at_risk: f64,
    pub total_opportunities: u64,
    pub high_priority_opportunities: u64,
    pub avg_rps_score: f64,
    pub total_issues_analyzed: u64,
    pub total_clusters: u64,
    pub last_analysis_date: Option<DateTime<Utc>>,
}

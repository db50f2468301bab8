//! Analysis pipeline: similarity, density clustering, RPS scoring, opportunity synthesis.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use ror_core::{
    Cluster, ClusterMember, DashboardMetrics, Issue, IssueEmbedding, Opportunity,
    OpportunityCategory, OpportunityStatus, RevenueSignal, RevenueSignalType, UrgencyLevel,
};
use ror_providers::{
    estimate_time_spent, ClusterSummary, EmbeddingProvider, ProviderError,
    SignalExtractionBatcher, SignalExtractionProvider, StrategicActionProvider,
    SummarizationProvider,
};
use ror_store::{sha256_hex, OpportunityStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ror-analysis";

/// RPS threshold above which an opportunity counts as high priority in the
/// dashboard metrics.
pub const HIGH_PRIORITY_RPS: f64 = 70.0;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("zero-norm embedding vector; cosine similarity is undefined")]
    DegenerateVector,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("centroid of an empty embedding set is undefined")]
    EmptyEmbeddingSet,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Cosine similarity in [-1, 1]. Zero-norm vectors and length mismatches are
/// loud errors: a silent default here would corrupt every downstream score.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Result<f64, AnalysisError> {
    if a.len() != b.len() {
        return Err(AnalysisError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(AnalysisError::DegenerateVector);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub fn cosine_distance(a: &[f64], b: &[f64]) -> Result<f64, AnalysisError> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

/// Coordinate-wise mean of a non-empty embedding set.
pub fn centroid(vectors: &[&[f64]]) -> Result<Vec<f64>, AnalysisError> {
    let first = vectors.first().ok_or(AnalysisError::EmptyEmbeddingSet)?;
    let dimension = first.len();
    let mut center = vec![0.0; dimension];
    for vector in vectors {
        if vector.len() != dimension {
            return Err(AnalysisError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        for (acc, value) in center.iter_mut().zip(vector.iter()) {
            *acc += value;
        }
    }
    for acc in center.iter_mut() {
        *acc /= vectors.len() as f64;
    }
    Ok(center)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedPoint {
    pub issue_id: Uuid,
    pub vector: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct DbscanParams {
    pub eps: f64,
    pub min_points: usize,
}

impl Default for DbscanParams {
    fn default() -> Self {
        Self {
            eps: 0.3,
            min_points: 3,
        }
    }
}

/// DBSCAN over cosine distance. Returns clusters in discovery order, each as
/// its member issue ids in assignment order; noise points appear in no
/// cluster.
///
/// Membership is tracked by an index-based assignment vector, the single
/// source of truth for which cluster owns a point, so every point is
/// assigned at most once and membership checks are O(1). Neighborhoods
/// include the point itself, which counts toward `min_points`. Border points
/// join the first cluster whose expansion reaches them; with a fixed input
/// order the output is fully deterministic.
pub fn cluster_by_density(
    points: &[EmbeddedPoint],
    params: &DbscanParams,
) -> Result<Vec<Vec<Uuid>>, AnalysisError> {
    let n = points.len();
    let mut visited = vec![false; n];
    let mut assignment: Vec<Option<usize>> = vec![None; n];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    let region_query = |idx: usize| -> Result<Vec<usize>, AnalysisError> {
        let mut neighbors = Vec::new();
        for (other_idx, other) in points.iter().enumerate() {
            if cosine_distance(&points[idx].vector, &other.vector)? <= params.eps {
                neighbors.push(other_idx);
            }
        }
        Ok(neighbors)
    };

    for idx in 0..n {
        if visited[idx] {
            continue;
        }
        visited[idx] = true;
        let neighborhood = region_query(idx)?;
        if neighborhood.len() < params.min_points {
            // Noise for now; a later expansion may still absorb it as a
            // border point.
            continue;
        }

        let cluster_id = clusters.len();
        clusters.push(vec![idx]);
        assignment[idx] = Some(cluster_id);

        let mut queued = vec![false; n];
        queued[idx] = true;
        let mut frontier: VecDeque<usize> = VecDeque::new();
        for neighbor in neighborhood {
            if !queued[neighbor] {
                queued[neighbor] = true;
                frontier.push_back(neighbor);
            }
        }

        while let Some(point) = frontier.pop_front() {
            if !visited[point] {
                visited[point] = true;
                let neighbors = region_query(point)?;
                if neighbors.len() >= params.min_points {
                    for neighbor in neighbors {
                        if !queued[neighbor] {
                            queued[neighbor] = true;
                            frontier.push_back(neighbor);
                        }
                    }
                }
            }
            if assignment[point].is_none() {
                assignment[point] = Some(cluster_id);
                clusters[cluster_id].push(point);
            }
        }
    }

    Ok(clusters
        .into_iter()
        .map(|members| members.into_iter().map(|idx| points[idx].issue_id).collect())
        .collect())
}

/// Weights of the RPS composite. Tunable in one place; the formula itself
/// never changes.
#[derive(Debug, Clone, Copy)]
pub struct RpsWeights {
    pub revenue_impact: f64,
    pub frequency: f64,
    pub urgency: f64,
    pub effort: f64,
}

pub const RPS_WEIGHTS: RpsWeights = RpsWeights {
    revenue_impact: 0.40,
    frequency: 0.25,
    urgency: 0.20,
    effort: 0.15,
};

/// Linear in ARR, saturating at $100k.
pub fn revenue_score(revenue_impact_arr: f64) -> f64 {
    (revenue_impact_arr / 100_000.0 * 100.0).min(100.0)
}

/// Logarithmic damping of the raw occurrence count.
pub fn frequency_score(count: usize) -> f64 {
    ((count as f64 + 1.0).log10() * 50.0).min(100.0)
}

pub fn urgency_score(level: UrgencyLevel) -> f64 {
    match level {
        UrgencyLevel::Low => 25.0,
        UrgencyLevel::Medium => 50.0,
        UrgencyLevel::High => 75.0,
        UrgencyLevel::Critical => 100.0,
    }
}

/// Inverse linear in hours, zero at or beyond 160 hours (one engineer-month).
pub fn effort_score(effort_hours: f64) -> f64 {
    (100.0 - (effort_hours / 160.0) * 100.0).max(0.0)
}

#[derive(Debug, Clone, Copy)]
pub struct RpsInput {
    pub revenue_impact_arr: f64,
    pub frequency: usize,
    pub urgency: UrgencyLevel,
    pub effort_hours: f64,
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Revenue Potential Score in [0, 100], rounded to one decimal. Pure, so it
/// can be unit-tested and recomputed without re-running clustering.
pub fn calculate_rps(input: &RpsInput) -> f64 {
    let rps = revenue_score(input.revenue_impact_arr) * RPS_WEIGHTS.revenue_impact
        + frequency_score(input.frequency) * RPS_WEIGHTS.frequency
        + urgency_score(input.urgency) * RPS_WEIGHTS.urgency
        + effort_score(input.effort_hours) * RPS_WEIGHTS.effort;
    round_to_tenth(rps)
}

/// Cheaper recompute path: current revenue impact combined with the
/// sub-scores already stored on the opportunity. Frequency, urgency and
/// effort are intentionally not re-derived from raw signals.
pub fn recalculate_rps_from_scores(
    revenue_impact_arr: f64,
    frequency_score: f64,
    urgency_score: f64,
    effort_score: f64,
) -> f64 {
    let rps = revenue_score(revenue_impact_arr) * RPS_WEIGHTS.revenue_impact
        + frequency_score * RPS_WEIGHTS.frequency
        + urgency_score * RPS_WEIGHTS.urgency
        + effort_score * RPS_WEIGHTS.effort;
    round_to_tenth(rps)
}

/// First-match priority list, not independent rules: the highest-priority
/// signal type present wins even when several types occur together.
pub fn derive_category(signals: &[RevenueSignal]) -> OpportunityCategory {
    let has = |t: RevenueSignalType| signals.iter().any(|s| s.signal_type == t);
    if has(RevenueSignalType::DealBlocker) {
        return OpportunityCategory::MissingFeature;
    }
    if has(RevenueSignalType::ChurnRisk) {
        return OpportunityCategory::BugFix;
    }
    if has(RevenueSignalType::AutomationOpportunity) {
        return OpportunityCategory::AutomationGap;
    }
    if has(RevenueSignalType::FeatureGap) {
        return OpportunityCategory::RoadmapMisalignment;
    }
    OpportunityCategory::MissingFeature
}

/// Maximum urgency across signals; ties keep the first maximum encountered.
pub fn max_urgency(signals: &[RevenueSignal]) -> UrgencyLevel {
    let mut max = UrgencyLevel::Low;
    for signal in signals {
        if signal.urgency > max {
            max = signal.urgency;
        }
    }
    max
}

/// Non-null customer names across signals, deduplicated, first-seen order.
pub fn affected_customers(signals: &[RevenueSignal]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut customers = Vec::new();
    for name in signals.iter().filter_map(|s| s.customer_name.as_deref()) {
        if seen.insert(name.to_string()) {
            customers.push(name.to_string());
        }
    }
    customers
}

/// Per-issue effort estimate feeding the cluster aggregate: explicit
/// `timeEstimateHours` metadata wins, else the type/priority heuristic.
pub fn issue_effort_hours(issue: &Issue) -> f64 {
    issue
        .metadata
        .get("timeEstimateHours")
        .and_then(JsonValue::as_f64)
        .unwrap_or_else(|| estimate_time_spent(issue))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionRule {
    #[serde(default)]
    pub min_rps: Option<f64>,
    #[serde(default)]
    pub category: Option<OpportunityCategory>,
    #[serde(default)]
    pub min_affected_customers: Option<usize>,
    pub actions: Vec<String>,
}

impl ActionRule {
    fn matches(&self, opportunity: &Opportunity) -> bool {
        if let Some(min_rps) = self.min_rps {
            if opportunity.rps_score < min_rps {
                return false;
            }
        }
        if let Some(category) = self.category {
            if opportunity.category != category {
                return false;
            }
        }
        if let Some(min_customers) = self.min_affected_customers {
            if opportunity.affected_customers.len() < min_customers {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ActionRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<ActionRule>,
}

/// Deterministic recommended-action table. Rule application is additive
/// across matching rules, not mutually exclusive.
#[derive(Debug, Clone)]
pub struct ActionRuleSet {
    rules: Vec<ActionRule>,
}

impl ActionRuleSet {
    pub fn new(rules: Vec<ActionRule>) -> Self {
        Self { rules }
    }

    pub fn builtin() -> Self {
        fn rule(
            min_rps: Option<f64>,
            category: Option<OpportunityCategory>,
            min_affected_customers: Option<usize>,
            actions: &[&str],
        ) -> ActionRule {
            ActionRule {
                min_rps,
                category,
                min_affected_customers,
                actions: actions.iter().map(ToString::to_string).collect(),
            }
        }

        Self::new(vec![
            rule(
                Some(80.0),
                None,
                None,
                &[
                    "Escalate to executive team immediately",
                    "Schedule customer call within 48 hours",
                ],
            ),
            rule(
                None,
                Some(OpportunityCategory::MissingFeature),
                None,
                &[
                    "Add to product roadmap",
                    "Estimate engineering effort",
                    "Identify workaround for immediate relief",
                ],
            ),
            rule(
                None,
                Some(OpportunityCategory::BugFix),
                None,
                &[
                    "Create high-priority bug ticket",
                    "Assign to senior engineer",
                    "Provide daily status updates to customer",
                ],
            ),
            rule(
                None,
                Some(OpportunityCategory::AutomationGap),
                None,
                &[
                    "Evaluate automation tools",
                    "Create implementation plan",
                    "Calculate ROI for automation",
                ],
            ),
            rule(
                None,
                None,
                Some(5),
                &[
                    "Conduct customer survey",
                    "Host customer roundtable discussion",
                ],
            ),
        ])
    }

    pub fn from_yaml_file(path: &PathBuf) -> anyhow::Result<Self> {
        let file: ActionRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.rules))
    }

    pub fn actions_for(&self, opportunity: &Opportunity) -> Vec<String> {
        let mut actions = Vec::new();
        for rule in &self.rules {
            if rule.matches(opportunity) {
                actions.extend(rule.actions.iter().cloned());
            }
        }
        actions
    }
}

/// Two-variant action strategy behind a single policy: the strategic-action
/// provider for high-RPS opportunities, the rule table everywhere else and
/// whenever the provider fails or answers empty.
pub struct ActionPlanner {
    advisor: Option<Arc<dyn StrategicActionProvider>>,
    rules: ActionRuleSet,
    advisor_rps_threshold: f64,
}

impl ActionPlanner {
    pub fn new(
        advisor: Option<Arc<dyn StrategicActionProvider>>,
        rules: ActionRuleSet,
        advisor_rps_threshold: f64,
    ) -> Self {
        Self {
            advisor,
            rules,
            advisor_rps_threshold,
        }
    }

    pub async fn plan(&self, opportunity: &Opportunity) -> Vec<String> {
        if opportunity.rps_score >= self.advisor_rps_threshold {
            if let Some(advisor) = &self.advisor {
                match advisor.suggest_actions(opportunity).await {
                    Ok(actions) if !actions.is_empty() => return actions,
                    Ok(_) => {
                        warn!(
                            opportunity = %opportunity.id,
                            "strategic advisor returned no actions; using rule table"
                        );
                    }
                    Err(err) => {
                        warn!(
                            opportunity = %opportunity.id,
                            error = %err,
                            "strategic advisor failed; using rule table"
                        );
                    }
                }
            }
        }
        self.rules.actions_for(opportunity)
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub eps: f64,
    pub min_points: usize,
    pub signal_batch_size: usize,
    pub signal_batch_cooldown: Duration,
    pub advisor_rps_threshold: f64,
    pub scheduler_enabled: bool,
    pub analysis_cron: String,
    pub action_rules_path: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            eps: 0.3,
            min_points: 3,
            signal_batch_size: ror_providers::DEFAULT_SIGNAL_BATCH_SIZE,
            signal_batch_cooldown: ror_providers::DEFAULT_SIGNAL_BATCH_COOLDOWN,
            advisor_rps_threshold: 80.0,
            scheduler_enabled: false,
            analysis_cron: "0 0 6 * * *".to_string(),
            action_rules_path: None,
        }
    }
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            eps: std::env::var("ROR_CLUSTER_EPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.eps),
            min_points: std::env::var("ROR_CLUSTER_MIN_POINTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_points),
            signal_batch_size: std::env::var("ROR_SIGNAL_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.signal_batch_size),
            signal_batch_cooldown: std::env::var("ROR_SIGNAL_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.signal_batch_cooldown),
            advisor_rps_threshold: std::env::var("ROR_ADVISOR_RPS_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.advisor_rps_threshold),
            scheduler_enabled: std::env::var("ROR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            analysis_cron: std::env::var("ROR_ANALYSIS_CRON")
                .unwrap_or(defaults.analysis_cron),
            action_rules_path: std::env::var("ROR_ACTION_RULES").ok().map(PathBuf::from),
        }
    }
}

/// One cluster persisted by a clustering run, with its members in assignment
/// order.
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub cluster: Cluster,
    pub member_issue_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRunSummary {
    pub run_id: Uuid,
    pub organization_id: Uuid,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: chrono::DateTime<Utc>,
    pub issues_analyzed: usize,
    pub signals_detected: usize,
    pub clusters_created: usize,
    pub opportunities_created: usize,
}

/// Issue analysis pipeline with dependency-injected collaborators. Construct
/// once per run or per process; there is no hidden global client state.
pub struct AnalysisPipeline {
    store: Arc<dyn OpportunityStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    summarizer: Arc<dyn SummarizationProvider>,
    extraction: SignalExtractionBatcher,
    planner: ActionPlanner,
    config: AnalysisConfig,
}

impl AnalysisPipeline {
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn SummarizationProvider>,
        extractor: Arc<dyn SignalExtractionProvider>,
        advisor: Option<Arc<dyn StrategicActionProvider>>,
        config: AnalysisConfig,
    ) -> anyhow::Result<Self> {
        let rules = match &config.action_rules_path {
            Some(path) => ActionRuleSet::from_yaml_file(path)?,
            None => ActionRuleSet::builtin(),
        };
        let extraction = SignalExtractionBatcher::new(
            extractor,
            config.signal_batch_size,
            config.signal_batch_cooldown,
        );
        let planner = ActionPlanner::new(advisor, rules, config.advisor_rps_threshold);
        Ok(Self {
            store,
            embeddings,
            summarizer,
            extraction,
            planner,
            config,
        })
    }

    /// Embedding for one issue: the cached vector when the content hash still
    /// matches, a fresh provider call otherwise. Returns `None` when the
    /// provider fails for this issue (logged; the issue is excluded from the
    /// clustering run).
    async fn embedding_for(&self, issue: &Issue) -> Result<Option<Vec<f64>>, AnalysisError> {
        let text = issue.embedding_text();
        let content_hash = sha256_hex(text.as_bytes());

        if let Some(cached) = self.store.embedding_for_issue(issue.id).await? {
            if cached.content_hash == content_hash {
                return Ok(Some(cached.vector));
            }
        }

        match self.embeddings.embed(&text).await {
            Ok(vector) => {
                self.store
                    .put_embedding(&IssueEmbedding {
                        issue_id: issue.id,
                        vector: vector.clone(),
                        content_hash,
                        created_at: Utc::now(),
                    })
                    .await?;
                Ok(Some(vector))
            }
            Err(err) => {
                warn!(
                    issue_id = %issue.id,
                    error = %err,
                    "embedding failed; excluding issue from clustering"
                );
                Ok(None)
            }
        }
    }

    /// Clusters the organization's issues (optionally a subset) and persists
    /// the resulting clusters and memberships. Per-cluster persistence
    /// failures are logged and skipped; degenerate numeric input aborts the
    /// run.
    pub async fn cluster_issues(
        &self,
        organization_id: Uuid,
        issue_ids: Option<&[Uuid]>,
    ) -> Result<Vec<ClusterOutcome>, AnalysisError> {
        let issues = self.store.issues_for_org(organization_id, issue_ids).await?;
        if issues.is_empty() {
            return Ok(Vec::new());
        }

        let mut points: Vec<EmbeddedPoint> = Vec::with_capacity(issues.len());
        let mut expected_dimension: Option<usize> = None;
        for issue in &issues {
            let Some(vector) = self.embedding_for(issue).await? else {
                continue;
            };
            match expected_dimension {
                Some(expected) if vector.len() != expected => {
                    return Err(AnalysisError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                Some(_) => {}
                None => expected_dimension = Some(vector.len()),
            }
            points.push(EmbeddedPoint {
                issue_id: issue.id,
                vector,
            });
        }

        let params = DbscanParams {
            eps: self.config.eps,
            min_points: self.config.min_points,
        };
        let cluster_ids = cluster_by_density(&points, &params)?;

        let issues_by_id: HashMap<Uuid, &Issue> =
            issues.iter().map(|issue| (issue.id, issue)).collect();
        let vectors_by_id: HashMap<Uuid, &Vec<f64>> = points
            .iter()
            .map(|point| (point.issue_id, &point.vector))
            .collect();

        let mut outcomes = Vec::with_capacity(cluster_ids.len());
        for member_issue_ids in cluster_ids {
            let cluster_issues: Vec<Issue> = member_issue_ids
                .iter()
                .filter_map(|id| issues_by_id.get(id).map(|issue| (*issue).clone()))
                .collect();

            let summary = match self.summarizer.summarize(&cluster_issues).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(error = %err, "cluster summarization failed; using default summary");
                    ClusterSummary::default()
                }
            };

            let estimated_effort_hours: f64 =
                cluster_issues.iter().map(issue_effort_hours).sum();

            let now = Utc::now();
            let cluster = Cluster {
                id: Uuid::new_v4(),
                organization_id,
                name: summary.name,
                description: summary.description,
                theme: summary.theme,
                issue_count: member_issue_ids.len() as u32,
                estimated_effort_hours,
                created_at: now,
                updated_at: now,
            };

            if let Err(err) = self.store.insert_cluster(&cluster).await {
                warn!(cluster = %cluster.id, error = %err, "failed to persist cluster; skipping");
                continue;
            }

            let member_vectors: Vec<&[f64]> = member_issue_ids
                .iter()
                .filter_map(|id| vectors_by_id.get(id).map(|v| v.as_slice()))
                .collect();
            let center = centroid(&member_vectors)?;

            let mut members = Vec::with_capacity(member_issue_ids.len());
            for issue_id in &member_issue_ids {
                let Some(vector) = vectors_by_id.get(issue_id) else {
                    continue;
                };
                let similarity = cosine_similarity(vector, &center)?.clamp(0.0, 1.0);
                members.push(ClusterMember {
                    cluster_id: cluster.id,
                    issue_id: *issue_id,
                    similarity_to_centroid: similarity,
                });
            }
            if let Err(err) = self.store.insert_cluster_members(&members).await {
                warn!(cluster = %cluster.id, error = %err, "failed to persist cluster members; skipping");
                continue;
            }

            outcomes.push(ClusterOutcome {
                cluster,
                member_issue_ids,
            });
        }

        Ok(outcomes)
    }

    /// Detects revenue signals for the organization's issues through the
    /// batched extraction policy and persists them.
    pub async fn detect_signals(
        &self,
        organization_id: Uuid,
        issue_ids: Option<&[Uuid]>,
    ) -> Result<Vec<RevenueSignal>, AnalysisError> {
        let issues = self.store.issues_for_org(organization_id, issue_ids).await?;
        if issues.is_empty() {
            return Ok(Vec::new());
        }

        let detected = self.extraction.detect_all(&issues).await;
        let now = Utc::now();
        let signals: Vec<RevenueSignal> = detected
            .into_iter()
            .flat_map(|(issue_id, signals)| {
                signals.into_iter().map(move |signal| RevenueSignal {
                    id: Uuid::new_v4(),
                    organization_id,
                    issue_id,
                    signal_type: signal.signal_type,
                    confidence: signal.confidence,
                    deal_size_arr: signal.deal_size_arr,
                    customer_name: signal.customer_name,
                    urgency: signal.urgency,
                    extracted_entities: signal.extracted_entities,
                    pain_points: signal.pain_points,
                    competitive_context: signal.competitive_context,
                    created_at: now,
                })
            })
            .collect();

        if !signals.is_empty() {
            self.store.insert_signals(&signals).await?;
        }
        Ok(signals)
    }

    /// Synthesizes one opportunity per cluster that has signals. Clusters
    /// without members or without signals are skipped silently; a failed
    /// insert skips that opportunity and the loop continues.
    pub async fn generate_opportunities(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Opportunity>, AnalysisError> {
        let clusters = self.store.clusters_for_org(organization_id).await?;
        let mut opportunities = Vec::new();

        for cluster in clusters {
            let members = self.store.members_for_cluster(cluster.id).await?;
            if members.is_empty() {
                continue;
            }
            let issue_ids: Vec<Uuid> = members.iter().map(|m| m.issue_id).collect();
            let signals = self
                .store
                .signals_for_issues(organization_id, &issue_ids)
                .await?;
            if signals.is_empty() {
                continue;
            }

            let revenue_impact_arr: f64 = signals.iter().filter_map(|s| s.deal_size_arr).sum();
            let urgency = max_urgency(&signals);
            let f_score = frequency_score(cluster.issue_count as usize);
            let u_score = urgency_score(urgency);
            let e_score = effort_score(cluster.estimated_effort_hours);
            let rps = calculate_rps(&RpsInput {
                revenue_impact_arr,
                frequency: cluster.issue_count as usize,
                urgency,
                effort_hours: cluster.estimated_effort_hours,
            });

            let now = Utc::now();
            let mut opportunity = Opportunity {
                id: Uuid::new_v4(),
                organization_id,
                cluster_id: Some(cluster.id),
                title: cluster.name.clone(),
                description: cluster.description.clone(),
                category: derive_category(&signals),
                rps_score: rps,
                revenue_impact_arr,
                frequency_score: f_score,
                urgency_score: u_score,
                effort_hours: cluster.estimated_effort_hours,
                effort_score: e_score,
                status: OpportunityStatus::Identified,
                affected_customers: affected_customers(&signals),
                recommended_actions: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            opportunity.recommended_actions = self.planner.plan(&opportunity).await;

            if let Err(err) = self.store.insert_opportunity(&opportunity).await {
                warn!(
                    opportunity = %opportunity.id,
                    error = %err,
                    "failed to persist opportunity; skipping"
                );
                continue;
            }
            opportunities.push(opportunity);
        }

        Ok(opportunities)
    }

    /// Full run: signal extraction, clustering, then opportunity synthesis.
    pub async fn run_full(
        &self,
        organization_id: Uuid,
    ) -> Result<AnalysisRunSummary, AnalysisError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let issues = self.store.issues_for_org(organization_id, None).await?;
        let signals = self.detect_signals(organization_id, None).await?;
        let clusters = self.cluster_issues(organization_id, None).await?;
        let opportunities = self.generate_opportunities(organization_id).await?;

        Ok(AnalysisRunSummary {
            run_id,
            organization_id,
            started_at,
            finished_at: Utc::now(),
            issues_analyzed: issues.len(),
            signals_detected: signals.len(),
            clusters_created: clusters.len(),
            opportunities_created: opportunities.len(),
        })
    }

    /// Re-derives RPS for an existing opportunity from its stored sub-scores
    /// plus current revenue impact, updates the store, and returns the new
    /// score. Intentionally does not re-run synthesis.
    pub async fn recalculate_rps(&self, opportunity_id: Uuid) -> Result<f64, AnalysisError> {
        let opportunity = self.store.opportunity(opportunity_id).await?;
        let rps = recalculate_rps_from_scores(
            opportunity.revenue_impact_arr,
            opportunity.frequency_score,
            opportunity.urgency_score,
            opportunity.effort_score,
        );
        self.store.update_opportunity_rps(opportunity_id, rps).await?;
        Ok(rps)
    }

    /// Aggregates the dashboard metrics over identified opportunities.
    pub async fn dashboard_metrics(
        &self,
        organization_id: Uuid,
    ) -> Result<DashboardMetrics, AnalysisError> {
        let identified = self
            .store
            .opportunities_for_org(organization_id, Some(OpportunityStatus::Identified))
            .await?;

        let total_revenue_at_risk = identified.iter().map(|o| o.revenue_impact_arr).sum();
        let high_priority = identified
            .iter()
            .filter(|o| o.rps_score >= HIGH_PRIORITY_RPS)
            .count() as u64;
        let avg_rps_score = if identified.is_empty() {
            0.0
        } else {
            round_to_tenth(
                identified.iter().map(|o| o.rps_score).sum::<f64>() / identified.len() as f64,
            )
        };

        Ok(DashboardMetrics {
            total_revenue_at_risk,
            total_opportunities: identified.len() as u64,
            high_priority_opportunities: high_priority,
            avg_rps_score,
            total_issues_analyzed: self.store.count_issues(organization_id).await?,
            total_clusters: self.store.count_clusters(organization_id).await?,
            last_analysis_date: self.store.latest_cluster_created_at(organization_id).await?,
        })
    }

    /// Optional cron scaffold for periodic reanalysis. The job only logs;
    /// the embedding caller owns actually re-running the pipeline per
    /// organization.
    pub async fn maybe_build_scheduler(&self) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.analysis_cron.clone();
        let job = Job::new_async(cron.as_str(), |_uuid, _l| {
            Box::pin(async move {
                warn!("analysis schedule fired; automatic reruns are not wired yet");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

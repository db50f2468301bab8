//! End-to-end pipeline tests over the in-memory store and scripted providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ror_analysis::{AnalysisConfig, AnalysisPipeline};
use ror_core::{
    Issue, IssueEmbedding, IssueSource, Opportunity, OpportunityCategory, OpportunityStatus,
    RevenueSignalType, UrgencyLevel,
};
use ror_providers::{
    ClusterSummary, DetectedSignal, EmbeddingProvider, ProviderError, SignalExtractionProvider,
    StrategicActionProvider, SummarizationProvider,
};
use ror_store::{sha256_hex, MemoryStore, OpportunityStore};
use serde_json::Map as JsonMap;
use uuid::Uuid;

struct StaticEmbeddings {
    vectors: HashMap<String, Vec<f64>>,
    calls: AtomicUsize,
}

impl StaticEmbeddings {
    fn new(vectors: &[(&str, Vec<f64>)]) -> Self {
        Self {
            vectors: vectors
                .iter()
                .map(|(text, vector)| (text.to_string(), vector.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vectors.get(text).cloned().ok_or_else(|| {
            ProviderError::MalformedResponse(format!("no scripted vector for {text:?}"))
        })
    }
}

struct StaticSummarizer {
    name: String,
}

#[async_trait]
impl SummarizationProvider for StaticSummarizer {
    async fn summarize(&self, _issues: &[Issue]) -> Result<ClusterSummary, ProviderError> {
        Ok(ClusterSummary {
            name: self.name.clone(),
            description: Some("Recurring export failures on large datasets.".to_string()),
            theme: Some("reliability".to_string()),
        })
    }
}

struct ScriptedExtractor {
    signals: HashMap<String, Vec<DetectedSignal>>,
}

#[async_trait]
impl SignalExtractionProvider for ScriptedExtractor {
    async fn detect_signals(&self, issue: &Issue) -> Result<Vec<DetectedSignal>, ProviderError> {
        Ok(self.signals.get(&issue.title).cloned().unwrap_or_default())
    }
}

struct FailingAdvisor;

#[async_trait]
impl StrategicActionProvider for FailingAdvisor {
    async fn suggest_actions(&self, _draft: &Opportunity) -> Result<Vec<String>, ProviderError> {
        Err(ProviderError::MalformedResponse(
            "advisor offline".to_string(),
        ))
    }
}

struct ScriptedAdvisor {
    actions: Vec<String>,
}

#[async_trait]
impl StrategicActionProvider for ScriptedAdvisor {
    async fn suggest_actions(&self, _draft: &Opportunity) -> Result<Vec<String>, ProviderError> {
        Ok(self.actions.clone())
    }
}

fn signal(
    signal_type: RevenueSignalType,
    urgency: UrgencyLevel,
    deal_size_arr: Option<f64>,
    customer_name: Option<&str>,
) -> DetectedSignal {
    DetectedSignal {
        signal_type,
        confidence: 0.85,
        deal_size_arr,
        customer_name: customer_name.map(ToString::to_string),
        urgency,
        extracted_entities: JsonMap::new(),
        pain_points: Vec::new(),
        competitive_context: None,
    }
}

fn mk_issue(organization_id: Uuid, integration_id: Uuid, title: &str) -> Issue {
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).single().unwrap();
    Issue {
        id: Uuid::new_v4(),
        organization_id,
        integration_id,
        external_id: title.to_string(),
        source: IssueSource::Jira,
        issue_type: None,
        title: title.to_string(),
        description: None,
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

fn test_config() -> AnalysisConfig {
    AnalysisConfig {
        signal_batch_size: 2,
        signal_batch_cooldown: Duration::from_millis(1),
        ..AnalysisConfig::default()
    }
}

struct Scenario {
    store: Arc<MemoryStore>,
    embeddings: Arc<StaticEmbeddings>,
    organization_id: Uuid,
    issue_ids: Vec<Uuid>,
}

/// Three issues with identical embeddings plus one orthogonal noise issue.
async fn seed_export_cluster() -> Scenario {
    let store = Arc::new(MemoryStore::new());
    let organization_id = Uuid::new_v4();
    let integration_id = Uuid::new_v4();

    let titles = ["a", "b", "c", "noise"];
    let mut issue_ids = Vec::new();
    for title in titles {
        let issue = mk_issue(organization_id, integration_id, title);
        issue_ids.push(store.upsert_issue(&issue).await.unwrap());
    }

    let embeddings = Arc::new(StaticEmbeddings::new(&[
        ("a", vec![1.0, 0.0]),
        ("b", vec![1.0, 0.0]),
        ("c", vec![1.0, 0.0]),
        ("noise", vec![0.0, 1.0]),
    ]));

    Scenario {
        store,
        embeddings,
        organization_id,
        issue_ids,
    }
}

fn export_signals() -> ScriptedExtractor {
    let mut signals = HashMap::new();
    signals.insert(
        "a".to_string(),
        vec![signal(
            RevenueSignalType::DealBlocker,
            UrgencyLevel::Critical,
            Some(60_000.0),
            Some("Acme Corp"),
        )],
    );
    signals.insert(
        "b".to_string(),
        vec![
            signal(
                RevenueSignalType::ChurnRisk,
                UrgencyLevel::High,
                Some(50_000.0),
                Some("Acme Corp"),
            ),
            signal(
                RevenueSignalType::FeatureGap,
                UrgencyLevel::Medium,
                None,
                Some("Globex"),
            ),
        ],
    );
    ScriptedExtractor { signals }
}

fn pipeline(
    scenario: &Scenario,
    extractor: ScriptedExtractor,
    advisor: Option<Arc<dyn StrategicActionProvider>>,
) -> AnalysisPipeline {
    AnalysisPipeline::new(
        Arc::clone(&scenario.store) as Arc<dyn OpportunityStore>,
        Arc::clone(&scenario.embeddings) as Arc<dyn EmbeddingProvider>,
        Arc::new(StaticSummarizer {
            name: "Export failures".to_string(),
        }),
        Arc::new(extractor),
        advisor,
        test_config(),
    )
    .unwrap()
}

#[tokio::test]
async fn full_run_synthesizes_a_ranked_opportunity() {
    let scenario = seed_export_cluster().await;
    let pipeline = pipeline(&scenario, export_signals(), Some(Arc::new(FailingAdvisor)));

    let summary = pipeline.run_full(scenario.organization_id).await.unwrap();
    assert_eq!(summary.issues_analyzed, 4);
    assert_eq!(summary.signals_detected, 3);
    assert_eq!(summary.clusters_created, 1);
    assert_eq!(summary.opportunities_created, 1);

    let opportunities = scenario
        .store
        .opportunities_for_org(scenario.organization_id, None)
        .await
        .unwrap();
    assert_eq!(opportunities.len(), 1);
    let opportunity = &opportunities[0];

    // revenue 110k saturates at 100; frequency log10(4)*50; urgency critical;
    // effort 3 issues * 2h heuristic = 6h.
    assert_eq!(opportunity.rps_score, 82.0);
    assert_eq!(opportunity.revenue_impact_arr, 110_000.0);
    assert_eq!(opportunity.effort_hours, 6.0);
    assert_eq!(opportunity.category, OpportunityCategory::MissingFeature);
    assert_eq!(opportunity.status, OpportunityStatus::Identified);
    assert_eq!(opportunity.title, "Export failures");
    assert_eq!(opportunity.affected_customers, vec!["Acme Corp", "Globex"]);

    // Advisor failed, so the rule table applies: the RPS>=80 pair plus the
    // missing-feature trio.
    assert_eq!(opportunity.recommended_actions.len(), 5);
    assert!(opportunity
        .recommended_actions
        .contains(&"Escalate to executive team immediately".to_string()));
    assert!(opportunity
        .recommended_actions
        .contains(&"Add to product roadmap".to_string()));

    let members = scenario
        .store
        .members_for_cluster(opportunity.cluster_id.unwrap())
        .await
        .unwrap();
    assert_eq!(members.len(), 3);
    let noise_id = scenario.issue_ids[3];
    assert!(members.iter().all(|m| m.issue_id != noise_id));
    for member in &members {
        assert!(member.similarity_to_centroid > 0.999);
        assert!(member.similarity_to_centroid <= 1.0);
    }
}

#[tokio::test]
async fn cluster_without_signals_yields_no_opportunity() {
    let scenario = seed_export_cluster().await;
    let extractor = ScriptedExtractor {
        signals: HashMap::new(),
    };
    let pipeline = pipeline(&scenario, extractor, None);

    let summary = pipeline.run_full(scenario.organization_id).await.unwrap();
    assert_eq!(summary.clusters_created, 1);
    assert_eq!(summary.signals_detected, 0);
    assert_eq!(summary.opportunities_created, 0);
    assert!(scenario
        .store
        .opportunities_for_org(scenario.organization_id, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn advisor_actions_win_for_high_rps_opportunities() {
    let scenario = seed_export_cluster().await;
    let advisor = ScriptedAdvisor {
        actions: vec!["Draft an upsell proposal for Acme Corp".to_string()],
    };
    let pipeline = pipeline(&scenario, export_signals(), Some(Arc::new(advisor)));

    pipeline.run_full(scenario.organization_id).await.unwrap();
    let opportunities = scenario
        .store
        .opportunities_for_org(scenario.organization_id, None)
        .await
        .unwrap();
    assert_eq!(
        opportunities[0].recommended_actions,
        vec!["Draft an upsell proposal for Acme Corp"]
    );
}

#[tokio::test]
async fn embedding_cache_short_circuits_the_provider() {
    let scenario = seed_export_cluster().await;
    let cached_issue = scenario.issue_ids[0];
    scenario
        .store
        .put_embedding(&IssueEmbedding {
            issue_id: cached_issue,
            vector: vec![1.0, 0.0],
            content_hash: sha256_hex(b"a"),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let extractor = ScriptedExtractor {
        signals: HashMap::new(),
    };
    let pipeline = pipeline(&scenario, extractor, None);

    pipeline
        .cluster_issues(scenario.organization_id, None)
        .await
        .unwrap();
    assert_eq!(scenario.embeddings.calls.load(Ordering::SeqCst), 3);

    // A second run finds every vector cached with matching hashes.
    pipeline
        .cluster_issues(scenario.organization_id, None)
        .await
        .unwrap();
    assert_eq!(scenario.embeddings.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn repeated_clustering_runs_assign_the_same_members() {
    let scenario = seed_export_cluster().await;
    let extractor = ScriptedExtractor {
        signals: HashMap::new(),
    };
    let pipeline = pipeline(&scenario, extractor, None);

    let first = pipeline
        .cluster_issues(scenario.organization_id, None)
        .await
        .unwrap();
    let second = pipeline
        .cluster_issues(scenario.organization_id, None)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].member_issue_ids, second[0].member_issue_ids);
}

#[tokio::test]
async fn rps_recalculation_updates_the_stored_score() {
    let scenario = seed_export_cluster().await;
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).single().unwrap();
    let opportunity = Opportunity {
        id: Uuid::new_v4(),
        organization_id: scenario.organization_id,
        cluster_id: None,
        title: "Bulk export".to_string(),
        description: None,
        category: OpportunityCategory::MissingFeature,
        rps_score: 10.0,
        revenue_impact_arr: 100_000.0,
        frequency_score: 40.0,
        urgency_score: 75.0,
        effort_hours: 64.0,
        effort_score: 60.0,
        status: OpportunityStatus::Identified,
        affected_customers: Vec::new(),
        recommended_actions: Vec::new(),
        created_at: now,
        updated_at: now,
    };
    scenario.store.insert_opportunity(&opportunity).await.unwrap();

    let extractor = ScriptedExtractor {
        signals: HashMap::new(),
    };
    let pipeline = pipeline(&scenario, extractor, None);
    let rps = pipeline.recalculate_rps(opportunity.id).await.unwrap();

    // 100k ARR saturates the revenue term; the stored sub-scores carry over.
    assert_eq!(rps, 74.0);
    let stored = scenario.store.opportunity(opportunity.id).await.unwrap();
    assert_eq!(stored.rps_score, 74.0);
}

#[tokio::test]
async fn dashboard_metrics_cover_identified_opportunities_only() {
    let scenario = seed_export_cluster().await;
    let pipeline = pipeline(&scenario, export_signals(), None);
    pipeline.run_full(scenario.organization_id).await.unwrap();

    let metrics = pipeline
        .dashboard_metrics(scenario.organization_id)
        .await
        .unwrap();
    assert_eq!(metrics.total_opportunities, 1);
    assert_eq!(metrics.total_revenue_at_risk, 110_000.0);
    assert_eq!(metrics.high_priority_opportunities, 1);
    assert_eq!(metrics.avg_rps_score, 82.0);
    assert_eq!(metrics.total_issues_analyzed, 4);
    assert_eq!(metrics.total_clusters, 1);
    assert!(metrics.last_analysis_date.is_some());

    // Dismissing the opportunity empties the identified view.
    let opportunity_id = scenario
        .store
        .opportunities_for_org(scenario.organization_id, None)
        .await
        .unwrap()[0]
        .id;
    scenario
        .store
        .update_opportunity_status(opportunity_id, OpportunityStatus::Dismissed)
        .await
        .unwrap();
    let metrics = pipeline
        .dashboard_metrics(scenario.organization_id)
        .await
        .unwrap();
    assert_eq!(metrics.total_opportunities, 0);
    assert_eq!(metrics.avg_rps_score, 0.0);
    assert_eq!(metrics.total_clusters, 1);
}

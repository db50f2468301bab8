//! Persistence contract for the analysis pipeline + Postgres and in-memory stores.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ror_core::{
    Cluster, ClusterMember, Issue, IssueEmbedding, IssueSource, IssueType, Opportunity,
    OpportunityCategory, OpportunityStatus, RevenueSignal, RevenueSignalType, UnknownVariant,
    UrgencyLevel,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ror-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("corrupt {column} column: {source}")]
    Corrupt {
        column: &'static str,
        #[source]
        source: UnknownVariant,
    },
}

/// Hex-encoded sha-256, used as the embedding cache's content key: a cached
/// vector is only valid while the issue's embedding text hashes the same.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Record-oriented store consumed by the analysis pipeline. Issues upsert by
/// their (integration_id, external_id) natural key; everything else is plain
/// insert/select scoped by organization and id sets.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn upsert_issue(&self, issue: &Issue) -> Result<Uuid, StoreError>;

    /// Issues for one organization, optionally restricted to an id set,
    /// in stable (creation, id) order so clustering runs are reproducible.
    async fn issues_for_org(
        &self,
        organization_id: Uuid,
        issue_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Issue>, StoreError>;

    async fn embedding_for_issue(
        &self,
        issue_id: Uuid,
    ) -> Result<Option<IssueEmbedding>, StoreError>;

    async fn put_embedding(&self, embedding: &IssueEmbedding) -> Result<(), StoreError>;

    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;

    async fn insert_cluster_members(&self, members: &[ClusterMember]) -> Result<(), StoreError>;

    /// Clusters for one organization, newest first.
    async fn clusters_for_org(&self, organization_id: Uuid) -> Result<Vec<Cluster>, StoreError>;

    async fn members_for_cluster(
        &self,
        cluster_id: Uuid,
    ) -> Result<Vec<ClusterMember>, StoreError>;

    async fn insert_signals(&self, signals: &[RevenueSignal]) -> Result<(), StoreError>;

    async fn signals_for_issues(
        &self,
        organization_id: Uuid,
        issue_ids: &[Uuid],
    ) -> Result<Vec<RevenueSignal>, StoreError>;

    async fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError>;

    async fn opportunity(&self, id: Uuid) -> Result<Opportunity, StoreError>;

    /// Opportunities for one organization, highest RPS first, optionally
    /// filtered by status.
    async fn opportunities_for_org(
        &self,
        organization_id: Uuid,
        status: Option<OpportunityStatus>,
    ) -> Result<Vec<Opportunity>, StoreError>;

    async fn update_opportunity_rps(&self, id: Uuid, rps_score: f64) -> Result<(), StoreError>;

    async fn update_opportunity_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
    ) -> Result<(), StoreError>;

    async fn count_issues(&self, organization_id: Uuid) -> Result<u64, StoreError>;

    async fn count_clusters(&self, organization_id: Uuid) -> Result<u64, StoreError>;

    async fn latest_cluster_created_at(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_column<T: FromStr<Err = UnknownVariant>>(
    column: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|source| StoreError::Corrupt { column, source })
}

fn issue_from_row(row: &PgRow) -> Result<Issue, StoreError> {
    let source: String = row.try_get("source")?;
    let issue_type: Option<String> = row.try_get("issue_type")?;
    Ok(Issue {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        integration_id: row.try_get("integration_id")?,
        external_id: row.try_get("external_id")?,
        source: parse_column::<IssueSource>("source", &source)?,
        issue_type: issue_type
            .as_deref()
            .map(|raw| parse_column::<IssueType>("issue_type", raw))
            .transpose()?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        labels: row.try_get("labels")?,
        metadata: row
            .try_get::<Json<JsonMap<String, JsonValue>>, _>("metadata")?
            .0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        external_created_at: row.try_get("external_created_at")?,
        external_updated_at: row.try_get("external_updated_at")?,
    })
}

fn cluster_from_row(row: &PgRow) -> Result<Cluster, StoreError> {
    Ok(Cluster {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        theme: row.try_get("theme")?,
        issue_count: row.try_get::<i32, _>("issue_count")? as u32,
        estimated_effort_hours: row.try_get("estimated_effort_hours")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn signal_from_row(row: &PgRow) -> Result<RevenueSignal, StoreError> {
    let signal_type: String = row.try_get("signal_type")?;
    let urgency: String = row.try_get("urgency")?;
    Ok(RevenueSignal {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        issue_id: row.try_get("issue_id")?,
        signal_type: parse_column::<RevenueSignalType>("signal_type", &signal_type)?,
        confidence: row.try_get("confidence")?,
        deal_size_arr: row.try_get("deal_size_arr")?,
        customer_name: row.try_get("customer_name")?,
        urgency: parse_column::<UrgencyLevel>("urgency", &urgency)?,
        extracted_entities: row
            .try_get::<Json<JsonMap<String, JsonValue>>, _>("extracted_entities")?
            .0,
        pain_points: row.try_get("pain_points")?,
        competitive_context: row.try_get("competitive_context")?,
        created_at: row.try_get("created_at")?,
    })
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, StoreError> {
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    Ok(Opportunity {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        cluster_id: row.try_get("cluster_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category: parse_column::<OpportunityCategory>("category", &category)?,
        rps_score: row.try_get("rps_score")?,
        revenue_impact_arr: row.try_get("revenue_impact_arr")?,
        frequency_score: row.try_get("frequency_score")?,
        urgency_score: row.try_get("urgency_score")?,
        effort_hours: row.try_get("effort_hours")?,
        effort_score: row.try_get("effort_score")?,
        status: parse_column::<OpportunityStatus>("status", &status)?,
        affected_customers: row.try_get("affected_customers")?,
        recommended_actions: row.try_get("recommended_actions")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn upsert_issue(&self, issue: &Issue) -> Result<Uuid, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO issues (
                id, organization_id, integration_id, external_id, source, issue_type,
                title, description, status, priority, labels, metadata,
                created_at, updated_at, external_created_at, external_updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (integration_id, external_id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                labels = EXCLUDED.labels,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at,
                external_updated_at = EXCLUDED.external_updated_at
            RETURNING id
            "#,
        )
        .bind(issue.id)
        .bind(issue.organization_id)
        .bind(issue.integration_id)
        .bind(&issue.external_id)
        .bind(issue.source.as_str())
        .bind(issue.issue_type.map(|t| t.as_str()))
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(&issue.status)
        .bind(&issue.priority)
        .bind(&issue.labels)
        .bind(Json(issue.metadata.clone()))
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .bind(issue.external_created_at)
        .bind(issue.external_updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn issues_for_org(
        &self,
        organization_id: Uuid,
        issue_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Issue>, StoreError> {
        let rows = match issue_ids {
            Some(ids) => {
                sqlx::query(
                    "SELECT * FROM issues WHERE organization_id = $1 AND id = ANY($2) \
                     ORDER BY created_at, id",
                )
                .bind(organization_id)
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM issues WHERE organization_id = $1 ORDER BY created_at, id",
                )
                .bind(organization_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(issue_from_row).collect()
    }

    async fn embedding_for_issue(
        &self,
        issue_id: Uuid,
    ) -> Result<Option<IssueEmbedding>, StoreError> {
        let row = sqlx::query("SELECT * FROM issue_embeddings WHERE issue_id = $1")
            .bind(issue_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(IssueEmbedding {
                issue_id: row.try_get("issue_id")?,
                vector: row.try_get("vector")?,
                content_hash: row.try_get("content_hash")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn put_embedding(&self, embedding: &IssueEmbedding) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO issue_embeddings (issue_id, vector, content_hash, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (issue_id) DO UPDATE SET
                vector = EXCLUDED.vector,
                content_hash = EXCLUDED.content_hash,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(embedding.issue_id)
        .bind(&embedding.vector)
        .bind(&embedding.content_hash)
        .bind(embedding.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clusters (
                id, organization_id, name, description, theme, issue_count,
                estimated_effort_hours, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(cluster.id)
        .bind(cluster.organization_id)
        .bind(&cluster.name)
        .bind(&cluster.description)
        .bind(&cluster.theme)
        .bind(cluster.issue_count as i32)
        .bind(cluster.estimated_effort_hours)
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_cluster_members(&self, members: &[ClusterMember]) -> Result<(), StoreError> {
        for member in members {
            sqlx::query(
                "INSERT INTO cluster_members (cluster_id, issue_id, similarity_to_centroid) \
                 VALUES ($1, $2, $3)",
            )
            .bind(member.cluster_id)
            .bind(member.issue_id)
            .bind(member.similarity_to_centroid)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn clusters_for_org(&self, organization_id: Uuid) -> Result<Vec<Cluster>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM clusters WHERE organization_id = $1 ORDER BY created_at DESC",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cluster_from_row).collect()
    }

    async fn members_for_cluster(
        &self,
        cluster_id: Uuid,
    ) -> Result<Vec<ClusterMember>, StoreError> {
        let rows = sqlx::query("SELECT * FROM cluster_members WHERE cluster_id = $1")
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ClusterMember {
                    cluster_id: row.try_get("cluster_id")?,
                    issue_id: row.try_get("issue_id")?,
                    similarity_to_centroid: row.try_get("similarity_to_centroid")?,
                })
            })
            .collect()
    }

    async fn insert_signals(&self, signals: &[RevenueSignal]) -> Result<(), StoreError> {
        for signal in signals {
            sqlx::query(
                r#"
                INSERT INTO revenue_signals (
                    id, organization_id, issue_id, signal_type, confidence, deal_size_arr,
                    customer_name, urgency, extracted_entities, pain_points,
                    competitive_context, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(signal.id)
            .bind(signal.organization_id)
            .bind(signal.issue_id)
            .bind(signal.signal_type.as_str())
            .bind(signal.confidence)
            .bind(signal.deal_size_arr)
            .bind(&signal.customer_name)
            .bind(signal.urgency.as_str())
            .bind(Json(signal.extracted_entities.clone()))
            .bind(&signal.pain_points)
            .bind(&signal.competitive_context)
            .bind(signal.created_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn signals_for_issues(
        &self,
        organization_id: Uuid,
        issue_ids: &[Uuid],
    ) -> Result<Vec<RevenueSignal>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM revenue_signals WHERE organization_id = $1 AND issue_id = ANY($2) \
             ORDER BY created_at, id",
        )
        .bind(organization_id)
        .bind(issue_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(signal_from_row).collect()
    }

    async fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, organization_id, cluster_id, title, description, category, rps_score,
                revenue_impact_arr, frequency_score, urgency_score, effort_hours,
                effort_score, status, affected_customers, recommended_actions,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(opportunity.id)
        .bind(opportunity.organization_id)
        .bind(opportunity.cluster_id)
        .bind(&opportunity.title)
        .bind(&opportunity.description)
        .bind(opportunity.category.as_str())
        .bind(opportunity.rps_score)
        .bind(opportunity.revenue_impact_arr)
        .bind(opportunity.frequency_score)
        .bind(opportunity.urgency_score)
        .bind(opportunity.effort_hours)
        .bind(opportunity.effort_score)
        .bind(opportunity.status.as_str())
        .bind(&opportunity.affected_customers)
        .bind(&opportunity.recommended_actions)
        .bind(opportunity.created_at)
        .bind(opportunity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn opportunity(&self, id: Uuid) -> Result<Opportunity, StoreError> {
        let row = sqlx::query("SELECT * FROM opportunities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => opportunity_from_row(&row),
            None => Err(StoreError::NotFound {
                entity: "opportunity",
                id,
            }),
        }
    }

    async fn opportunities_for_org(
        &self,
        organization_id: Uuid,
        status: Option<OpportunityStatus>,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM opportunities WHERE organization_id = $1 AND status = $2 \
                     ORDER BY rps_score DESC",
                )
                .bind(organization_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM opportunities WHERE organization_id = $1 \
                     ORDER BY rps_score DESC",
                )
                .bind(organization_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn update_opportunity_rps(&self, id: Uuid, rps_score: f64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE opportunities SET rps_score = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(rps_score)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "opportunity",
                id,
            });
        }
        Ok(())
    }

    async fn update_opportunity_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE opportunities SET status = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(status.as_str())
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "opportunity",
                id,
            });
        }
        Ok(())
    }

    async fn count_issues(&self, organization_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM issues WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn count_clusters(&self, organization_id: Uuid) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM clusters WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn latest_cluster_created_at(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            "SELECT created_at FROM clusters WHERE organization_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| Ok(row.try_get("created_at")?)).transpose()
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    issues: Vec<Issue>,
    embeddings: HashMap<Uuid, IssueEmbedding>,
    clusters: Vec<Cluster>,
    members: Vec<ClusterMember>,
    signals: Vec<RevenueSignal>,
    opportunities: Vec<Opportunity>,
}

/// Insert-order-preserving store for tests and dry runs. Mirrors the trait's
/// ordering guarantees without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert_issue(&self, issue: &Issue) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.issues.iter_mut().find(|i| {
            i.integration_id == issue.integration_id && i.external_id == issue.external_id
        }) {
            existing.title = issue.title.clone();
            existing.description = issue.description.clone();
            existing.status = issue.status.clone();
            existing.priority = issue.priority.clone();
            existing.labels = issue.labels.clone();
            existing.metadata = issue.metadata.clone();
            existing.updated_at = issue.updated_at;
            existing.external_updated_at = issue.external_updated_at;
            return Ok(existing.id);
        }
        inner.issues.push(issue.clone());
        Ok(issue.id)
    }

    async fn issues_for_org(
        &self,
        organization_id: Uuid,
        issue_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Issue>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .issues
            .iter()
            .filter(|i| i.organization_id == organization_id)
            .filter(|i| issue_ids.map_or(true, |ids| ids.contains(&i.id)))
            .cloned()
            .collect())
    }

    async fn embedding_for_issue(
        &self,
        issue_id: Uuid,
    ) -> Result<Option<IssueEmbedding>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.embeddings.get(&issue_id).cloned())
    }

    async fn put_embedding(&self, embedding: &IssueEmbedding) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .embeddings
            .insert(embedding.issue_id, embedding.clone());
        Ok(())
    }

    async fn insert_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.clusters.push(cluster.clone());
        Ok(())
    }

    async fn insert_cluster_members(&self, members: &[ClusterMember]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.members.extend_from_slice(members);
        Ok(())
    }

    async fn clusters_for_org(&self, organization_id: Uuid) -> Result<Vec<Cluster>, StoreError> {
        let inner = self.inner.read().await;
        let mut clusters: Vec<Cluster> = inner
            .clusters
            .iter()
            .filter(|c| c.organization_id == organization_id)
            .cloned()
            .collect();
        clusters.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(clusters)
    }

    async fn members_for_cluster(
        &self,
        cluster_id: Uuid,
    ) -> Result<Vec<ClusterMember>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .members
            .iter()
            .filter(|m| m.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn insert_signals(&self, signals: &[RevenueSignal]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.signals.extend_from_slice(signals);
        Ok(())
    }

    async fn signals_for_issues(
        &self,
        organization_id: Uuid,
        issue_ids: &[Uuid],
    ) -> Result<Vec<RevenueSignal>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .signals
            .iter()
            .filter(|s| s.organization_id == organization_id && issue_ids.contains(&s.issue_id))
            .cloned()
            .collect())
    }

    async fn insert_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.opportunities.push(opportunity.clone());
        Ok(())
    }

    async fn opportunity(&self, id: Uuid) -> Result<Opportunity, StoreError> {
        let inner = self.inner.read().await;
        inner
            .opportunities
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "opportunity",
                id,
            })
    }

    async fn opportunities_for_org(
        &self,
        organization_id: Uuid,
        status: Option<OpportunityStatus>,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let inner = self.inner.read().await;
        let mut opportunities: Vec<Opportunity> = inner
            .opportunities
            .iter()
            .filter(|o| o.organization_id == organization_id)
            .filter(|o| status.map_or(true, |s| o.status == s))
            .cloned()
            .collect();
        opportunities.sort_by(|a, b| {
            b.rps_score
                .partial_cmp(&a.rps_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(opportunities)
    }

    async fn update_opportunity_rps(&self, id: Uuid, rps_score: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let opportunity = inner
            .opportunities
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(StoreError::NotFound {
                entity: "opportunity",
                id,
            })?;
        opportunity.rps_score = rps_score;
        opportunity.updated_at = Utc::now();
        Ok(())
    }

    async fn update_opportunity_status(
        &self,
        id: Uuid,
        status: OpportunityStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let opportunity = inner
            .opportunities
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(StoreError::NotFound {
                entity: "opportunity",
                id,
            })?;
        opportunity.status = status;
        opportunity.updated_at = Utc::now();
        Ok(())
    }

    async fn count_issues(&self, organization_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .issues
            .iter()
            .filter(|i| i.organization_id == organization_id)
            .count() as u64)
    }

    async fn count_clusters(&self, organization_id: Uuid) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .clusters
            .iter()
            .filter(|c| c.organization_id == organization_id)
            .count() as u64)
    }

    async fn latest_cluster_created_at(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .clusters
            .iter()
            .filter(|c| c.organization_id == organization_id)
            .map(|c| c.created_at)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ror_core::{IssueSource, IssueType, OpportunityCategory};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, hour, 0, 0).single().unwrap()
    }

    fn mk_issue(org: Uuid, integration: Uuid, external_id: &str, title: &str) -> Issue {
        Issue {
            id: Uuid::new_v4(),
            organization_id: org,
            integration_id: integration,
            external_id: external_id.to_string(),
            source: IssueSource::Jira,
            issue_type: Some(IssueType::Bug),
            title: title.to_string(),
            description: None,
            status: None,
            priority: None,
            labels: Vec::new(),
            metadata: JsonMap::new(),
            created_at: ts(9),
            updated_at: ts(9),
            external_created_at: None,
            external_updated_at: None,
        }
    }

    fn mk_opportunity(org: Uuid, rps: f64, status: OpportunityStatus) -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            organization_id: org,
            cluster_id: None,
            title: "Bulk export".to_string(),
            description: None,
            category: OpportunityCategory::MissingFeature,
            rps_score: rps,
            revenue_impact_arr: 50_000.0,
            frequency_score: 40.0,
            urgency_score: 75.0,
            effort_hours: 40.0,
            effort_score: 75.0,
            status,
            affected_customers: Vec::new(),
            recommended_actions: Vec::new(),
            created_at: ts(10),
            updated_at: ts(10),
        }
    }

    #[tokio::test]
    async fn upsert_by_natural_key_keeps_original_id() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let integration = Uuid::new_v4();

        let first = mk_issue(org, integration, "PROJ-7", "Export broken");
        let first_id = store.upsert_issue(&first).await.unwrap();

        let mut second = mk_issue(org, integration, "PROJ-7", "Export broken for CSV");
        second.updated_at = ts(11);
        let second_id = store.upsert_issue(&second).await.unwrap();

        assert_eq!(first_id, second_id);
        let issues = store.issues_for_org(org, None).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Export broken for CSV");
        assert_eq!(issues[0].updated_at, ts(11));
    }

    #[tokio::test]
    async fn distinct_external_ids_create_distinct_issues() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let integration = Uuid::new_v4();
        store
            .upsert_issue(&mk_issue(org, integration, "PROJ-1", "a"))
            .await
            .unwrap();
        store
            .upsert_issue(&mk_issue(org, integration, "PROJ-2", "b"))
            .await
            .unwrap();
        assert_eq!(store.count_issues(org).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn signals_are_scoped_by_org_and_issue_set() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let other_org = Uuid::new_v4();
        let issue_id = Uuid::new_v4();

        let signal = RevenueSignal {
            id: Uuid::new_v4(),
            organization_id: org,
            issue_id,
            signal_type: RevenueSignalType::ChurnRisk,
            confidence: 0.9,
            deal_size_arr: Some(20_000.0),
            customer_name: Some("Acme".to_string()),
            urgency: UrgencyLevel::High,
            extracted_entities: JsonMap::new(),
            pain_points: Vec::new(),
            competitive_context: None,
            created_at: ts(9),
        };
        let mut foreign = signal.clone();
        foreign.id = Uuid::new_v4();
        foreign.organization_id = other_org;
        store.insert_signals(&[signal, foreign]).await.unwrap();

        let found = store.signals_for_issues(org, &[issue_id]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].organization_id, org);
        assert!(store
            .signals_for_issues(org, &[Uuid::new_v4()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn opportunities_sort_by_rps_and_filter_by_status() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        store
            .insert_opportunity(&mk_opportunity(org, 42.0, OpportunityStatus::Identified))
            .await
            .unwrap();
        store
            .insert_opportunity(&mk_opportunity(org, 91.5, OpportunityStatus::Identified))
            .await
            .unwrap();
        store
            .insert_opportunity(&mk_opportunity(org, 77.0, OpportunityStatus::Dismissed))
            .await
            .unwrap();

        let identified = store
            .opportunities_for_org(org, Some(OpportunityStatus::Identified))
            .await
            .unwrap();
        assert_eq!(identified.len(), 2);
        assert_eq!(identified[0].rps_score, 91.5);
        assert_eq!(identified[1].rps_score, 42.0);

        let all = store.opportunities_for_org(org, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn rps_update_rejects_unknown_opportunity() {
        let store = MemoryStore::new();
        let missing = Uuid::new_v4();
        let err = store.update_opportunity_rps(missing, 50.0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "opportunity", .. }));
    }

    #[tokio::test]
    async fn embedding_cache_round_trips_by_issue_id() {
        let store = MemoryStore::new();
        let issue_id = Uuid::new_v4();
        assert!(store.embedding_for_issue(issue_id).await.unwrap().is_none());

        let embedding = IssueEmbedding {
            issue_id,
            vector: vec![0.1, 0.2, 0.3],
            content_hash: sha256_hex(b"export broken"),
            created_at: ts(9),
        };
        store.put_embedding(&embedding).await.unwrap();
        let cached = store.embedding_for_issue(issue_id).await.unwrap().unwrap();
        assert_eq!(cached, embedding);
    }

    #[tokio::test]
    async fn latest_cluster_date_tracks_newest_run() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        assert!(store.latest_cluster_created_at(org).await.unwrap().is_none());

        for hour in [9, 12, 10] {
            store
                .insert_cluster(&Cluster {
                    id: Uuid::new_v4(),
                    organization_id: org,
                    name: "Export failures".to_string(),
                    description: None,
                    theme: None,
                    issue_count: 3,
                    estimated_effort_hours: 12.0,
                    created_at: ts(hour),
                    updated_at: ts(hour),
                })
                .await
                .unwrap();
        }
        assert_eq!(
            store.latest_cluster_created_at(org).await.unwrap(),
            Some(ts(12))
        );
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}

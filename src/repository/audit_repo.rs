//! Audit repository (审计数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::AuditStore;
use crate::error::{AppError, Result};
use crate::models::audit::*;
use crate::models::token::SubjectId;

pub struct AuditRepository {
    db: PgPool,
}

impl AuditRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// audit_events 表的行结构（枚举以文本存储）
#[derive(Debug, sqlx::FromRow)]
struct AuditEventRow {
    id: Uuid,
    subject_id: Option<i64>,
    action: String,
    origin: Option<String>,
    user_agent: Option<String>,
    occurred_at: DateTime<Utc>,
    outcome: String,
    risk_rank: i16,
    context: serde_json::Value,
    session_id: Option<String>,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = AppError;

    fn try_from(row: AuditEventRow) -> Result<Self> {
        Ok(AuditEvent {
            id: row.id,
            subject_id: row.subject_id,
            action: row.action.parse()?,
            origin: row.origin,
            user_agent: row.user_agent,
            occurred_at: row.occurred_at,
            outcome: row.outcome.parse()?,
            risk_level: RiskLevel::from_rank(row.risk_rank)?,
            context: row.context,
            session_id: row.session_id,
        })
    }
}

fn into_events(rows: Vec<AuditEventRow>) -> Result<Vec<AuditEvent>> {
    rows.into_iter().map(AuditEvent::try_from).collect()
}

const SELECT_EVENT: &str = "SELECT id, subject_id, action, origin, user_agent, occurred_at, outcome, risk_rank, context, session_id FROM audit_events";

/// 拼接 by-subject 的 WHERE 条件，返回 (SQL, 下一个参数序号)
fn subject_filter_sql(base: &str, filters: &AuditFilters) -> (String, usize) {
    let mut query = format!("{} WHERE subject_id = $1", base);
    let mut index = 1;

    if filters.action.is_some() {
        index += 1;
        query.push_str(&format!(" AND action = ${}", index));
    }
    if filters.outcome.is_some() {
        index += 1;
        query.push_str(&format!(" AND outcome = ${}", index));
    }
    if filters.min_risk.is_some() {
        index += 1;
        query.push_str(&format!(" AND risk_rank >= ${}", index));
    }
    if filters.start_time.is_some() {
        index += 1;
        query.push_str(&format!(" AND occurred_at >= ${}", index));
    }
    if filters.end_time.is_some() {
        index += 1;
        query.push_str(&format!(" AND occurred_at <= ${}", index));
    }

    (query, index)
}

macro_rules! bind_subject_filters {
    ($query:expr, $subject_id:expr, $filters:expr) => {{
        let mut q = $query.bind($subject_id);
        if let Some(action) = $filters.action {
            q = q.bind(action.as_str());
        }
        if let Some(outcome) = $filters.outcome {
            q = q.bind(outcome.as_str());
        }
        if let Some(min_risk) = $filters.min_risk {
            q = q.bind(min_risk.rank());
        }
        if let Some(start_time) = $filters.start_time {
            q = q.bind(start_time);
        }
        if let Some(end_time) = $filters.end_time {
            q = q.bind(end_time);
        }
        q
    }};
}

#[async_trait]
impl AuditStore for AuditRepository {
    async fn insert_event(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, subject_id, action, origin, user_agent, occurred_at, outcome,
                risk_level, risk_rank, context, session_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.subject_id)
        .bind(event.action.as_str())
        .bind(&event.origin)
        .bind(&event.user_agent)
        .bind(event.occurred_at)
        .bind(event.outcome.as_str())
        .bind(event.risk_level.as_str())
        .bind(event.risk_level.rank())
        .bind(&event.context)
        .bind(&event.session_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn events_by_subject(
        &self,
        subject_id: SubjectId,
        filters: &AuditFilters,
        page: Page,
    ) -> Result<Vec<AuditEvent>> {
        let (mut query, index) = subject_filter_sql(SELECT_EVENT, filters);
        query.push_str(&format!(
            " ORDER BY occurred_at DESC LIMIT ${} OFFSET ${}",
            index + 1,
            index + 2
        ));

        let rows = bind_subject_filters!(sqlx::query_as::<_, AuditEventRow>(&query), subject_id, filters)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.db)
            .await?;

        into_events(rows)
    }

    async fn count_by_subject(
        &self,
        subject_id: SubjectId,
        filters: &AuditFilters,
    ) -> Result<i64> {
        let (query, _) = subject_filter_sql("SELECT COUNT(*) FROM audit_events", filters);

        let count: i64 = bind_subject_filters!(sqlx::query(&query), subject_id, filters)
            .fetch_one(&self.db)
            .await?
            .get(0);

        Ok(count)
    }

    async fn events_by_origin(
        &self,
        origin: &str,
        timeframe: Timeframe,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let query = format!(
            "{} WHERE origin = $1 AND occurred_at >= $2 AND occurred_at <= $3 ORDER BY occurred_at DESC LIMIT $4",
            SELECT_EVENT
        );

        let rows = sqlx::query_as::<_, AuditEventRow>(&query)
            .bind(origin)
            .bind(timeframe.start)
            .bind(timeframe.end)
            .bind(limit)
            .fetch_all(&self.db)
            .await?;

        into_events(rows)
    }

    async fn suspicious_events(
        &self,
        timeframe: Timeframe,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let query = format!(
            "{} WHERE occurred_at >= $1 AND occurred_at <= $2 AND (risk_rank >= $3 OR outcome = $4) ORDER BY occurred_at DESC LIMIT $5",
            SELECT_EVENT
        );

        let rows = sqlx::query_as::<_, AuditEventRow>(&query)
            .bind(timeframe.start)
            .bind(timeframe.end)
            .bind(RiskLevel::High.rank())
            .bind(Outcome::Blocked.as_str())
            .bind(limit)
            .fetch_all(&self.db)
            .await?;

        into_events(rows)
    }

    async fn analytics(&self, timeframe: Timeframe) -> Result<SecurityAnalytics> {
        let totals = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE risk_rank >= $3 OR outcome = $4) AS suspicious,
                COUNT(DISTINCT subject_id) AS actors,
                COUNT(DISTINCT origin) AS origins
            FROM audit_events
            WHERE occurred_at >= $1 AND occurred_at <= $2
            "#,
        )
        .bind(timeframe.start)
        .bind(timeframe.end)
        .bind(RiskLevel::High.rank())
        .bind(Outcome::Blocked.as_str())
        .fetch_one(&self.db)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT
                action,
                outcome,
                COUNT(*) AS count,
                COUNT(DISTINCT subject_id) AS actors,
                COUNT(DISTINCT origin) AS origins
            FROM audit_events
            WHERE occurred_at >= $1 AND occurred_at <= $2
            GROUP BY action, outcome
            ORDER BY action, outcome
            "#,
        )
        .bind(timeframe.start)
        .bind(timeframe.end)
        .fetch_all(&self.db)
        .await?;

        let mut breakdown = Vec::with_capacity(rows.len());
        for row in rows {
            let action: String = row.try_get("action")?;
            let outcome: String = row.try_get("outcome")?;
            breakdown.push(ActionOutcomeStats {
                action: action.parse()?,
                outcome: outcome.parse()?,
                count: row.try_get("count")?,
                distinct_actors: row.try_get("actors")?,
                distinct_origins: row.try_get("origins")?,
            });
        }

        Ok(SecurityAnalytics {
            timeframe,
            total_events: totals.try_get("total")?,
            suspicious_events: totals.try_get("suspicious")?,
            distinct_actors: totals.try_get("actors")?,
            distinct_origins: totals.try_get("origins")?,
            breakdown,
        })
    }

    async fn origin_seen(&self, subject_id: SubjectId, origin: &str) -> Result<bool> {
        let seen: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM audit_events
                WHERE subject_id = $1 AND origin = $2 AND action = $3
            )
            "#,
        )
        .bind(subject_id)
        .bind(origin)
        .bind(AuditAction::LoginSuccess.as_str())
        .fetch_one(&self.db)
        .await?;

        Ok(seen)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_filter_sql_numbers_parameters() {
        let filters = AuditFilters {
            action: Some(AuditAction::LoginFailed),
            outcome: None,
            min_risk: Some(RiskLevel::High),
            start_time: Some(Utc::now()),
            end_time: None,
        };

        let (sql, index) = subject_filter_sql("SELECT COUNT(*) FROM audit_events", &filters);
        assert_eq!(index, 4);
        assert!(sql.contains("subject_id = $1"));
        assert!(sql.contains("action = $2"));
        assert!(sql.contains("risk_rank >= $3"));
        assert!(sql.contains("occurred_at >= $4"));
        assert!(!sql.contains("outcome"));
    }

    #[test]
    fn test_row_conversion_rejects_unknown_action() {
        let row = AuditEventRow {
            id: Uuid::new_v4(),
            subject_id: None,
            action: "user.login".to_string(),
            origin: None,
            user_agent: None,
            occurred_at: Utc::now(),
            outcome: "success".to_string(),
            risk_rank: 0,
            context: serde_json::Value::Null,
            session_id: None,
        };
        assert!(AuditEvent::try_from(row).is_err());
    }
}

use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::parser::ParsedIntent;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::error::Error),
    #[error("Failed to parse stored json: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Unknown enum value in store: {0}")]
    UnknownEnumValue(String),
    #[error("No such record")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Compiled,
    Applied,
    Satisfied,
    Violated,
    Superseded,
    Failed,
    Revoked,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Compiled => "compiled",
            IntentStatus::Applied => "applied",
            IntentStatus::Satisfied => "satisfied",
            IntentStatus::Violated => "violated",
            IntentStatus::Superseded => "superseded",
            IntentStatus::Failed => "failed",
            IntentStatus::Revoked => "revoked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Superseded | IntentStatus::Failed | IntentStatus::Revoked
        )
    }
}

impl FromStr for IntentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "compiled" => Ok(IntentStatus::Compiled),
            "applied" => Ok(IntentStatus::Applied),
            "satisfied" => Ok(IntentStatus::Satisfied),
            "violated" => Ok(IntentStatus::Violated),
            "superseded" => Ok(IntentStatus::Superseded),
            "failed" => Ok(IntentStatus::Failed),
            "revoked" => Ok(IntentStatus::Revoked),
            other => Err(StoreError::UnknownEnumValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plane {
    DataPlane,
    Device,
}

impl Plane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plane::DataPlane => "data_plane",
            Plane::Device => "device",
        }
    }
}

impl FromStr for Plane {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_plane" => Ok(Plane::DataPlane),
            "device" => Ok(Plane::Device),
            other => Err(StoreError::UnknownEnumValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    HtbClass,
    NetemDelay,
    PriorityMark,
    IptablesRule,
    DeviceControl,
    MqttQos,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::HtbClass => "htb_class",
            PolicyKind::NetemDelay => "netem_delay",
            PolicyKind::PriorityMark => "priority_mark",
            PolicyKind::IptablesRule => "iptables_rule",
            PolicyKind::DeviceControl => "device_control",
            PolicyKind::MqttQos => "mqtt_qos",
        }
    }

    pub fn plane(&self) -> Plane {
        match self {
            PolicyKind::HtbClass
            | PolicyKind::NetemDelay
            | PolicyKind::PriorityMark
            | PolicyKind::IptablesRule => Plane::DataPlane,
            PolicyKind::DeviceControl | PolicyKind::MqttQos => Plane::Device,
        }
    }
}

impl FromStr for PolicyKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "htb_class" => Ok(PolicyKind::HtbClass),
            "netem_delay" => Ok(PolicyKind::NetemDelay),
            "priority_mark" => Ok(PolicyKind::PriorityMark),
            "iptables_rule" => Ok(PolicyKind::IptablesRule),
            "device_control" => Ok(PolicyKind::DeviceControl),
            "mqtt_qos" => Ok(PolicyKind::MqttQos),
            other => Err(StoreError::UnknownEnumValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Pending,
    PendingDelivery,
    Applied,
    Failed,
    RolledBack,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Pending => "pending",
            PolicyStatus::PendingDelivery => "pending_delivery",
            PolicyStatus::Applied => "applied",
            PolicyStatus::Failed => "failed",
            PolicyStatus::RolledBack => "rolled_back",
        }
    }

    // Statuses that hold a claim on the policy's (target, kind) key.
    pub fn is_live(&self) -> bool {
        matches!(self, PolicyStatus::Applied | PolicyStatus::PendingDelivery)
    }
}

impl FromStr for PolicyStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PolicyStatus::Pending),
            "pending_delivery" => Ok(PolicyStatus::PendingDelivery),
            "applied" => Ok(PolicyStatus::Applied),
            "failed" => Ok(PolicyStatus::Failed),
            "rolled_back" => Ok(PolicyStatus::RolledBack),
            other => Err(StoreError::UnknownEnumValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalAggregate {
    Mean,
    P95,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalComparator {
    AtMost,
    AtLeast,
}

/// A measurable target extracted from an intent, evaluated by the feedback
/// loop against the metric history.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Goal {
    pub metric: String,
    pub device_id: Option<String>,
    pub aggregate: GoalAggregate,
    pub comparator: GoalComparator,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub id: Uuid,
    pub raw_text: String,
    pub parsed: Vec<ParsedIntent>,
    pub goal: Option<Goal>,
    pub status: IntentStatus,
    pub submitter: String,
    pub parent_id: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub warning: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub seq: i64,
    pub plane: Plane,
    pub kind: PolicyKind,
    pub target: String,
    pub conflict_key: String,
    pub parameters: serde_json::Value,
    pub status: PolicyStatus,
    pub applied_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric_name: String,
    pub device_id: Option<String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct IntentRow {
    id: String,
    raw_text: String,
    parsed: String,
    goal: Option<String>,
    status: String,
    submitter: String,
    parent_id: Option<String>,
    superseded_by: Option<String>,
    warning: Option<String>,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for Intent {
    type Error = StoreError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(Intent {
            id: parse_uuid(&row.id)?,
            raw_text: row.raw_text,
            parsed: serde_json::from_str(&row.parsed)?,
            goal: row.goal.as_deref().map(serde_json::from_str).transpose()?,
            status: row.status.parse()?,
            submitter: row.submitter,
            parent_id: row.parent_id.as_deref().map(parse_uuid).transpose()?,
            superseded_by: row.superseded_by.as_deref().map(parse_uuid).transpose()?,
            warning: row.warning,
            submitted_at: row.submitted_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PolicyRow {
    id: String,
    intent_id: String,
    seq: i64,
    plane: String,
    kind: String,
    target: String,
    conflict_key: String,
    parameters: String,
    status: String,
    applied_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<PolicyRow> for Policy {
    type Error = StoreError;

    fn try_from(row: PolicyRow) -> Result<Self, Self::Error> {
        Ok(Policy {
            id: parse_uuid(&row.id)?,
            intent_id: parse_uuid(&row.intent_id)?,
            seq: row.seq,
            plane: row.plane.parse()?,
            kind: row.kind.parse()?,
            target: row.target,
            conflict_key: row.conflict_key,
            parameters: serde_json::from_str(&row.parameters)?,
            status: row.status.parse()?,
            applied_at: row.applied_at,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MetricRow {
    metric_name: String,
    device_id: String,
    value: f64,
    timestamp: DateTime<Utc>,
}

impl From<MetricRow> for MetricSample {
    fn from(row: MetricRow) -> Self {
        MetricSample {
            metric_name: row.metric_name,
            device_id: if row.device_id.is_empty() {
                None
            } else {
                Some(row.device_id)
            },
            value: row.value,
            timestamp: row.timestamp,
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|_| StoreError::UnknownEnumValue(s.to_owned()))
}

/// Durable controller state. All status mutations are expected to arrive via
/// the single submission worker; readers may call concurrently.
#[derive(Debug)]
pub struct Store {
    pool: sqlx::SqlitePool,
    log: slog::Logger,
}

impl Store {
    pub fn new(pool: sqlx::SqlitePool, log: slog::Logger) -> Store {
        Store { pool, log }
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Persist an intent and its derived policies in one transaction.
    pub async fn create_intent(
        &self,
        intent: &Intent,
        policies: &[Policy],
    ) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;
        slog::debug!(self.log, "persisting intent"; "id" => intent.id.to_string());

        let intent_insert_query = r#"
            INSERT INTO intents ("id", "raw_text", "parsed", "goal", "status", "submitter", "parent_id", "superseded_by", "warning", "submitted_at", "updated_at")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#;
        sqlx::query(intent_insert_query)
            .bind(intent.id.to_string())
            .bind(&intent.raw_text)
            .bind(serde_json::to_string(&intent.parsed)?)
            .bind(
                intent
                    .goal
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(intent.status.as_str())
            .bind(&intent.submitter)
            .bind(intent.parent_id.map(|p| p.to_string()))
            .bind(intent.superseded_by.map(|p| p.to_string()))
            .bind(&intent.warning)
            .bind(intent.submitted_at)
            .bind(intent.updated_at)
            .execute(&mut *transaction)
            .await?;

        let policy_insert_query = r#"
            INSERT INTO policies ("id", "intent_id", "seq", "plane", "kind", "target", "conflict_key", "parameters", "status", "applied_at", "last_error")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#;
        for policy in policies {
            sqlx::query(policy_insert_query)
                .bind(policy.id.to_string())
                .bind(policy.intent_id.to_string())
                .bind(policy.seq)
                .bind(policy.plane.as_str())
                .bind(policy.kind.as_str())
                .bind(&policy.target)
                .bind(&policy.conflict_key)
                .bind(serde_json::to_string(&policy.parameters)?)
                .bind(policy.status.as_str())
                .bind(policy.applied_at)
                .bind(&policy.last_error)
                .execute(&mut *transaction)
                .await?;
        }

        audit(
            &mut transaction,
            "intent",
            &intent.id.to_string(),
            "submitted",
            Some(&intent.raw_text),
        )
        .await?;

        transaction.commit().await?;
        Ok(())
    }

    pub async fn get_intent(&self, id: Uuid) -> Result<Intent, StoreError> {
        let query = r#"SELECT * FROM intents WHERE "id" = $1"#;
        let row: Option<IntentRow> = sqlx::query_as(query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(StoreError::NotFound)?.try_into()
    }

    pub async fn list_intents(
        &self,
        status: Option<IntentStatus>,
    ) -> Result<Vec<Intent>, StoreError> {
        let rows: Vec<IntentRow> = match status {
            Some(status) => {
                let query =
                    r#"SELECT * FROM intents WHERE "status" = $1 ORDER BY "submitted_at""#;
                sqlx::query_as(query)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = r#"SELECT * FROM intents ORDER BY "submitted_at""#;
                sqlx::query_as(query).fetch_all(&self.pool).await?
            }
        };
        rows.into_iter().map(Intent::try_from).collect()
    }

    /// Intents the feedback loop cares about: live, with a measurable goal.
    pub async fn active_goal_intents(&self) -> Result<Vec<Intent>, StoreError> {
        let query = r#"
            SELECT * FROM intents
            WHERE "status" IN ('applied', 'satisfied', 'violated') AND "goal" IS NOT NULL
            ORDER BY "submitted_at"
        "#;
        let rows: Vec<IntentRow> = sqlx::query_as(query).fetch_all(&self.pool).await?;
        rows.into_iter().map(Intent::try_from).collect()
    }

    pub async fn set_intent_status(
        &self,
        id: Uuid,
        status: IntentStatus,
    ) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;
        let query = r#"UPDATE intents SET "status" = $1, "updated_at" = $2 WHERE "id" = $3"#;
        let result = sqlx::query(query)
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&mut *transaction)
            .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::NotFound);
        }
        audit(
            &mut transaction,
            "intent",
            &id.to_string(),
            "status",
            Some(status.as_str()),
        )
        .await?;
        transaction.commit().await?;
        Ok(())
    }

    pub async fn set_intent_warning(
        &self,
        id: Uuid,
        warning: Option<&str>,
    ) -> Result<(), StoreError> {
        let query = r#"UPDATE intents SET "warning" = $1, "updated_at" = $2 WHERE "id" = $3"#;
        sqlx::query(query)
            .bind(warning)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark an intent and its still-live policies as displaced by a successor,
    /// in one commit.
    pub async fn supersede_intent(
        &self,
        old_id: Uuid,
        successor_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;
        slog::debug!(self.log, "superseding intent";
            "old" => old_id.to_string(), "new" => successor_id.to_string());

        let intent_query = r#"
            UPDATE intents SET "status" = 'superseded', "superseded_by" = $1, "updated_at" = $2
            WHERE "id" = $3
        "#;
        sqlx::query(intent_query)
            .bind(successor_id.to_string())
            .bind(Utc::now())
            .bind(old_id.to_string())
            .execute(&mut *transaction)
            .await?;

        let policy_query = r#"
            UPDATE policies SET "status" = 'rolled_back'
            WHERE "intent_id" = $1 AND "status" IN ('applied', 'pending_delivery', 'pending')
        "#;
        sqlx::query(policy_query)
            .bind(old_id.to_string())
            .execute(&mut *transaction)
            .await?;

        audit(
            &mut transaction,
            "intent",
            &old_id.to_string(),
            "superseded",
            Some(&successor_id.to_string()),
        )
        .await?;

        transaction.commit().await?;
        Ok(())
    }

    /// Roll back a single policy's claim without touching its siblings. Used
    /// when a feedback correction displaces one policy of a goal-bearing
    /// intent that must itself stay under evaluation.
    pub async fn roll_back_policy(&self, policy_id: Uuid) -> Result<(), StoreError> {
        self.set_policy_status(policy_id, PolicyStatus::RolledBack, None)
            .await
    }

    pub async fn set_policy_status(
        &self,
        id: Uuid,
        status: PolicyStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let applied_at = match status {
            PolicyStatus::Applied => Some(Utc::now()),
            _ => None,
        };
        let query = r#"
            UPDATE policies SET "status" = $1, "last_error" = $2,
                "applied_at" = COALESCE($3, "applied_at")
            WHERE "id" = $4
        "#;
        let result = sqlx::query(query)
            .bind(status.as_str())
            .bind(last_error)
            .bind(applied_at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn get_policy(&self, id: Uuid) -> Result<Policy, StoreError> {
        let query = r#"SELECT * FROM policies WHERE "id" = $1"#;
        let row: Option<PolicyRow> = sqlx::query_as(query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(StoreError::NotFound)?.try_into()
    }

    pub async fn policies_for_intent(&self, intent_id: Uuid) -> Result<Vec<Policy>, StoreError> {
        let query = r#"SELECT * FROM policies WHERE "intent_id" = $1 ORDER BY "seq""#;
        let rows: Vec<PolicyRow> = sqlx::query_as(query)
            .bind(intent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Policy::try_from).collect()
    }

    pub async fn list_policies(&self, plane: Option<Plane>) -> Result<Vec<Policy>, StoreError> {
        let rows: Vec<PolicyRow> = match plane {
            Some(plane) => {
                let query = r#"SELECT * FROM policies WHERE "plane" = $1 ORDER BY "intent_id", "seq""#;
                sqlx::query_as(query)
                    .bind(plane.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = r#"SELECT * FROM policies ORDER BY "intent_id", "seq""#;
                sqlx::query_as(query).fetch_all(&self.pool).await?
            }
        };
        rows.into_iter().map(Policy::try_from).collect()
    }

    /// The set an enforcer must converge the live plane towards on startup.
    pub async fn applied_policies(&self, plane: Plane) -> Result<Vec<Policy>, StoreError> {
        let query = r#"
            SELECT * FROM policies WHERE "plane" = $1 AND "status" = 'applied'
            ORDER BY "intent_id", "seq"
        "#;
        let rows: Vec<PolicyRow> = sqlx::query_as(query)
            .bind(plane.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Policy::try_from).collect()
    }

    pub async fn pending_delivery_policies(
        &self,
        device_id: &str,
    ) -> Result<Vec<Policy>, StoreError> {
        let query = r#"
            SELECT * FROM policies WHERE "target" = $1 AND "status" = 'pending_delivery'
            ORDER BY "seq"
        "#;
        let rows: Vec<PolicyRow> = sqlx::query_as(query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Policy::try_from).collect()
    }

    /// Policies from other intents still holding the same (target, kind) key.
    pub async fn live_conflicts(
        &self,
        conflict_key: &str,
        exclude_intent: Uuid,
    ) -> Result<Vec<Policy>, StoreError> {
        let query = r#"
            SELECT * FROM policies
            WHERE "conflict_key" = $1 AND "intent_id" != $2
                AND "status" IN ('applied', 'pending_delivery')
        "#;
        let rows: Vec<PolicyRow> = sqlx::query_as(query)
            .bind(conflict_key)
            .bind(exclude_intent.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Policy::try_from).collect()
    }

    /// Append one sample. The schema ignores duplicate (name, device, stamp)
    /// rows so replayed telemetry is a no-op.
    pub async fn append_metric(&self, sample: &MetricSample) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO metrics_history ("metric_name", "device_id", "value", "timestamp")
            VALUES ($1, $2, $3, $4)
        "#;
        sqlx::query(query)
            .bind(&sample.metric_name)
            .bind(sample.device_id.as_deref().unwrap_or(""))
            .bind(sample.value)
            .bind(sample.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn metric_window(
        &self,
        metric_name: &str,
        device_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let rows: Vec<MetricRow> = match device_id {
            Some(device) => {
                let query = r#"
                    SELECT * FROM metrics_history
                    WHERE "metric_name" = $1 AND "device_id" = $2 AND "timestamp" >= $3
                    ORDER BY "timestamp"
                "#;
                sqlx::query_as(query)
                    .bind(metric_name)
                    .bind(device)
                    .bind(since)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = r#"
                    SELECT * FROM metrics_history
                    WHERE "metric_name" = $1 AND "timestamp" >= $2
                    ORDER BY "timestamp"
                "#;
                sqlx::query_as(query)
                    .bind(metric_name)
                    .bind(since)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(MetricSample::from).collect())
    }

    pub async fn recent_metrics_for_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let query = r#"
            SELECT * FROM metrics_history WHERE "device_id" = $1
            ORDER BY "timestamp" DESC LIMIT $2
        "#;
        let rows: Vec<MetricRow> = sqlx::query_as(query)
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(MetricSample::from).collect())
    }

    pub async fn prune_metrics(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = r#"DELETE FROM metrics_history WHERE "timestamp" < $1"#;
        let result = sqlx::query(query)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            slog::debug!(self.log, "pruned metric history"; "rows" => result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    pub async fn record_audit(
        &self,
        subject_kind: &str,
        subject_id: &str,
        event: &str,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut transaction = self.pool.begin().await?;
        audit(&mut transaction, subject_kind, subject_id, event, detail).await?;
        transaction.commit().await?;
        Ok(())
    }

    pub async fn ensure_user(&self, name: &str) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO users ("name", "created_at") VALUES ($1, $2)
            ON CONFLICT ("name") DO NOTHING
        "#;
        sqlx::query(query)
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let query = r#"SELECT COALESCE(MAX("version"), 0) FROM _sqlx_migrations"#;
        let version: (i64,) = sqlx::query_as(query).fetch_one(&self.pool).await?;
        Ok(version.0)
    }
}

async fn audit(
    transaction: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    subject_kind: &str,
    subject_id: &str,
    event: &str,
    detail: Option<&str>,
) -> Result<(), StoreError> {
    let query = r#"
        INSERT INTO audit_log ("at", "subject_kind", "subject_id", "event", "detail")
        VALUES ($1, $2, $3, $4, $5)
    "#;
    sqlx::query(query)
        .bind(Utc::now())
        .bind(subject_kind)
        .bind(subject_id)
        .bind(event)
        .bind(detail)
        .execute(&mut **transaction)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::{IntentKind, TargetSelector};

    pub(crate) async fn test_store() -> Store {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        Store::new(pool, log)
    }

    pub(crate) fn test_intent(raw_text: &str, submitter: &str) -> Intent {
        let now = Utc::now();
        Intent {
            id: Uuid::now_v7(),
            raw_text: raw_text.to_owned(),
            parsed: vec![ParsedIntent {
                kind: IntentKind::Bandwidth,
                target_selector: TargetSelector::Ids(vec!["camera-01".to_owned()]),
                parameters: serde_json::json!({"rate_bps": 409600}),
            }],
            goal: None,
            status: IntentStatus::Compiled,
            submitter: submitter.to_owned(),
            parent_id: None,
            superseded_by: None,
            warning: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn test_policy(intent_id: Uuid, seq: i64, conflict_key: &str) -> Policy {
        Policy {
            id: Uuid::now_v7(),
            intent_id,
            seq,
            plane: Plane::DataPlane,
            kind: PolicyKind::HtbClass,
            target: "camera-01".to_owned(),
            conflict_key: conflict_key.to_owned(),
            parameters: serde_json::json!({"rate_bps": 409600, "ceil_bps": 409600}),
            status: PolicyStatus::Pending,
            applied_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn intent_roundtrip_preserves_fields() {
        let store = test_store().await;
        let intent = test_intent("limit camera-01 to 50KB/s", "operator");
        let policy = test_policy(intent.id, 0, "dp:htb:eth0:1:0x1a2");
        store.create_intent(&intent, &[policy.clone()]).await.unwrap();

        let fetched = store.get_intent(intent.id).await.unwrap();
        assert_eq!(fetched.raw_text, intent.raw_text);
        assert_eq!(fetched.status, IntentStatus::Compiled);
        assert_eq!(fetched.parsed, intent.parsed);

        let policies = store.policies_for_intent(intent.id).await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].conflict_key, policy.conflict_key);
        assert_eq!(policies[0].parameters, policy.parameters);
    }

    #[tokio::test]
    async fn supersede_is_atomic_over_intent_and_policies() {
        let store = test_store().await;
        let old = test_intent("limit camera-01 to 50KB/s", "operator");
        let old_policy = test_policy(old.id, 0, "dp:htb:eth0:1:0x1a2");
        store.create_intent(&old, &[old_policy.clone()]).await.unwrap();
        store
            .set_policy_status(old_policy.id, PolicyStatus::Applied, None)
            .await
            .unwrap();

        let successor = Uuid::now_v7();
        store.supersede_intent(old.id, successor).await.unwrap();

        let fetched = store.get_intent(old.id).await.unwrap();
        assert_eq!(fetched.status, IntentStatus::Superseded);
        assert_eq!(fetched.superseded_by, Some(successor));
        let policies = store.policies_for_intent(old.id).await.unwrap();
        assert_eq!(policies[0].status, PolicyStatus::RolledBack);
    }

    #[tokio::test]
    async fn live_conflicts_only_sees_live_claims() {
        let store = test_store().await;
        let a = test_intent("limit camera-01 to 50KB/s", "operator");
        let pa = test_policy(a.id, 0, "dp:htb:eth0:1:0x1a2");
        store.create_intent(&a, &[pa.clone()]).await.unwrap();

        let b = test_intent("limit camera-01 to 20KB/s", "operator");
        let pb = test_policy(b.id, 0, "dp:htb:eth0:1:0x1a2");
        store.create_intent(&b, &[pb.clone()]).await.unwrap();

        // Pending policies hold no claim yet.
        let conflicts = store.live_conflicts("dp:htb:eth0:1:0x1a2", b.id).await.unwrap();
        assert!(conflicts.is_empty());

        store
            .set_policy_status(pa.id, PolicyStatus::Applied, None)
            .await
            .unwrap();
        let conflicts = store.live_conflicts("dp:htb:eth0:1:0x1a2", b.id).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].id, pa.id);
    }

    #[tokio::test]
    async fn metric_append_is_idempotent_under_replay() {
        let store = test_store().await;
        let sample = MetricSample {
            metric_name: "latency_ms".to_owned(),
            device_id: Some("sensor-01".to_owned()),
            value: 40.0,
            timestamp: Utc::now(),
        };
        store.append_metric(&sample).await.unwrap();
        store.append_metric(&sample).await.unwrap();

        let window = store
            .metric_window("latency_ms", Some("sensor-01"), sample.timestamp - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
    }

    #[tokio::test]
    async fn prune_discards_only_expired_samples() {
        let store = test_store().await;
        let now = Utc::now();
        let old = MetricSample {
            metric_name: "latency_ms".to_owned(),
            device_id: None,
            value: 10.0,
            timestamp: now - chrono::Duration::hours(30),
        };
        let fresh = MetricSample {
            metric_name: "latency_ms".to_owned(),
            device_id: None,
            value: 11.0,
            timestamp: now,
        };
        store.append_metric(&old).await.unwrap();
        store.append_metric(&fresh).await.unwrap();

        let pruned = store
            .prune_metrics(now - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        let window = store
            .metric_window("latency_ms", None, now - chrono::Duration::hours(48))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].value, 11.0);
    }
}

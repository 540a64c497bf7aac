use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task type tags with scheduler-side expansion semantics. Everything
/// else is a leaf task executed by an external worker.
pub const TASK_TYPE_CHAIN: &str = "execution_chain";
pub const TASK_TYPE_FOR_LOOP: &str = "execution_for_loop";
pub const TASK_TYPE_DO_WHILE_LOOP: &str = "execution_do_while_loop";
pub const TASK_TYPE_CONDITIONAL: &str = "execution_conditional";

/// Metadata keyword under which a control container stores its own
/// descriptor JSON, so that deferred expansion survives restarts.
pub const METADATA_TASK_DESCRIPTION: &str = "task_description";
/// Metadata keyword marking a do-while container whose repeat
/// criterion has evaluated false.
pub const METADATA_LOOP_CLOSED: &str = "loop_closed";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Root tasks have no parent; every other task has exactly one,
    /// assigned at expansion time and never reassigned.
    pub parent_id: Option<i64>,
    pub task_type: String,
    /// Optional label used for metadata cross-references between tasks.
    pub name: Option<String>,
    pub job_name: Option<String>,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn is_container(&self) -> bool {
        matches!(
            self.task_type.as_str(),
            TASK_TYPE_CHAIN | TASK_TYPE_FOR_LOOP | TASK_TYPE_DO_WHILE_LOOP | TASK_TYPE_CONDITIONAL
        )
    }

    /// Structural containers are fully materialized at submission time
    /// and never scheduled themselves.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.task_type.as_str(),
            TASK_TYPE_CHAIN | TASK_TYPE_FOR_LOOP
        )
    }
}

/// Task state derived from the task's most recent attempt and its
/// dependency situation; not stored, always recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Ready,
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Retry cap exhausted; terminal and operator-visible.
    Blocked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AttemptStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Queued => "QUEUED",
            AttemptStatus::Running => "RUNNING",
            AttemptStatus::Succeeded => "SUCCEEDED",
            AttemptStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Sqlite> for AttemptStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for AttemptStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "QUEUED" => Ok(AttemptStatus::Queued),
            "RUNNING" => Ok(AttemptStatus::Running),
            "SUCCEEDED" => Ok(AttemptStatus::Succeeded),
            "FAILED" => Ok(AttemptStatus::Failed),
            _ => Err(format!("Invalid attempt status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for AttemptStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// One execution of a task. A task may accumulate several attempts
/// over time; at most one of them is queued or running at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingAttempt {
    pub id: i64,
    pub task_id: i64,
    pub status: AttemptStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub latest_heartbeat: Option<DateTime<Utc>>,
    /// Hostname of the worker that claimed this attempt.
    pub host: Option<String>,
    pub error_fail: bool,
    pub error_text: Option<String>,
    /// Derived from the QC flags of this attempt's product versions;
    /// recomputed on every QC write, never set directly.
    pub all_products_passed_qc: Option<bool>,
    /// Set by the QC collaborator once every output has been inspected.
    pub qc_complete: bool,
    pub run_time_wall_clock: Option<f64>,
    pub run_time_cpu: Option<f64>,
}

impl SchedulingAttempt {
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, AttemptStatus::Queued | AttemptStatus::Running)
    }
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            AttemptStatus::Succeeded | AttemptStatus::Failed
        )
    }
    pub fn is_successful(&self) -> bool {
        matches!(self.status, AttemptStatus::Succeeded)
    }

    /// An attempt only counts for downstream readiness once it has
    /// succeeded and QC has inspected all of its outputs.
    pub fn is_usable_downstream(&self) -> bool {
        self.is_successful() && self.qc_complete && self.all_products_passed_qc != Some(false)
    }
}

/// A declared file artifact, owned by exactly one generating task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProduct {
    pub id: i64,
    pub generator_task: i64,
    pub directory: String,
    pub filename: String,
    /// Category tag matching a downstream task's declared input need,
    /// e.g. "lightcurve" or "periodogram".
    pub semantic_type: String,
    pub mime_type: Option<String>,
    pub planned_at: DateTime<Utc>,
}

/// One physical realization of a file product, written by one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProductVersion {
    pub id: i64,
    pub product_id: i64,
    pub attempt_id: i64,
    /// Name under which the file is stored in the file repository.
    pub repository_id: String,
    pub checksum: Option<String>,
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// None until QC has inspected this version.
    pub passed_qc: Option<bool>,
}

/// A typed key/value fact attached to a task, attempt, product or
/// product version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Str(s) => s.parse().ok(),
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            MetadataValue::Float(_) => None,
        }
    }
    pub fn to_display_string(&self) -> String {
        match self {
            MetadataValue::Float(v) => v.to_string(),
            MetadataValue::Str(s) => s.clone(),
        }
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Str(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub keyword: String,
    pub value: MetadataValue,
    pub recorded_at: DateTime<Utc>,
}

impl MetadataItem {
    pub fn new<K: Into<String>, V: Into<MetadataValue>>(keyword: K, value: V) -> Self {
        Self {
            keyword: keyword.into(),
            value: value.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// The two metadata-dependency edge kinds have different resolution
/// scopes (sibling vs. descendant) and are kept distinct on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataRequestKind {
    #[serde(rename = "sibling")]
    Sibling,
    #[serde(rename = "child")]
    Child,
}

impl MetadataRequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataRequestKind::Sibling => "sibling",
            MetadataRequestKind::Child => "child",
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for MetadataRequestKind {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for MetadataRequestKind {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        match s {
            "sibling" => Ok(MetadataRequestKind::Sibling),
            "child" => Ok(MetadataRequestKind::Child),
            _ => Err(format!("Invalid metadata request kind: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for MetadataRequestKind {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// A persisted metadata-dependency edge from a task to another task it
/// pulls metadata from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub task_id: i64,
    pub kind: MetadataRequestKind,
    pub referenced_task_id: Option<i64>,
    pub referenced_name: String,
}

/// Everything a worker needs to execute a claimed attempt; all
/// descriptor expressions are already resolved to literal values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub attempt_id: i64,
    pub task_id: i64,
    pub task_type: String,
    pub task_name: Option<String>,
    pub job_name: Option<String>,
    pub working_directory: String,
    pub inputs: Vec<FileProduct>,
    pub outputs: Vec<FileProduct>,
    pub metadata: HashMap<String, MetadataValue>,
    /// Metadata pulled from the tasks this one declared
    /// `requires_metadata_from` on, keyed by referenced task name.
    pub requested_metadata: HashMap<String, HashMap<String, MetadataValue>>,
}

/// Wall-clock and CPU run times reported by a worker on finish.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunTimes {
    pub wall_clock: Option<f64>,
    pub cpu: Option<f64>,
}

/// Descriptor of a registered output file, as reported by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileDescriptor {
    pub repository_id: String,
    pub checksum: Option<String>,
    pub size_bytes: Option<i64>,
}

/// A task joined with the summary of its scheduling history, used by
/// the scheduler sweep to apply the retry policy without extra
/// round-trips.
#[derive(Debug, Clone)]
pub struct TaskSchedulingInfo {
    pub task: Task,
    pub attempt_count: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

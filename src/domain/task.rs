//! Envelopes for the queue-based request/response protocol with the external
//! worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work submitted to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Alert,
    Backtest,
    Screening,
    CreateStrategy,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Alert => "alert",
            TaskKind::Backtest => "backtest",
            TaskKind::Screening => "screening",
            TaskKind::CreateStrategy => "create_strategy",
        }
    }

    /// Name of the durable work queue for this kind.
    pub fn queue_name(&self) -> String {
        format!("{}_queue", self.as_str())
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task envelope pushed onto the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub task_type: TaskKind,
    pub args: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl TaskEnvelope {
    pub fn new(task_id: String, task_type: TaskKind, args: serde_json::Value) -> Self {
        Self {
            task_id,
            task_type,
            args,
            created_at: Utc::now(),
            priority: None,
        }
    }
}

/// Status carried by a result-topic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Progress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Progress messages never terminate a wait.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Message published by workers on the result topic. Terminal messages carry
/// either a kind-specific `result` payload or a structured error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Arguments of an `alert` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTaskArgs {
    pub strategy_id: i64,
    pub user_id: i64,
    /// Symbols to evaluate; omitted for sentinel-universe submissions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
}

/// A matched instance reported by the worker. Only `symbol` is interpreted by
/// the engine; the rest of the object is carried through to the alert log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedInstance {
    pub symbol: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Structured worker error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Typed payload of a completed `alert` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTaskResult {
    pub success: bool,
    #[serde(default)]
    pub instances: Vec<MatchedInstance>,
    /// Symbols the strategy code actually referenced; used to refine the
    /// strategy's universe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::JobId;

pub type OutboxId = Uuid;

/// One handler result. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    #[schema(value_type = String)]
    pub id: OutboxId,
    #[schema(value_type = String)]
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

use serde::{Deserialize, Serialize};

/// One persisted prompt/output pair. Rows are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GenerationRecord {
    pub id: i64,
    pub prompt: String,
    pub generated_text: String,
    /// RFC 3339 timestamp assigned at insert time.
    pub created_at: String,
}

// ============================================================
// Layer 3 - Core Traits (Abstractions)
// ============================================================
// The application layer only talks to these traits, so the
// concrete record source (local file, hub download, in-memory
// test fixture) can change without touching the pipeline.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;
use crate::domain::record::SqlRecord;

// ─── RecordSource ─────────────────────────────────────────────────────────────
/// Any component that can produce text-to-SQL records.
///
/// Implementations:
///   - DatasetLoader → local JSON / JSONL file or hub dataset file
pub trait RecordSource {
    /// Load every record selected by this source, in source order.
    fn load_records(&self) -> Result<Vec<SqlRecord>>;
}

// ─── SqlGenerator ─────────────────────────────────────────────────────────────
/// Any component that can turn a schema + question into SQL.
///
/// Implementations:
///   - GenerateUseCase → runs the (merged) model autoregressively
pub trait SqlGenerator {
    fn generate_sql(&self, context: &str, question: &str) -> Result<String>;
}

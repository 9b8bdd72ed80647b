// ============================================================
// Layer 3 - SqlRecord Domain Type
// ============================================================
// One row of a text-to-SQL dataset:
//   - context:  the CREATE TABLE statements describing the schema
//   - question: a natural language question about that schema
//   - answer:   the SQL query that answers the question
//
// Example:
//   context:  "CREATE TABLE head (age INTEGER)"
//   question: "How many heads of the departments are older than 56 ?"
//   answer:   "SELECT COUNT(*) FROM head WHERE age > 56"
//
// Extra fields in the source file are ignored by serde, so the
// same struct reads any dataset that carries these three columns.
//
// Reference: Rust Book §5 (Structs and Methods)

use serde::{Deserialize, Serialize};

/// A labelled text-to-SQL example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlRecord {
    /// Schema the question is asked against
    pub context: String,

    /// Natural language question
    pub question: String,

    /// Reference SQL query
    pub answer: String,
}

#[cfg(test)]
impl SqlRecord {
    pub fn new(
        context:  impl Into<String>,
        question: impl Into<String>,
        answer:   impl Into<String>,
    ) -> Self {
        Self {
            context:  context.into(),
            question: question.into(),
            answer:   answer.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialise_ignores_extra_fields() {
        let json = r#"{"answer":"SELECT 1","question":"q","context":"c","source":"spider"}"#;
        let rec: SqlRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec, SqlRecord::new("c", "q", "SELECT 1"));
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let json = r#"{"question":"q","context":"c"}"#;
        assert!(serde_json::from_str::<SqlRecord>(json).is_err());
    }
}

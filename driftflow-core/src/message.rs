//! The schema-change event model.

/// A schema-change event captured from an upstream database, on its way to a
/// sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEvent {
    /// Database/schema the change applies to.
    pub schema: String,
    /// Table the change applies to; `None` for database-level statements.
    pub table: Option<String>,
    pub event_type: SchemaEventType,
    /// The DDL statement text.
    pub query: String,
    /// Commit timestamp of the change, epoch time in milliseconds.
    pub commit_ts_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaEventType {
    Create,
    Alter,
    Drop,
    Rename,
    Truncate,
    Other,
}

impl SchemaEventType {
    /// Classifies a DDL statement by its leading keyword.
    pub fn classify(query: &str) -> SchemaEventType {
        let keyword = query
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();
        match keyword.as_str() {
            "CREATE" => SchemaEventType::Create,
            "ALTER" => SchemaEventType::Alter,
            "DROP" => SchemaEventType::Drop,
            "RENAME" => SchemaEventType::Rename,
            "TRUNCATE" => SchemaEventType::Truncate,
            _ => SchemaEventType::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_statements() {
        assert_eq!(
            SchemaEventType::classify("CREATE TABLE t (id INT)"),
            SchemaEventType::Create
        );
        assert_eq!(
            SchemaEventType::classify("  alter table t add column c int"),
            SchemaEventType::Alter
        );
        assert_eq!(
            SchemaEventType::classify("DROP DATABASE inventory"),
            SchemaEventType::Drop
        );
        assert_eq!(
            SchemaEventType::classify("RENAME TABLE a TO b"),
            SchemaEventType::Rename
        );
        assert_eq!(
            SchemaEventType::classify("TRUNCATE t"),
            SchemaEventType::Truncate
        );
        assert_eq!(
            SchemaEventType::classify("GRANT SELECT ON t TO reader"),
            SchemaEventType::Other
        );
        assert_eq!(SchemaEventType::classify(""), SchemaEventType::Other);
    }
}

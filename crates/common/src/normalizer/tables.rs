//! Relational rows produced by normalization

use crate::errors::{AppError, Result};
use serde::Serialize;

/// A row type with a fixed column header
pub trait TableRow: Serialize {
    const HEADER: &'static [&'static str];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub job_id: u64,
    pub title: String,
    pub disclosure: String,
    /// Empty for successful replies
    pub error: String,
}

impl TableRow for SourceRow {
    const HEADER: &'static [&'static str] = &["source_id", "job_id", "title", "disclosure", "error"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRow {
    pub entity_id: String,
    pub org_name: String,
    pub is_funder: bool,
}

impl TableRow for EntityRow {
    const HEADER: &'static [&'static str] = &["entity_id", "org_name", "is_funder"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationshipTypeRow {
    pub relationship_type_id: String,
    pub relationship_type: String,
}

impl TableRow for RelationshipTypeRow {
    const HEADER: &'static [&'static str] = &["relationship_type_id", "relationship_type"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorRow {
    pub author_id: String,
    pub name: String,
    pub affiliation: String,
    pub email: String,
}

impl TableRow for AuthorRow {
    const HEADER: &'static [&'static str] = &["author_id", "name", "affiliation", "email"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyResultRow {
    pub res_id: String,
    pub source_id: String,
    pub entity_id: String,
    pub relationship_type_id: String,
}

impl TableRow for StudyResultRow {
    const HEADER: &'static [&'static str] = &["res_id", "source_id", "entity_id", "relationship_type_id"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorResultRow {
    pub res_id: String,
    pub source_id: String,
    pub author_id: String,
    pub entity_id: String,
    pub relationship_type_id: String,
}

impl TableRow for AuthorResultRow {
    const HEADER: &'static [&'static str] = &[
        "res_id",
        "source_id",
        "author_id",
        "entity_id",
        "relationship_type_id",
    ];
}

/// Normalized study channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudyTables {
    pub sources: Vec<SourceRow>,
    pub entities: Vec<EntityRow>,
    pub relationship_types: Vec<RelationshipTypeRow>,
    pub results: Vec<StudyResultRow>,
}

/// Normalized author channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorTables {
    pub sources: Vec<SourceRow>,
    pub authors: Vec<AuthorRow>,
    pub entities: Vec<EntityRow>,
    pub relationship_types: Vec<RelationshipTypeRow>,
    pub results: Vec<AuthorResultRow>,
}

/// Serialize rows as CSV. The header is written even for an empty table.
pub fn to_csv<T: TableRow>(rows: &[T]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    writer.write_record(T::HEADER).map_err(write_error)?;
    for row in rows {
        writer.serialize(row).map_err(write_error)?;
    }

    writer.into_inner().map_err(|e| AppError::Internal {
        message: format!("Failed to flush CSV writer: {}", e),
    })
}

fn write_error(e: csv::Error) -> AppError {
    AppError::Internal {
        message: format!("Failed to write CSV row: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_keeps_header() {
        let bytes = to_csv::<EntityRow>(&[]).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "entity_id,org_name,is_funder\n");
    }

    #[test]
    fn test_rows_follow_header() {
        let rows = vec![SourceRow {
            source_id: "src-0".into(),
            job_id: 0,
            title: "Paper, with comma".into(),
            disclosure: "None.".into(),
            error: String::new(),
        }];
        let text = String::from_utf8(to_csv(&rows).unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("source_id,job_id,title,disclosure,error"));
        assert_eq!(lines.next(), Some("src-0,0,\"Paper, with comma\",None.,"));
    }
}

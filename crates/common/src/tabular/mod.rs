//! Tabular upload parsing
//!
//! Reads author/disclosure rows from CSV or TSV and groups them by title.
//! One title group becomes one author-class job and one study-class job.

use crate::errors::{AppError, Result};
use crate::models::{AuthorPayload, StudyPayload};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use validator::Validate;

/// Input table encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    #[default]
    Csv,
    Tsv,
}

impl TableFormat {
    fn delimiter(&self) -> u8 {
        match self {
            TableFormat::Csv => b',',
            TableFormat::Tsv => b'\t',
        }
    }

    /// Guess the format from a Content-Type header value
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        match mime {
            "text/csv" | "application/csv" => Some(TableFormat::Csv),
            "text/tab-separated-values" | "text/tsv" => Some(TableFormat::Tsv),
            _ => None,
        }
    }
}

impl FromStr for TableFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(TableFormat::Csv),
            "tsv" => Ok(TableFormat::Tsv),
            other => Err(AppError::InvalidFormat {
                message: format!("Unsupported table format '{}'", other),
            }),
        }
    }
}

/// One uploaded row
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DisclosureRow {
    #[serde(rename = "Title", alias = "Article title")]
    #[validate(length(min = 1))]
    pub title: String,

    #[serde(rename = "Author Name")]
    pub author_name: String,

    #[serde(rename = "Affiliation", default)]
    pub affiliation: String,

    #[serde(rename = "Email", default)]
    pub email: String,

    #[serde(rename = "Disclosure Statement")]
    pub disclosure: String,
}

/// Every row sharing one title
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleGroup {
    pub title: String,
    pub disclosure: String,
    pub authors: Vec<String>,
    pub affiliations: Vec<String>,
    pub emails: Vec<String>,
}

impl TitleGroup {
    pub fn author_payload(&self) -> AuthorPayload {
        AuthorPayload {
            authors: self.authors.clone(),
            disclosure: self.disclosure.clone(),
            title: self.title.clone(),
            affiliations: self.affiliations.clone(),
            emails: self.emails.clone(),
        }
    }

    pub fn study_payload(&self) -> StudyPayload {
        StudyPayload {
            disclosure: self.disclosure.clone(),
            title: self.title.clone(),
        }
    }
}

/// Parse an uploaded table into rows
pub fn parse_rows(bytes: &[u8], format: TableFormat) -> Result<Vec<DisclosureRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(format.delimiter())
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for (index, record) in reader.deserialize::<DisclosureRow>().enumerate() {
        let row = record?;
        // Header is line 1; data rows start at line 2
        row.validate().map_err(|_| AppError::Validation {
            message: format!("Row {} has an empty Title", index + 2),
            field: Some("Title".to_string()),
        })?;
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(AppError::Validation {
            message: "Table contains no rows".to_string(),
            field: None,
        });
    }

    Ok(rows)
}

/// Group rows by title in lexicographic title order.
///
/// The group's disclosure is its first row's disclosure; rows without an
/// author name contribute nothing to the author columns.
pub fn group_by_title(rows: Vec<DisclosureRow>) -> Vec<TitleGroup> {
    let mut groups: BTreeMap<String, TitleGroup> = BTreeMap::new();

    for row in rows {
        let group = groups.entry(row.title.clone()).or_insert_with(|| TitleGroup {
            title: row.title.clone(),
            disclosure: row.disclosure.clone(),
            authors: Vec::new(),
            affiliations: Vec::new(),
            emails: Vec::new(),
        });

        if !row.author_name.is_empty() {
            group.authors.push(row.author_name);
            group.affiliations.push(row.affiliation);
            group.emails.push(row.email);
        }
    }

    groups.into_values().collect()
}

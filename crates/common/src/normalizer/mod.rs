//! Normalization of collected replies into relational tables
//!
//! Results are ordered by job id before anything else, so the output does
//! not depend on arrival order. Synthetic ids are then handed out in
//! first-seen order over that sequence, each family counting from zero:
//! `src-N`, `ent-N`, `rel-N`, `auth-N`, `res-N`.
//!
//! The first pass registers every source, organization, relationship type
//! and author; the second emits result rows and only looks ids up.

pub mod funding;
pub mod tables;

pub use funding::{FundingLookup, KeywordFundingLookup};
pub use tables::{
    to_csv, AuthorResultRow, AuthorRow, AuthorTables, EntityRow, RelationshipTypeRow, SourceRow,
    StudyResultRow, StudyTables, TableRow,
};

use crate::errors::{AppError, Result};
use crate::models::{
    AuthorPayload, AuthorResult, Channel, JobPayload, OrganizationRelationships, ResultEnvelope,
    ResultPayload, StudyResult,
};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Hands out `prefix-N` ids in first-seen order
struct IdAssigner<K> {
    prefix: &'static str,
    ids: HashMap<K, String>,
    order: Vec<K>,
}

impl<K: Eq + Hash + Clone> IdAssigner<K> {
    fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            ids: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn assign(&mut self, key: K) -> String {
        if let Some(id) = self.ids.get(&key) {
            return id.clone();
        }
        let id = format!("{}-{}", self.prefix, self.order.len());
        self.ids.insert(key.clone(), id.clone());
        self.order.push(key);
        id
    }

    fn get(&self, key: &K) -> Result<&str> {
        self.ids.get(key).map(String::as_str).ok_or_else(|| AppError::Internal {
            message: format!("{} id missing for a key registered in the first pass", self.prefix),
        })
    }

    /// Keys with their ids, in assignment order
    fn entries(&self) -> impl Iterator<Item = (&K, &str)> {
        self.order
            .iter()
            .map(move |k| (k, self.ids.get(k).map(String::as_str).unwrap_or_default()))
    }
}

/// Author identity: `(name, affiliation, email)`
type AuthorKey = (String, String, String);

/// Every author row of a source, by column position
fn source_authors(source: &AuthorPayload) -> impl Iterator<Item = AuthorKey> + '_ {
    source.authors.iter().enumerate().map(|(i, name)| {
        (
            name.clone(),
            source.affiliations.get(i).cloned().unwrap_or_default(),
            source.emails.get(i).cloned().unwrap_or_default(),
        )
    })
}

/// Resolve a reply's author name against its source columns.
///
/// A name the source lists more than once resolves to its first row; names
/// the source does not list get an empty affiliation and email.
fn author_key(source: &AuthorPayload, name: &str) -> AuthorKey {
    match source.authors.iter().position(|a| a == name) {
        Some(i) => (
            name.to_string(),
            source.affiliations.get(i).cloned().unwrap_or_default(),
            source.emails.get(i).cloned().unwrap_or_default(),
        ),
        None => (name.to_string(), String::new(), String::new()),
    }
}

fn sorted_by_id<'a>(results: &'a [ResultEnvelope], channel: Channel) -> Result<Vec<&'a ResultEnvelope>> {
    if let Some(stray) = results.iter().find(|r| r.channel() != channel) {
        return Err(AppError::Internal {
            message: format!(
                "{} result {} passed to the {} normalizer",
                stray.channel(),
                stray.id,
                channel
            ),
        });
    }
    let mut sorted: Vec<&ResultEnvelope> = results.iter().collect();
    sorted.sort_by_key(|r| r.id);
    Ok(sorted)
}

fn source_row(source_id: String, result: &ResultEnvelope) -> SourceRow {
    SourceRow {
        source_id,
        job_id: result.id,
        title: result.source.title().to_string(),
        disclosure: result.source.disclosure().to_string(),
        error: result.error().unwrap_or_default().to_string(),
    }
}

fn register_organizations(
    organizations: &[OrganizationRelationships],
    entities: &mut IdAssigner<String>,
    relationship_types: &mut IdAssigner<String>,
) {
    for org in organizations {
        entities.assign(org.org_name.clone());
        for rel in &org.relationships {
            relationship_types.assign(rel.relationship_type.clone());
        }
    }
}

fn entity_rows(entities: &IdAssigner<String>, funding: &dyn FundingLookup) -> Vec<EntityRow> {
    entities
        .entries()
        .map(|(name, id)| EntityRow {
            entity_id: id.to_string(),
            org_name: name.clone(),
            is_funder: funding.is_funded(name),
        })
        .collect()
}

fn relationship_type_rows(relationship_types: &IdAssigner<String>) -> Vec<RelationshipTypeRow> {
    relationship_types
        .entries()
        .map(|(name, id)| RelationshipTypeRow {
            relationship_type_id: id.to_string(),
            relationship_type: name.clone(),
        })
        .collect()
}

fn study_result(result: &ResultEnvelope) -> Result<Option<&StudyResult>> {
    match result.payload() {
        None => Ok(None),
        Some(ResultPayload::Study(r)) => Ok(Some(r)),
        Some(ResultPayload::Author(_)) => Err(AppError::Internal {
            message: format!("study result {} carries an author payload", result.id),
        }),
    }
}

fn author_result(result: &ResultEnvelope) -> Result<Option<(&AuthorPayload, &AuthorResult)>> {
    let source = match &result.source {
        JobPayload::Author(source) => source,
        JobPayload::Study(_) => {
            return Err(AppError::Internal {
                message: format!("author result {} carries a study source", result.id),
            })
        }
    };
    match result.payload() {
        None => Ok(None),
        Some(ResultPayload::Author(r)) => Ok(Some((source, r))),
        Some(ResultPayload::Study(_)) => Err(AppError::Internal {
            message: format!("author result {} carries a study payload", result.id),
        }),
    }
}

/// Builds the relational tables for each channel
#[derive(Clone)]
pub struct Normalizer {
    funding: Arc<dyn FundingLookup>,
}

impl Normalizer {
    pub fn new(funding: Arc<dyn FundingLookup>) -> Self {
        Self { funding }
    }

    /// Normalizer with the default keyword funding lookup
    pub fn standard() -> Result<Self> {
        Ok(Self::new(Arc::new(KeywordFundingLookup::standard()?)))
    }

    /// Normalize the study channel
    pub fn normalize_study(&self, results: &[ResultEnvelope]) -> Result<StudyTables> {
        let sorted = sorted_by_id(results, Channel::Study)?;

        let mut sources = IdAssigner::new("src");
        let mut entities = IdAssigner::new("ent");
        let mut relationship_types = IdAssigner::new("rel");
        let mut source_rows = Vec::with_capacity(sorted.len());

        for (index, result) in sorted.iter().enumerate() {
            let source_id = sources.assign(index);
            source_rows.push(source_row(source_id, result));
            if let Some(payload) = study_result(result)? {
                register_organizations(&payload.organizations, &mut entities, &mut relationship_types);
            }
        }

        let mut results_out = Vec::new();
        for (index, result) in sorted.iter().enumerate() {
            let Some(payload) = study_result(result)? else {
                continue;
            };
            let source_id = sources.get(&index)?;
            for org in &payload.organizations {
                let entity_id = entities.get(&org.org_name)?;
                for rel in &org.relationships {
                    results_out.push(StudyResultRow {
                        res_id: format!("res-{}", results_out.len()),
                        source_id: source_id.to_string(),
                        entity_id: entity_id.to_string(),
                        relationship_type_id: relationship_types.get(&rel.relationship_type)?.to_string(),
                    });
                }
            }
        }

        Ok(StudyTables {
            sources: source_rows,
            entities: entity_rows(&entities, self.funding.as_ref()),
            relationship_types: relationship_type_rows(&relationship_types),
            results: results_out,
        })
    }

    /// Normalize the author channel
    pub fn normalize_author(&self, results: &[ResultEnvelope]) -> Result<AuthorTables> {
        let sorted = sorted_by_id(results, Channel::Author)?;

        let mut sources = IdAssigner::new("src");
        let mut authors: IdAssigner<AuthorKey> = IdAssigner::new("auth");
        let mut entities = IdAssigner::new("ent");
        let mut relationship_types = IdAssigner::new("rel");
        let mut source_rows = Vec::with_capacity(sorted.len());

        for (index, result) in sorted.iter().enumerate() {
            let source_id = sources.assign(index);
            source_rows.push(source_row(source_id, result));

            let Some((source, payload)) = author_result(result)? else {
                continue;
            };
            for key in source_authors(source) {
                authors.assign(key);
            }
            for author in &payload.authors {
                authors.assign(author_key(source, &author.author_name));
                register_organizations(&author.organizations, &mut entities, &mut relationship_types);
            }
        }

        let mut results_out = Vec::new();
        for (index, result) in sorted.iter().enumerate() {
            let Some((source, payload)) = author_result(result)? else {
                continue;
            };
            let source_id = sources.get(&index)?;
            for author in &payload.authors {
                let author_id = authors.get(&author_key(source, &author.author_name))?;
                for org in &author.organizations {
                    let entity_id = entities.get(&org.org_name)?;
                    for rel in &org.relationships {
                        results_out.push(AuthorResultRow {
                            res_id: format!("res-{}", results_out.len()),
                            source_id: source_id.to_string(),
                            author_id: author_id.to_string(),
                            entity_id: entity_id.to_string(),
                            relationship_type_id: relationship_types
                                .get(&rel.relationship_type)?
                                .to_string(),
                        });
                    }
                }
            }
        }

        let author_rows = authors
            .entries()
            .map(|((name, affiliation, email), id)| AuthorRow {
                author_id: id.to_string(),
                name: name.clone(),
                affiliation: affiliation.clone(),
                email: email.clone(),
            })
            .collect();

        Ok(AuthorTables {
            sources: source_rows,
            authors: author_rows,
            entities: entity_rows(&entities, self.funding.as_ref()),
            relationship_types: relationship_type_rows(&relationship_types),
            results: results_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthorOrganizations, JobEnvelope, Relationship, SessionId, StudyPayload};

    fn org(name: &str, rels: &[&str]) -> OrganizationRelationships {
        OrganizationRelationships {
            org_name: name.to_string(),
            relationships: rels
                .iter()
                .map(|r| Relationship {
                    relationship_type: r.to_string(),
                })
                .collect(),
        }
    }

    fn study_reply(session: SessionId, id: u64, orgs: Vec<OrganizationRelationships>) -> ResultEnvelope {
        let job = JobEnvelope::new(
            session,
            id,
            JobPayload::Study(StudyPayload {
                disclosure: format!("disclosure {}", id),
                title: format!("Paper {}", id),
            }),
        );
        ResultEnvelope::success(&job, ResultPayload::Study(StudyResult { organizations: orgs }))
    }

    fn author_job(session: SessionId, id: u64) -> JobEnvelope {
        JobEnvelope::new(
            session,
            id,
            JobPayload::Author(AuthorPayload {
                authors: vec!["Dr. John Smith".into(), "Dr. Emily Johnson".into()],
                disclosure: "d".into(),
                title: format!("Paper {}", id),
                affiliations: vec!["MIT".into(), "Yale".into()],
                emails: vec!["js@mit.edu".into(), "ej@yale.edu".into()],
            }),
        )
    }

    /// Both listed authors of `author_job` report the same organization
    fn johnson_and_smith_report(org_name: &str) -> ResultPayload {
        ResultPayload::Author(AuthorResult {
            authors: vec![
                AuthorOrganizations {
                    author_name: "Dr. Emily Johnson".into(),
                    organizations: vec![org(org_name, &["Consulting fees"])],
                },
                AuthorOrganizations {
                    author_name: "Dr. John Smith".into(),
                    organizations: vec![org(org_name, &["Speakers bureau"])],
                },
            ],
        })
    }

    fn normalizer() -> Normalizer {
        Normalizer::standard().unwrap()
    }

    #[test]
    fn test_same_org_in_two_jobs_is_one_entity() {
        let session = SessionId::new();
        let results = vec![
            study_reply(session, 0, vec![org("National Cancer Institute", &["Research grant"])]),
            study_reply(session, 1, vec![org("National Cancer Institute", &["Travel support"])]),
        ];
        let tables = normalizer().normalize_study(&results).unwrap();

        assert_eq!(tables.entities.len(), 1);
        assert_eq!(tables.entities[0].entity_id, "ent-0");
        assert!(tables.entities[0].is_funder);
        assert_eq!(tables.relationship_types.len(), 2);
        assert_eq!(tables.results.len(), 2);
        assert!(tables.results.iter().all(|r| r.entity_id == "ent-0"));
        assert_ne!(tables.results[0].source_id, tables.results[1].source_id);
    }

    #[test]
    fn test_distinct_names_never_collapse() {
        let session = SessionId::new();
        let results = vec![study_reply(
            session,
            0,
            vec![org("Pfizer", &["Consulting fees"]), org("Pfizer Inc", &["Consulting fees"])],
        )];
        let tables = normalizer().normalize_study(&results).unwrap();
        assert_eq!(tables.entities.len(), 2);
        assert_eq!(tables.relationship_types.len(), 1);
    }

    #[test]
    fn test_ids_do_not_depend_on_arrival_order() {
        let session = SessionId::new();
        let a = study_reply(session, 0, vec![org("Wellcome Trust", &["Grant"])]);
        let b = study_reply(session, 1, vec![org("Pfizer", &["Consulting fees"])]);

        let n = normalizer();
        let forward = n.normalize_study(&[a.clone(), b.clone()]).unwrap();
        let reversed = n.normalize_study(&[b, a]).unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(forward.entities[0].org_name, "Wellcome Trust");
        assert_eq!(n.normalize_study(&[]).unwrap(), StudyTables::default());
    }

    #[test]
    fn test_normalizing_twice_yields_the_same_tables() {
        let session = SessionId::new();
        let study = vec![
            study_reply(session, 1, vec![org("Pfizer", &["Consulting fees"])]),
            study_reply(session, 0, vec![org("Wellcome Trust", &["Grant"]), org("Pfizer", &["Grant"])]),
        ];
        let author = vec![
            ResultEnvelope::success(&author_job(session, 1), johnson_and_smith_report("Pfizer")),
            ResultEnvelope::failure(&author_job(session, 0), crate::MALFORMED_CONTENT_ERROR),
        ];

        let n = normalizer();
        let first = n.normalize_study(&study).unwrap();
        assert_eq!(first.results.len(), 3);
        assert_eq!(first, n.normalize_study(&study).unwrap());

        let first = n.normalize_author(&author).unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first, n.normalize_author(&author).unwrap());
    }

    #[test]
    fn test_error_replies_get_sources_but_no_results() {
        let session = SessionId::new();
        let failed = ResultEnvelope::failure(&author_job(session, 0), crate::NOT_FINISHED_ERROR);
        let tables = normalizer().normalize_author(&[failed]).unwrap();
        assert_eq!(tables.sources.len(), 1);
        assert_eq!(tables.sources[0].error, crate::NOT_FINISHED_ERROR);
        assert!(tables.results.is_empty());
        assert!(tables.authors.is_empty());
    }

    #[test]
    fn test_author_rows_use_source_columns() {
        let session = SessionId::new();
        let payload = ResultPayload::Author(AuthorResult {
            authors: vec![
                AuthorOrganizations {
                    author_name: "Dr. Emily Johnson".into(),
                    organizations: vec![org("Pfizer", &["Consulting fees", "Speakers bureau"])],
                },
                AuthorOrganizations {
                    author_name: "Dr. Unlisted".into(),
                    organizations: vec![org("Pfizer", &["Consulting fees"])],
                },
            ],
        });
        let results = vec![
            ResultEnvelope::success(&author_job(session, 0), payload.clone()),
            ResultEnvelope::success(&author_job(session, 1), payload),
        ];
        let tables = normalizer().normalize_author(&results).unwrap();

        // Both sources list the same two authors; the unlisted one is added once
        assert_eq!(tables.authors.len(), 3);
        assert_eq!(tables.authors[0].name, "Dr. John Smith");
        assert_eq!(tables.authors[1].affiliation, "Yale");
        assert_eq!(tables.authors[2].name, "Dr. Unlisted");
        assert_eq!(tables.authors[2].email, "");

        assert_eq!(tables.entities.len(), 1);
        assert_eq!(tables.results.len(), 6);
        assert_eq!(tables.results[0].author_id, "auth-1");
        assert_eq!(tables.results[2].author_id, "auth-2");
        assert_eq!(tables.results[5].res_id, "res-5");
    }

    #[test]
    fn test_same_name_different_rows_are_distinct_authors() {
        let session = SessionId::new();
        let job = JobEnvelope::new(
            session,
            0,
            JobPayload::Author(AuthorPayload {
                authors: vec!["J. Smith".into(), "J. Smith".into()],
                disclosure: "d".into(),
                title: "Paper 0".into(),
                affiliations: vec!["MIT".into(), "Yale".into()],
                emails: vec!["a@mit.edu".into(), "b@yale.edu".into()],
            }),
        );
        let payload = ResultPayload::Author(AuthorResult {
            authors: vec![AuthorOrganizations {
                author_name: "J. Smith".into(),
                organizations: vec![org("Pfizer", &["Consulting fees"])],
            }],
        });
        let tables = normalizer()
            .normalize_author(&[ResultEnvelope::success(&job, payload)])
            .unwrap();

        assert_eq!(tables.authors.len(), 2);
        assert_eq!(tables.authors[0].affiliation, "MIT");
        assert_eq!(tables.authors[1].affiliation, "Yale");
        assert_eq!(tables.authors[1].author_id, "auth-1");
        // An ambiguous reply name resolves to the first matching row
        assert_eq!(tables.results.len(), 1);
        assert_eq!(tables.results[0].author_id, "auth-0");
    }

    #[test]
    fn test_shared_org_is_one_entity_on_both_channels() {
        let session = SessionId::new();
        let author = vec![
            ResultEnvelope::success(&author_job(session, 0), johnson_and_smith_report("Pfizer")),
            ResultEnvelope::success(&author_job(session, 1), johnson_and_smith_report("Pfizer")),
        ];
        let study = vec![
            study_reply(session, 0, vec![org("Pfizer", &["Consulting fees"])]),
            study_reply(session, 1, vec![org("Pfizer", &["Speakers bureau"])]),
        ];

        let n = normalizer();
        let author_tables = n.normalize_author(&author).unwrap();
        assert_eq!(author_tables.entities.len(), 1);
        assert_eq!(author_tables.entities[0].entity_id, "ent-0");
        assert_eq!(author_tables.results.len(), 4);
        assert!(author_tables.results.iter().all(|r| r.entity_id == "ent-0"));
        let author_ids: std::collections::HashSet<_> =
            author_tables.results.iter().map(|r| r.author_id.as_str()).collect();
        assert_eq!(author_ids.len(), 2);

        let study_tables = n.normalize_study(&study).unwrap();
        assert_eq!(study_tables.entities, author_tables.entities);
        assert!(study_tables.results.iter().all(|r| r.entity_id == "ent-0"));

        // One list mixing both channels is rejected
        let mixed: Vec<_> = author.into_iter().chain(study).collect();
        assert!(matches!(n.normalize_author(&mixed), Err(AppError::Internal { .. })));
        assert!(matches!(n.normalize_study(&mixed), Err(AppError::Internal { .. })));
    }

    #[test]
    fn test_wrong_channel_is_an_invariant_violation() {
        let session = SessionId::new();
        let results = vec![study_reply(session, 0, vec![])];
        let err = normalizer().normalize_author(&results).unwrap_err();
        assert!(matches!(err, AppError::Internal { .. }));
    }
}

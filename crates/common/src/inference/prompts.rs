//! Channel-specific prompts
//!
//! Both prompts ask for a single JSON object so the reply can be decoded
//! straight into a [`ResultPayload`](crate::models::ResultPayload).

use super::InferenceRequest;
use crate::models::{AuthorPayload, Channel, JobPayload, StudyPayload};
use std::fmt::Write as _;

/// Relationship types the model is steered towards
pub const RELATIONSHIP_TYPES: &[&str] = &[
    "Received research grant funds directly",
    "Received research grant funds indirectly",
    "Received research materials",
    "Received travel support",
    "Received honorarium",
    "Consulting fees",
    "Speakers bureau",
    "Employee of",
    "Board member",
    "Holds stock or equity",
    "Patent license",
    "Personal fees",
    "Other/Unspecified",
];

const STUDY_SYSTEM: &str = "You extract funding and conflict-of-interest relationships between a \
research study and organizations from its disclosure statement. Answer with one JSON object of the \
form {\"organizations\": [{\"org_name\": string, \"relationships\": [{\"relationship_type\": string}]}]}. \
Use the organization name as written. Return an empty list when no organization is named.";

const AUTHOR_SYSTEM: &str = "You extract relationships between individual authors and organizations \
from a disclosure statement. Answer with one JSON object of the form {\"authors\": [{\"author_name\": \
string, \"organizations\": [{\"org_name\": string, \"relationships\": [{\"relationship_type\": string}]}]}]}. \
Only use author names from the provided list. Omit authors with no relationships.";

/// Build the prompt for a job payload
pub fn build_prompt(payload: &JobPayload) -> InferenceRequest {
    match payload {
        JobPayload::Author(p) => build_author_prompt(p),
        JobPayload::Study(p) => build_study_prompt(p),
    }
}

/// Study prompt, built from the disclosure and title
pub fn build_study_prompt(payload: &StudyPayload) -> InferenceRequest {
    let mut user = String::new();
    let _ = writeln!(user, "Title: {}", payload.title);
    let _ = writeln!(user, "Relationship types: {}", RELATIONSHIP_TYPES.join("; "));
    let _ = writeln!(user, "Disclosure statement:");
    user.push_str(&payload.disclosure);

    InferenceRequest {
        channel: Channel::Study,
        system: STUDY_SYSTEM.to_string(),
        user,
    }
}

/// Author prompt, built from the author list and the disclosure
pub fn build_author_prompt(payload: &AuthorPayload) -> InferenceRequest {
    let mut user = String::new();
    let _ = writeln!(user, "Title: {}", payload.title);
    let _ = writeln!(user, "Authors:");
    for author in &payload.authors {
        let _ = writeln!(user, "- {}", author);
    }
    let _ = writeln!(user, "Relationship types: {}", RELATIONSHIP_TYPES.join("; "));
    let _ = writeln!(user, "Disclosure statement:");
    user.push_str(&payload.disclosure);

    InferenceRequest {
        channel: Channel::Author,
        system: AUTHOR_SYSTEM.to_string(),
        user,
    }
}

//! Domain models exchanged between the emitter, workers and collector

pub mod job;
pub mod result;
pub mod session;

pub use job::{AuthorPayload, JobEnvelope, JobPayload, StudyPayload};
pub use result::{
    AuthorOrganizations, AuthorResult, OrganizationRelationships, Relationship, ReplyOutcome,
    ResultEnvelope, ResultPayload, StudyResult,
};
pub use session::SessionId;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppError;

/// Job class. Each class has its own job topic; replies share one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Author,
    Study,
}

impl Channel {
    /// Both job classes, in emission order
    pub const ALL: [Channel; 2] = [Channel::Author, Channel::Study];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Author => "author",
            Channel::Study => "study",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author" => Ok(Channel::Author),
            "study" => Ok(Channel::Study),
            other => Err(AppError::InvalidFormat {
                message: format!("Unknown channel '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(serde_json::to_string(&Channel::Author).unwrap(), "\"author\"");
        assert_eq!("study".parse::<Channel>().unwrap(), Channel::Study);
        assert!("authors".parse::<Channel>().is_err());
    }
}

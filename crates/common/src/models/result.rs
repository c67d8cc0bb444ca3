//! Result envelopes published on the shared reply topic

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Channel, JobEnvelope, JobPayload, SessionId};

/// One relationship between a study or author and an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_type: String,
}

/// An organization together with every relationship the disclosure names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRelationships {
    pub org_name: String,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

/// Parsed inference output for a study-class job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyResult {
    pub organizations: Vec<OrganizationRelationships>,
}

/// Organizations attributed to one named author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorOrganizations {
    pub author_name: String,
    #[serde(default)]
    pub organizations: Vec<OrganizationRelationships>,
}

/// Parsed inference output for an author-class job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorResult {
    pub authors: Vec<AuthorOrganizations>,
}

/// Parsed inference output, variant by channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResultPayload {
    Author(AuthorResult),
    Study(StudyResult),
}

impl ResultPayload {
    /// Decode inference content for the given channel
    pub fn from_value(channel: Channel, value: serde_json::Value) -> serde_json::Result<Self> {
        match channel {
            Channel::Author => serde_json::from_value(value).map(ResultPayload::Author),
            Channel::Study => serde_json::from_value(value).map(ResultPayload::Study),
        }
    }

    /// Decode raw inference content for the given channel
    pub fn parse(channel: Channel, content: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        Self::from_value(channel, value)
    }

    pub fn channel(&self) -> Channel {
        match self {
            ResultPayload::Author(_) => Channel::Author,
            ResultPayload::Study(_) => Channel::Study,
        }
    }
}

/// Either the parsed payload or the error a worker produced for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Payload(ResultPayload),
    Error(String),
}

/// One worker output, correlated to its job by `(channel, id)`.
///
/// On the wire exactly one of `payload` and `error` is non-null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEnvelope {
    pub session_id: SessionId,
    pub id: u64,
    pub source: JobPayload,
    pub outcome: ReplyOutcome,
}

impl ResultEnvelope {
    /// Successful reply for a job
    pub fn success(job: &JobEnvelope, payload: ResultPayload) -> Self {
        Self {
            session_id: job.session_id,
            id: job.id,
            source: job.payload.clone(),
            outcome: ReplyOutcome::Payload(payload),
        }
    }

    /// Error reply for a job
    pub fn failure(job: &JobEnvelope, error: impl Into<String>) -> Self {
        Self {
            session_id: job.session_id,
            id: job.id,
            source: job.payload.clone(),
            outcome: ReplyOutcome::Error(error.into()),
        }
    }

    pub fn channel(&self) -> Channel {
        self.source.channel()
    }

    /// Correlation key; ids are only unique within a channel
    pub fn key(&self) -> (Channel, u64) {
        (self.channel(), self.id)
    }

    pub fn payload(&self) -> Option<&ResultPayload> {
        match &self.outcome {
            ReplyOutcome::Payload(p) => Some(p),
            ReplyOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ReplyOutcome::Payload(_) => None,
            ReplyOutcome::Error(e) => Some(e),
        }
    }

    /// Encode for the transport
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode and validate a transport message
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Serialize)]
struct WireResult<'a> {
    session_id: SessionId,
    id: u64,
    channel: Channel,
    source: &'a JobPayload,
    payload: Option<&'a ResultPayload>,
    error: Option<&'a str>,
}

#[derive(Deserialize)]
struct RawResult {
    session_id: SessionId,
    id: u64,
    channel: Channel,
    source: serde_json::Value,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl Serialize for ResultEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireResult {
            session_id: self.session_id,
            id: self.id,
            channel: self.channel(),
            source: &self.source,
            payload: self.payload(),
            error: self.error(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResultEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawResult::deserialize(deserializer)?;
        let source = JobPayload::from_value(raw.channel, raw.source)
            .map_err(|e| D::Error::custom(format!("source does not match channel '{}': {}", raw.channel, e)))?;

        let outcome = match (raw.payload, raw.error) {
            (Some(payload), None) => {
                let payload = ResultPayload::from_value(raw.channel, payload).map_err(|e| {
                    D::Error::custom(format!("payload does not match channel '{}': {}", raw.channel, e))
                })?;
                ReplyOutcome::Payload(payload)
            }
            (None, Some(error)) => ReplyOutcome::Error(error),
            (Some(_), Some(_)) => {
                return Err(D::Error::custom("both payload and error are set"));
            }
            (None, None) => {
                return Err(D::Error::custom("neither payload nor error is set"));
            }
        };

        Ok(ResultEnvelope {
            session_id: raw.session_id,
            id: raw.id,
            source,
            outcome,
        })
    }
}

//! Job envelopes published on the per-class job topics

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Channel, SessionId};

/// Author-class job input: every author row of one title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorPayload {
    pub authors: Vec<String>,
    pub disclosure: String,
    pub title: String,
    #[serde(default)]
    pub affiliations: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
}

/// Study-class job input: the disclosure of one title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyPayload {
    pub disclosure: String,
    pub title: String,
}

/// Job input, discriminated by the envelope's `channel` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobPayload {
    Author(AuthorPayload),
    Study(StudyPayload),
}

impl JobPayload {
    /// Decode a payload for the given channel.
    ///
    /// Fails when the shape contradicts the tag: a study payload rejects
    /// author-only fields, an author payload requires `authors`.
    pub fn from_value(channel: Channel, value: serde_json::Value) -> serde_json::Result<Self> {
        match channel {
            Channel::Author => serde_json::from_value(value).map(JobPayload::Author),
            Channel::Study => serde_json::from_value(value).map(JobPayload::Study),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            JobPayload::Author(_) => Channel::Author,
            JobPayload::Study(_) => Channel::Study,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            JobPayload::Author(p) => &p.title,
            JobPayload::Study(p) => &p.title,
        }
    }

    pub fn disclosure(&self) -> &str {
        match self {
            JobPayload::Author(p) => &p.disclosure,
            JobPayload::Study(p) => &p.disclosure,
        }
    }
}

/// One unit of work. `id` is unique within its channel for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnvelope {
    pub session_id: SessionId,
    pub id: u64,
    pub payload: JobPayload,
}

impl JobEnvelope {
    pub fn new(session_id: SessionId, id: u64, payload: JobPayload) -> Self {
        Self { session_id, id, payload }
    }

    pub fn channel(&self) -> Channel {
        self.payload.channel()
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
struct WireJob<'a> {
    session_id: SessionId,
    id: u64,
    channel: Channel,
    payload: &'a JobPayload,
}

#[derive(Deserialize)]
struct RawJob {
    session_id: SessionId,
    id: u64,
    channel: Channel,
    payload: serde_json::Value,
}

impl Serialize for JobEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireJob {
            session_id: self.session_id,
            id: self.id,
            channel: self.channel(),
            payload: &self.payload,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JobEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawJob::deserialize(deserializer)?;
        let payload = JobPayload::from_value(raw.channel, raw.payload).map_err(|e| {
            D::Error::custom(format!("payload does not match channel '{}': {}", raw.channel, e))
        })?;
        Ok(JobEnvelope {
            session_id: raw.session_id,
            id: raw.id,
            payload,
        })
    }
}

//! Upload pipeline
//!
//! Parses an uploaded table, fans it out as author and study jobs and
//! records how many replies the session's collector must wait for.

use crate::collector::ReplyRouter;
use crate::emitter::{EmissionReport, JobEmitter};
use crate::errors::{AppError, Result};
use crate::models::{Channel, JobPayload, SessionId};
use crate::registry::SessionStore;
use crate::tabular::{self, TableFormat};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Synchronous answer to an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub session_id: SessionId,
    pub expected_total: u64,
    /// Author-class jobs published
    pub author_jobs: u64,
    /// Study-class jobs published
    pub study_jobs: u64,
    pub failed_publishes: u64,
}

/// Accepts uploads and starts their sessions
#[derive(Clone)]
pub struct UploadService {
    emitter: JobEmitter,
    registry: Arc<dyn SessionStore>,
    router: Arc<ReplyRouter>,
}

impl UploadService {
    pub fn new(emitter: JobEmitter, registry: Arc<dyn SessionStore>, router: Arc<ReplyRouter>) -> Self {
        Self {
            emitter,
            registry,
            router,
        }
    }

    /// Parse, emit and register one upload
    #[instrument(skip(self, bytes), fields(bytes = bytes.len(), format = ?format))]
    pub async fn submit(&self, bytes: &[u8], format: TableFormat) -> Result<UploadReceipt> {
        let rows = tabular::parse_rows(bytes, format)?;
        let groups = tabular::group_by_title(rows);

        let session_id = SessionId::new();
        self.router.open(session_id)?;

        match self.emit_and_register(session_id, &groups).await {
            Ok(receipt) => {
                info!(
                    session_id = %session_id,
                    titles = groups.len(),
                    expected_total = receipt.expected_total,
                    failed_publishes = receipt.failed_publishes,
                    "Upload accepted"
                );
                Ok(receipt)
            }
            Err(e) => {
                self.router.close(session_id);
                Err(e)
            }
        }
    }

    async fn emit_and_register(
        &self,
        session_id: SessionId,
        groups: &[tabular::TitleGroup],
    ) -> Result<UploadReceipt> {
        let author_payloads = groups
            .iter()
            .map(|g| JobPayload::Author(g.author_payload()))
            .collect();
        let study_payloads = groups
            .iter()
            .map(|g| JobPayload::Study(g.study_payload()))
            .collect();

        let author = self.emitter.emit(session_id, Channel::Author, author_payloads)?;
        let study = self.emitter.emit(session_id, Channel::Study, study_payloads)?;
        let (author, study) = tokio::join!(author.settle(), study.settle());

        let receipt = receipt(session_id, &author, &study);
        for (channel, report) in [(Channel::Author, &author), (Channel::Study, &study)] {
            for (id, reason) in &report.failed {
                error!(session_id = %session_id, channel = %channel, job_id = id, reason = %reason, "Job not published, excluded from total");
            }
        }

        if receipt.expected_total == 0 {
            return Err(AppError::Transport {
                message: format!("No job of session {} could be published", session_id),
            });
        }

        self.registry.create(session_id, receipt.expected_total).await?;
        Ok(receipt)
    }
}

fn receipt(session_id: SessionId, author: &EmissionReport, study: &EmissionReport) -> UploadReceipt {
    let author_jobs = author.published_count();
    let study_jobs = study.published_count();
    UploadReceipt {
        session_id,
        expected_total: author_jobs + study_jobs,
        author_jobs,
        study_jobs,
        failed_publishes: (author.failed.len() + study.failed.len()) as u64,
    }
}

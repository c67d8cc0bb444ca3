//! Output bundle packaging
//!
//! A bundle is a gzip-compressed tar archive holding the raw result lists,
//! the normalized tables of both channels and a `manifest.json` with a
//! SHA-256 checksum per file.

use crate::errors::{AppError, Result};
use crate::models::{ResultEnvelope, SessionId};
use crate::normalizer::{to_csv, AuthorTables, StudyTables};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const MANIFEST_FILE: &str = "manifest.json";
const COMPLETE_SUFFIX: &str = ".tar.gz";
const PARTIAL_SUFFIX: &str = "-partial.tar.gz";

/// Everything that goes into one bundle
pub struct BundleContents<'a> {
    pub session_id: SessionId,
    /// False for a stalled session's partial bundle
    pub complete: bool,
    pub expected_total: u64,
    pub study_results: &'a [ResultEnvelope],
    pub author_results: &'a [ResultEnvelope],
    pub study: &'a StudyTables,
    pub author: &'a AuthorTables,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Contents of `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub session_id: SessionId,
    pub complete: bool,
    pub expected_total: u64,
    pub received_total: u64,
    pub created_at: DateTime<Utc>,
    pub files: BTreeMap<String, ManifestFile>,
}

/// A bundle written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub manifest: Manifest,
}

/// File name for a session's bundle
pub fn bundle_name(session_id: SessionId, complete: bool) -> String {
    let suffix = if complete { COMPLETE_SUFFIX } else { PARTIAL_SUFFIX };
    format!("{}{}", session_id, suffix)
}

/// Reject names that could escape the bundle directory
pub fn validate_name(name: &str) -> Result<()> {
    let valid = name.ends_with(COMPLETE_SUFFIX)
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation {
            message: format!("Invalid bundle name '{}'", name),
            field: Some("name".to_string()),
        })
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn bundle_files(contents: &BundleContents<'_>) -> Result<Vec<(&'static str, Vec<u8>)>> {
    let study = contents.study;
    let author = contents.author;
    Ok(vec![
        ("study_results.json", serde_json::to_vec_pretty(contents.study_results)?),
        ("author_results.json", serde_json::to_vec_pretty(contents.author_results)?),
        ("study/sources.csv", to_csv(&study.sources)?),
        ("study/entities.csv", to_csv(&study.entities)?),
        ("study/relationship_types.csv", to_csv(&study.relationship_types)?),
        ("study/results.csv", to_csv(&study.results)?),
        ("author/sources.csv", to_csv(&author.sources)?),
        ("author/authors.csv", to_csv(&author.authors)?),
        ("author/entities.csv", to_csv(&author.entities)?),
        ("author/relationship_types.csv", to_csv(&author.relationship_types)?),
        ("author/results.csv", to_csv(&author.results)?),
    ])
}

/// Build the compressed archive in memory
pub fn build_archive(contents: &BundleContents<'_>) -> Result<(Vec<u8>, Manifest)> {
    let created_at = Utc::now();
    let mtime = created_at.timestamp().max(0) as u64;
    let files = bundle_files(contents)?;

    let checksums = files
        .iter()
        .map(|(name, data)| {
            let file = ManifestFile {
                sha256: sha256_hex(data),
                size_bytes: data.len() as u64,
            };
            (name.to_string(), file)
        })
        .collect();

    let manifest = Manifest {
        session_id: contents.session_id,
        complete: contents.complete,
        expected_total: contents.expected_total,
        received_total: (contents.study_results.len() + contents.author_results.len()) as u64,
        created_at,
        files: checksums,
    };
    let manifest_data = serde_json::to_vec_pretty(&manifest)?;

    let mut archive = Vec::new();
    {
        let encoder = GzEncoder::new(&mut archive, Compression::default());
        let mut tar = tar::Builder::new(encoder);

        let mut append = |name: &str, data: &[u8]| -> std::io::Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            header.set_cksum();
            tar.append_data(&mut header, name, data)
        };

        for (name, data) in &files {
            append(name, data)?;
        }
        append(MANIFEST_FILE, &manifest_data)?;

        tar.into_inner()?.finish()?;
    }

    Ok((archive, manifest))
}

/// Bundle directory on the local filesystem
#[derive(Debug, Clone)]
pub struct BundleStore {
    dir: PathBuf,
}

impl BundleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Package and write a bundle, replacing any previous file of that name
    pub async fn write(&self, contents: &BundleContents<'_>) -> Result<BundleInfo> {
        let name = bundle_name(contents.session_id, contents.complete);
        let (archive, manifest) = build_archive(contents)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        tokio::fs::write(&tmp, &archive).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(
            session_id = %contents.session_id,
            bundle = %name,
            size_bytes = archive.len(),
            complete = contents.complete,
            "Bundle written"
        );

        Ok(BundleInfo {
            name,
            path,
            size_bytes: archive.len() as u64,
            manifest,
        })
    }

    /// Read a bundle by name
    pub async fn open(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::BundleNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::HashMap;
    use std::io::Read;

    fn unpack(data: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        let mut files = HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).unwrap();
            files.insert(path, buf);
        }
        files
    }

    #[tokio::test]
    async fn test_empty_bundle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path());
        let session = SessionId::new();
        let study = StudyTables::default();
        let author = AuthorTables::default();

        let info = store
            .write(&BundleContents {
                session_id: session,
                complete: true,
                expected_total: 0,
                study_results: &[],
                author_results: &[],
                study: &study,
                author: &author,
            })
            .await
            .unwrap();
        assert_eq!(info.name, format!("{}.tar.gz", session));

        let data = store.open(&info.name).await.unwrap();
        let files = unpack(&data);
        assert_eq!(files.len(), 12);
        assert_eq!(files["study_results.json"], b"[]");
        assert!(files.contains_key("author/authors.csv"));

        let manifest: Manifest = serde_json::from_slice(&files[MANIFEST_FILE]).unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.files.len(), 11);
        assert_eq!(
            manifest.files["study/entities.csv"].sha256,
            sha256_hex(&files["study/entities.csv"])
        );
    }

    #[test]
    fn test_partial_bundle_name() {
        let session = SessionId::new();
        let name = bundle_name(session, false);
        assert!(name.ends_with("-partial.tar.gz"));
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("../etc/passwd.tar.gz").is_err());
        assert!(validate_name("a/b.tar.gz").is_err());
        assert!(validate_name("bundle.zip").is_err());
        assert!(validate_name(".hidden.tar.gz").is_err());
    }

    #[tokio::test]
    async fn test_missing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path());
        let err = store.open("nothing.tar.gz").await.unwrap_err();
        assert!(matches!(err, AppError::BundleNotFound { .. }));
    }
}

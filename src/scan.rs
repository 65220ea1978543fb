//! Post-download security scanning.
//!
//! Only files with a [`ScanVerdict::Safe`] verdict count as downloaded.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fault::{Fault, FaultKind};

/// Extensions of formats that can carry pickled Python code.
const PICKLE_EXTENSIONS: &[&str] = &["ckpt", "pt", "pth", "pkl", "bin"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanVerdict {
    Safe,
    Suspicious,
    Unsafe,
    Error,
}

impl ScanVerdict {
    #[must_use]
    pub fn is_safe(self) -> bool {
        self == Self::Safe
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub path: PathBuf,
    pub verdict: ScanVerdict,
    pub findings: Vec<String>,
    pub scanned_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read {path} for scanning: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Fault for ScanError {
    fn kind(&self) -> FaultKind {
        match self {
            Self::Io { source, .. } => Fault::kind(source),
        }
    }

    fn fault_name(&self) -> &'static str {
        "ScanError"
    }
}

/// Security scan collaborator.
#[async_trait]
pub trait SecurityScanner: Send + Sync {
    /// Inspects a finished download.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError`] when the scan itself could not run. A file that
    /// ran but looks bad is reported through the verdict instead.
    async fn scan(&self, path: &Path) -> Result<ScanReport, ScanError>;
}

/// Structural checks without content inspection.
///
/// Missing files are an error, empty files are unsafe. In strict mode,
/// pickle-capable formats are flagged as suspicious.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicScanner {
    strict: bool,
}

impl BasicScanner {
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

#[async_trait]
impl SecurityScanner for BasicScanner {
    async fn scan(&self, path: &Path) -> Result<ScanReport, ScanError> {
        let mut findings = Vec::new();

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "scanned file does not exist");
                return Ok(report(path, ScanVerdict::Error, vec!["file not found".to_string()]));
            }
            Err(source) => {
                return Err(ScanError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let verdict = if !metadata.is_file() {
            findings.push("not a regular file".to_string());
            ScanVerdict::Unsafe
        } else if metadata.len() == 0 {
            findings.push("file is empty".to_string());
            ScanVerdict::Unsafe
        } else if self.strict && is_pickle_format(path) {
            findings.push("pickle-based format can execute code on load".to_string());
            ScanVerdict::Suspicious
        } else {
            ScanVerdict::Safe
        };

        debug!(path = %path.display(), ?verdict, "scan complete");
        Ok(report(path, verdict, findings))
    }
}

fn is_pickle_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PICKLE_EXTENSIONS.iter().any(|p| ext.eq_ignore_ascii_case(p)))
}

fn report(path: &Path, verdict: ScanVerdict, findings: Vec<String>) -> ScanReport {
    ScanReport {
        path: path.to_path_buf(),
        verdict,
        findings,
        scanned_at: Utc::now(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_regular_file_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        tokio::fs::write(&path, b"weights").await.unwrap();

        let report = BasicScanner::new(true).scan(&path).await.unwrap();
        assert_eq!(report.verdict, ScanVerdict::Safe);
        assert!(report.findings.is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.safetensors");
        tokio::fs::write(&empty, b"").await.unwrap();

        let scanner = BasicScanner::default();
        assert_eq!(scanner.scan(&empty).await.unwrap().verdict, ScanVerdict::Unsafe);
        assert_eq!(
            scanner.scan(&dir.path().join("nope")).await.unwrap().verdict,
            ScanVerdict::Error
        );
    }

    #[tokio::test]
    async fn test_strict_mode_flags_pickles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.CKPT");
        tokio::fs::write(&path, b"pickle").await.unwrap();

        assert_eq!(BasicScanner::new(true).scan(&path).await.unwrap().verdict, ScanVerdict::Suspicious);
        assert_eq!(BasicScanner::new(false).scan(&path).await.unwrap().verdict, ScanVerdict::Safe);
    }
}

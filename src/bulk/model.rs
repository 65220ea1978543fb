//! CivitAI search results and the flat file list extracted from them.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::job::JobOptions;

const BYTES_PER_KB: f64 = 1024.0;

/// One model from a CivitAI search response.
///
/// Only the fields needed to plan downloads are typed; everything else is
/// ignored on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSearchResult {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub files: Vec<ModelFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    pub name: String,
    #[serde(rename = "sizeKB", default)]
    pub size_kb: Option<f64>,
    pub download_url: String,
    #[serde(default)]
    pub primary: bool,
    /// Hash algorithm name to hex digest, e.g. `SHA256`.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

impl ModelFile {
    /// Size in bytes, rounded up from the reported kilobytes.
    #[must_use]
    pub fn size_bytes(&self) -> Option<u64> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes = self
            .size_kb
            .filter(|kb| kb.is_finite() && *kb >= 0.0)
            .map(|kb| (kb * BYTES_PER_KB).ceil() as u64);
        bytes
    }

    /// Published SHA-256, lowercased.
    #[must_use]
    pub fn sha256(&self) -> Option<String> {
        self.hashes
            .iter()
            .find(|(algorithm, _)| algorithm.eq_ignore_ascii_case("sha256"))
            .map(|(_, digest)| digest.to_ascii_lowercase())
    }
}

/// One downloadable file plus the model it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub model_id: u64,
    pub model_name: String,
    pub model_type: Option<String>,
    pub version_id: u64,
    pub version_name: String,
    pub base_model: Option<String>,
    pub file_name: String,
    pub url: String,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
    pub primary: bool,
}

impl FileDescriptor {
    /// Where the file lands: `<output_dir>/<model>/<version_id>-<version>/<file>`.
    ///
    /// Versions of one model often reuse a file name, so each version gets
    /// its own directory.
    #[must_use]
    pub fn destination(&self, output_dir: &Path) -> PathBuf {
        output_dir
            .join(sanitize_filename(&self.model_name))
            .join(sanitize_filename(&format!("{}-{}", self.version_id, self.version_name)))
            .join(sanitize_filename(&self.file_name))
    }

    /// Short label used in logs and error descriptions.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.model_name, self.file_name)
    }
}

/// Body of a saved search: either the API envelope or a bare list.
#[derive(Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Envelope { items: Vec<ModelSearchResult> },
    List(Vec<ModelSearchResult>),
}

/// Parses a saved search response, `{"items": [...]}` or `[...]`.
///
/// # Errors
///
/// Returns the JSON error when the body matches neither shape.
pub fn parse_search_results(raw: &str) -> Result<Vec<ModelSearchResult>, serde_json::Error> {
    let response: SearchResponse = serde_json::from_str(raw)?;
    Ok(match response {
        SearchResponse::Envelope { items } | SearchResponse::List(items) => items,
    })
}

/// Flattens search results into the files a job will download.
///
/// Versions are assumed newest first, as the API returns them.
#[must_use]
pub fn extract_files(results: &[ModelSearchResult], options: &JobOptions) -> Vec<FileDescriptor> {
    let mut files = Vec::new();
    for model in results {
        let versions = if options.latest_version_only {
            &model.model_versions[..model.model_versions.len().min(1)]
        } else {
            &model.model_versions[..]
        };

        for version in versions {
            for file in &version.files {
                if options.primary_only && !file.primary {
                    continue;
                }
                files.push(FileDescriptor {
                    model_id: model.id,
                    model_name: model.name.clone(),
                    model_type: model.model_type.clone(),
                    version_id: version.id,
                    version_name: version.name.clone(),
                    base_model: version.base_model.clone(),
                    file_name: file.name.clone(),
                    url: file.download_url.clone(),
                    size_bytes: file.size_bytes(),
                    sha256: file.sha256(),
                    primary: file.primary,
                });
            }
        }
    }
    files
}

/// Replaces characters that are invalid on common filesystems and
/// neutralizes `.`/`..` segments.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    let traverses = Path::new(&sanitized)
        .components()
        .any(|component| matches!(component, Component::CurDir | Component::ParentDir));
    if traverses {
        sanitized.replace('.', "_")
    } else {
        sanitized
    }
}

//! Search by a folder of reference photos of one person.
//!
//! The folder name names the person (`jane_doe` is "jane doe"). Each
//! reference photo is searched on its own and the hits are merged.

use crate::config::Config;
use crate::extractor::FaceExtractor;
use crate::guard;
use crate::matching::{MatchingEngine, SearchError, SearchOutcome};
use crate::registration::has_image_extension;
use crate::types::QueryResult;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersonSearchError {
    #[error("path not allowed: {0}")]
    PathNotAllowed(PathBuf),
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Search(#[from] SearchError),
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonSearchResult {
    pub person_name: String,
    pub folder: PathBuf,
    pub references: Vec<PathBuf>,
    pub matches: Vec<QueryResult>,
    /// One entry per reference that produced no query.
    pub search_errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputSummary {
    pub output_dir: PathBuf,
    pub copied_files: Vec<PathBuf>,
    pub skipped_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PersonSearch {
    allowed_directories: Vec<PathBuf>,
    extensions: Vec<String>,
    max_references: usize,
}

impl PersonSearch {
    pub fn new(
        allowed_directories: Vec<PathBuf>,
        extensions: Vec<String>,
        max_references: usize,
    ) -> Self {
        Self {
            allowed_directories,
            extensions,
            max_references,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.storage.allowed_directories.clone(),
            config.storage.image_extensions.clone(),
            config.person_search.max_references,
        )
    }

    /// Person name derived from a folder: last component, underscores as spaces.
    pub fn person_name(folder: &Path) -> String {
        folder
            .file_name()
            .map(|n| n.to_string_lossy().replace('_', " "))
            .unwrap_or_default()
    }

    /// Reference images directly inside `folder`, sorted and capped.
    pub fn references(&self, folder: &Path) -> Result<Vec<PathBuf>, PersonSearchError> {
        let entries = std::fs::read_dir(folder).map_err(|source| PersonSearchError::Io {
            path: folder.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_image_extension(path, &self.extensions))
            .collect();
        files.sort();
        files.truncate(self.max_references);
        Ok(files)
    }

    pub fn search_folder(
        &self,
        engine: &MatchingEngine,
        extractor: &mut dyn FaceExtractor,
        folder: &Path,
        limit: usize,
    ) -> Result<PersonSearchResult, PersonSearchError> {
        if limit == 0 {
            return Err(SearchError::InvalidLimit.into());
        }
        if !guard::validate_path(folder, &self.allowed_directories) {
            return Err(PersonSearchError::PathNotAllowed(folder.to_path_buf()));
        }
        if !folder.is_dir() {
            return Err(PersonSearchError::NotADirectory(folder.to_path_buf()));
        }

        let person_name = Self::person_name(folder);
        let references = self.references(folder)?;
        let mut search_errors = Vec::new();
        if references.is_empty() {
            search_errors.push(format!("No images found in {}", folder.display()));
        }

        let mut best: HashMap<String, QueryResult> = HashMap::new();
        for reference in &references {
            let label = reference.display();
            let bytes = match std::fs::read(reference) {
                Ok(bytes) => bytes,
                Err(e) => {
                    search_errors.push(format!("{label}: {e}"));
                    continue;
                }
            };

            match engine.search(extractor, &bytes, limit) {
                Ok(SearchOutcome::Matches(matches)) => {
                    tracing::debug!(reference = %label, hits = matches.len(), "reference searched");
                    for hit in matches {
                        let better = best
                            .get(&hit.image_path)
                            .map_or(true, |kept| hit.confidence > kept.confidence);
                        if better {
                            best.insert(hit.image_path.clone(), hit);
                        }
                    }
                }
                Ok(SearchOutcome::Rejected(failure)) => {
                    search_errors.push(format!("{label}: {failure}"));
                }
                Err(SearchError::Extraction(e)) => {
                    search_errors.push(format!("{label}: {e}"));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut matches: Vec<QueryResult> = best.into_values().collect();
        matches.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.image_path.cmp(&b.image_path))
        });
        matches.truncate(limit);

        tracing::info!(
            person = %person_name,
            references = references.len(),
            matches = matches.len(),
            errors = search_errors.len(),
            "person search finished"
        );
        Ok(PersonSearchResult {
            person_name,
            folder: folder.to_path_buf(),
            references,
            matches,
            search_errors,
        })
    }
}

/// Copy matched photos into `output_root/<person name>/`.
///
/// Each copy is named `<parent folder>_<file name>` so photos with the same
/// name from different folders do not collide.
pub fn copy_matches_to_output(
    result: &PersonSearchResult,
    output_root: &Path,
) -> Result<OutputSummary, PersonSearchError> {
    let output_dir = output_root.join(&result.person_name);
    std::fs::create_dir_all(&output_dir).map_err(|source| PersonSearchError::Io {
        path: output_dir.clone(),
        source,
    })?;

    let mut summary = OutputSummary {
        output_dir: output_dir.clone(),
        ..Default::default()
    };

    for hit in &result.matches {
        let source = Path::new(&hit.image_path);
        if !source.is_file() {
            summary.skipped_files.push(format!("Missing: {}", hit.image_path));
            continue;
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = source
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let target = output_dir.join(format!("{parent}_{file_name}"));

        match std::fs::copy(source, &target) {
            Ok(_) => summary.copied_files.push(target),
            Err(e) => summary
                .skipped_files
                .push(format!("Failed: {} ({e})", hit.image_path)),
        }
    }

    tracing::info!(
        output = %output_dir.display(),
        copied = summary.copied_files.len(),
        skipped = summary.skipped_files.len(),
        "copied matches"
    );
    Ok(summary)
}

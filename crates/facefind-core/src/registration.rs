//! Registration pipeline: index every single-face photo under a directory.
//!
//! Files are handled one at a time and independently. A file either ends
//! up as one complete record or leaves no trace; a bad file never stops
//! the batch. Only repository backend failures abort the call.
//!
//! Under [`OverwritePolicy::Replace`], a known file whose new content fails
//! extraction or validation loses its old record: the stored embedding no
//! longer describes what is on disk.

use crate::extractor::FaceExtractor;
use crate::repository::{FaceRepository, RepositoryError, UpsertOutcome};
use crate::types::{DistanceMetric, NewFaceRecord, OverwritePolicy};
use crate::validator::{self, ValidationFailure};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Why a file was skipped without touching the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NoFace,
    MultipleFaces { count: usize },
    Unreadable { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Registered,
    Updated,
    AlreadyRegistered,
    Skipped(SkipReason),
    /// Refused by the repository: duplicate path, dimension or model mismatch.
    Rejected { detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
    /// Another indexed path with byte-identical content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
}

impl FileReport {
    fn new(path: String, outcome: FileOutcome) -> Self {
        Self {
            path,
            outcome,
            duplicate_of: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub no_face: usize,
    pub multiple_faces: usize,
    pub unreadable: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.no_face + self.multiple_faces + self.unreadable
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReport {
    pub directory: String,
    pub total_discovered: usize,
    pub registered_count: usize,
    pub updated_count: usize,
    pub already_registered_count: usize,
    pub skipped: SkipCounts,
    pub rejected_count: usize,
    /// Old records dropped because the file's new content was skipped.
    pub stale_removed: usize,
    pub elapsed_ms: u64,
    pub files: Vec<FileReport>,
}

impl RegistrationReport {
    fn new(directory: &Path) -> Self {
        Self {
            directory: directory.display().to_string(),
            total_discovered: 0,
            registered_count: 0,
            updated_count: 0,
            already_registered_count: 0,
            skipped: SkipCounts::default(),
            rejected_count: 0,
            stale_removed: 0,
            elapsed_ms: 0,
            files: Vec::new(),
        }
    }

    fn record(&mut self, file: FileReport) {
        match &file.outcome {
            FileOutcome::Registered => self.registered_count += 1,
            FileOutcome::Updated => self.updated_count += 1,
            FileOutcome::AlreadyRegistered => self.already_registered_count += 1,
            FileOutcome::Skipped(SkipReason::NoFace) => self.skipped.no_face += 1,
            FileOutcome::Skipped(SkipReason::MultipleFaces { .. }) => self.skipped.multiple_faces += 1,
            FileOutcome::Skipped(SkipReason::Unreadable { .. }) => self.skipped.unreadable += 1,
            FileOutcome::Rejected { .. } => self.rejected_count += 1,
        }
        self.files.push(file);
    }
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Whether `path` has one of `extensions` (case-insensitive, no dot).
pub fn has_image_extension<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed.as_ref().eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

pub struct RegistrationPipeline {
    repository: Arc<dyn FaceRepository>,
    extensions: Vec<String>,
    metric: DistanceMetric,
}

impl RegistrationPipeline {
    pub fn new(
        repository: Arc<dyn FaceRepository>,
        extensions: Vec<String>,
        metric: DistanceMetric,
    ) -> Self {
        Self {
            repository,
            extensions,
            metric,
        }
    }

    /// Image files under `directory`, recursively, sorted by path.
    pub fn discover(&self, directory: &Path) -> Result<Vec<PathBuf>, RegistrationError> {
        if !directory.is_dir() {
            return Err(RegistrationError::NotADirectory(directory.to_path_buf()));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(directory) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && has_image_extension(entry.path(), &self.extensions) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Register every image under `directory`.
    pub fn register(
        &self,
        extractor: &mut dyn FaceExtractor,
        directory: &Path,
        policy: OverwritePolicy,
    ) -> Result<RegistrationReport, RegistrationError> {
        let started = Instant::now();
        let files = self.discover(directory)?;
        let mut report = RegistrationReport::new(directory);
        report.total_discovered = files.len();
        tracing::info!(
            directory = %directory.display(),
            files = files.len(),
            ?policy,
            "registration started"
        );

        for file in &files {
            let (file, stale_removed) = self.register_file(extractor, file, policy)?;
            if stale_removed {
                report.stale_removed += 1;
            }
            match &file.outcome {
                FileOutcome::Skipped(reason) => {
                    tracing::warn!(path = %file.path, ?reason, "skipped");
                }
                FileOutcome::Rejected { detail } => {
                    tracing::warn!(path = %file.path, detail = %detail, "rejected by repository");
                }
                other => tracing::debug!(path = %file.path, outcome = ?other, "processed"),
            }
            report.record(file);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            registered = report.registered_count,
            updated = report.updated_count,
            already_registered = report.already_registered_count,
            skipped = report.skipped.total(),
            rejected = report.rejected_count,
            stale_removed = report.stale_removed,
            elapsed_ms = report.elapsed_ms,
            "registration finished"
        );
        Ok(report)
    }

    /// Process one file. The report carries the canonical path (or the
    /// walked path if it could not be resolved); the flag is set when an
    /// outdated record for the path was removed.
    fn register_file(
        &self,
        extractor: &mut dyn FaceExtractor,
        file: &Path,
        policy: OverwritePolicy,
    ) -> Result<(FileReport, bool), RegistrationError> {
        let unreadable = |detail: String| FileOutcome::Skipped(SkipReason::Unreadable { detail });

        let canonical = match std::fs::canonicalize(file) {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(e) => {
                let report = FileReport::new(file.display().to_string(), unreadable(e.to_string()));
                return Ok((report, false));
            }
        };
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) => return Ok((FileReport::new(canonical, unreadable(e.to_string())), false)),
        };
        let hash = content_hash(&bytes);

        let mut replacing = false;
        if let Some(existing) = self.repository.find_by_path(&canonical)? {
            if existing.content_hash == hash {
                return Ok((FileReport::new(canonical, FileOutcome::AlreadyRegistered), false));
            }
            if policy == OverwritePolicy::Reject {
                let detail = RepositoryError::DuplicatePath(canonical.clone()).to_string();
                return Ok((FileReport::new(canonical, FileOutcome::Rejected { detail }), false));
            }
            replacing = true;
        }

        let extracted = match extractor.extract(&bytes).and_then(validator::validate) {
            Ok(outcome) => match outcome.into_single() {
                Ok(face) => Ok(face),
                Err(ValidationFailure::NoFaceDetected) => Err(SkipReason::NoFace),
                Err(ValidationFailure::MultipleFacesDetected { count }) => {
                    Err(SkipReason::MultipleFaces { count })
                }
            },
            Err(e) => Err(SkipReason::Unreadable {
                detail: e.to_string(),
            }),
        };
        drop(bytes);

        let face = match extracted {
            Ok(face) => face,
            Err(reason) => {
                let removed = replacing && self.repository.delete(&canonical)?;
                if removed {
                    tracing::warn!(path = %canonical, "removed record for replaced content");
                }
                return Ok((FileReport::new(canonical, FileOutcome::Skipped(reason)), removed));
            }
        };

        let record = NewFaceRecord {
            image_path: canonical.clone(),
            embedding: face.embedding,
            embedding_model: extractor.embedding_model().to_string(),
            detector_backend: extractor.detector_backend().to_string(),
            distance_metric: self.metric,
            content_hash: hash.clone(),
        };

        let outcome = match self.repository.insert_or_update(record, policy) {
            Ok(UpsertOutcome::Inserted(_)) => FileOutcome::Registered,
            Ok(UpsertOutcome::Updated(_)) => FileOutcome::Updated,
            Ok(UpsertOutcome::Unchanged(_)) => FileOutcome::AlreadyRegistered,
            Err(e) if e.is_input_rejection() => FileOutcome::Rejected { detail: e.to_string() },
            Err(e) => return Err(e.into()),
        };

        let mut report = FileReport::new(canonical, outcome);
        if report.outcome == FileOutcome::Registered {
            report.duplicate_of = self
                .repository
                .paths_with_content(&hash)?
                .into_iter()
                .find(|other| *other != report.path);
            if let Some(other) = &report.duplicate_of {
                tracing::info!(path = %report.path, same_as = %other, "duplicate content registered");
            }
        }
        Ok((report, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ScriptedExtractor;
    use crate::repository::MemoryRepository;
    use std::fs;

    const MODEL: &str = "w600k_r50";
    const DETECTOR: &str = "scrfd_10g";

    struct Fixture {
        dir: tempfile::TempDir,
        repo: Arc<MemoryRepository>,
        pipeline: RegistrationPipeline,
        extractor: ScriptedExtractor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("day1/ceremony")).unwrap();
        fs::write(dir.path().join("day1/solo.jpg"), b"solo").unwrap();
        fs::write(dir.path().join("day1/ceremony/group.JPG"), b"group").unwrap();
        fs::write(dir.path().join("landscape.png"), b"landscape").unwrap();
        fs::write(dir.path().join("broken.jpeg"), b"broken").unwrap();
        fs::write(dir.path().join("notes.txt"), b"solo").unwrap();

        let extractor = ScriptedExtractor::new(MODEL, DETECTOR)
            .with_image(b"solo", vec![vec![1.0, 0.0]])
            .with_image(b"group", vec![vec![1.0, 0.0], vec![0.0, 1.0]])
            .with_image(b"landscape", vec![])
            .with_image(b"solo-v2", vec![vec![0.0, 1.0]]);

        let repo = Arc::new(MemoryRepository::new());
        let pipeline = RegistrationPipeline::new(
            repo.clone(),
            ["jpg", "jpeg", "png", "heic"].map(String::from).to_vec(),
            DistanceMetric::Cosine,
        );
        Fixture { dir, repo, pipeline, extractor }
    }

    #[test]
    fn test_discover_filters_and_recurses() {
        let f = fixture();
        let files = f.pipeline.discover(f.dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 4);
        assert!(names.contains(&"group.JPG".to_string()));
        assert!(!names.contains(&"notes.txt".to_string()));
    }

    #[test]
    fn test_register_reports_each_outcome() {
        let mut f = fixture();
        let report = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();

        assert_eq!(report.total_discovered, 4);
        assert_eq!(report.registered_count, 1);
        assert_eq!(report.skipped.no_face, 1);
        assert_eq!(report.skipped.multiple_faces, 1);
        assert_eq!(report.skipped.unreadable, 1);
        assert_eq!(f.repo.count().unwrap(), 1);

        let solo = fs::canonicalize(f.dir.path().join("day1/solo.jpg")).unwrap();
        let stored = f.repo.find_by_path(&solo.to_string_lossy()).unwrap().unwrap();
        assert_eq!(stored.content_hash, content_hash(b"solo"));
        assert_eq!(stored.embedding_model, MODEL);

        let group = report
            .files
            .iter()
            .find(|r| r.path.ends_with("group.JPG"))
            .unwrap();
        assert_eq!(group.outcome, FileOutcome::Skipped(SkipReason::MultipleFaces { count: 2 }));
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut f = fixture();
        let first = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        let second = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();

        assert_eq!(first.registered_count, 1);
        assert_eq!(second.registered_count, 0);
        assert_eq!(second.already_registered_count, 1);
        assert_eq!(f.repo.count().unwrap(), 1);
    }

    #[test]
    fn test_changed_content_respects_policy() {
        let mut f = fixture();
        f.pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        fs::write(f.dir.path().join("day1/solo.jpg"), b"solo-v2").unwrap();

        let rejected = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        assert_eq!(rejected.rejected_count, 1);
        assert_eq!(rejected.updated_count, 0);

        let replaced = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Replace)
            .unwrap();
        assert_eq!(replaced.updated_count, 1);
        assert_eq!(f.repo.count().unwrap(), 1);

        let solo = fs::canonicalize(f.dir.path().join("day1/solo.jpg")).unwrap();
        let stored = f.repo.find_by_path(&solo.to_string_lossy()).unwrap().unwrap();
        assert_eq!(stored.embedding.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_replaced_content_without_a_single_face_drops_old_record() {
        let mut f = fixture();
        f.pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        let solo = fs::canonicalize(f.dir.path().join("day1/solo.jpg")).unwrap();
        let key = solo.to_string_lossy().into_owned();
        assert!(f.repo.find_by_path(&key).unwrap().is_some());

        fs::write(&solo, b"group").unwrap();
        let report = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Replace)
            .unwrap();

        assert_eq!(report.stale_removed, 1);
        assert_eq!(report.skipped.multiple_faces, 2);
        assert!(f.repo.find_by_path(&key).unwrap().is_none());
        assert_eq!(f.repo.count().unwrap(), 0);
    }

    #[test]
    fn test_rejected_change_keeps_old_record() {
        let mut f = fixture();
        f.pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        let solo = fs::canonicalize(f.dir.path().join("day1/solo.jpg")).unwrap();
        fs::write(&solo, b"group").unwrap();

        let report = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        assert_eq!(report.rejected_count, 1);
        assert_eq!(report.stale_removed, 0);
        assert_eq!(f.repo.count().unwrap(), 1);
    }

    #[test]
    fn test_copied_photo_names_its_duplicate() {
        let mut f = fixture();
        fs::write(f.dir.path().join("day1/solo-copy.jpg"), b"solo").unwrap();
        let report = f
            .pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        assert_eq!(report.registered_count, 2);

        // solo-copy.jpg sorts first, so solo.jpg is the one flagged.
        let earlier = fs::canonicalize(f.dir.path().join("day1/solo-copy.jpg")).unwrap();
        let later = report
            .files
            .iter()
            .find(|r| r.path.ends_with("/solo.jpg"))
            .unwrap();
        assert_eq!(later.duplicate_of.as_deref(), Some(&*earlier.to_string_lossy()));
    }

    #[test]
    fn test_model_mismatch_is_rejected_per_file() {
        let mut f = fixture();
        f.pipeline
            .register(&mut f.extractor, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();

        fs::write(f.dir.path().join("late.jpg"), b"late").unwrap();
        let mut other = ScriptedExtractor::new("facenet512", DETECTOR)
            .with_image(b"late", vec![vec![0.5, 0.5]]);
        let report = f
            .pipeline
            .register(&mut other, f.dir.path(), OverwritePolicy::Reject)
            .unwrap();
        assert_eq!(report.rejected_count, 1);
        assert_eq!(f.repo.count().unwrap(), 1);
    }

    #[test]
    fn test_missing_directory() {
        let mut f = fixture();
        let err = f
            .pipeline
            .register(&mut f.extractor, &f.dir.path().join("nope"), OverwritePolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, RegistrationError::NotADirectory(_)));
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_report_serializes_flat_file_outcomes() {
        let mut report = RegistrationReport::new(Path::new("/photos"));
        report.record(FileReport::new(
            "/photos/a.jpg".into(),
            FileOutcome::Skipped(SkipReason::NoFace),
        ));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["skipped"]["no_face"], 1);
        assert_eq!(json["files"][0]["status"], "skipped");
        assert_eq!(json["files"][0]["reason"], "no_face");
        assert!(json["files"][0].get("duplicate_of").is_none());
    }
}

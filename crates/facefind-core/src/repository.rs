//! Embedding repository contract.
//!
//! [`FaceRepository`] is the storage seam: the SQLite backend lives in the
//! `facefind-store` crate, [`MemoryRepository`] here. Both share the upsert
//! rules in [`plan_upsert`] and the ranking in [`rank_neighbors`] so they
//! behave identically.
//!
//! Shipped backends scan exhaustively. The contract also admits approximate
//! backends whose `nearest` may miss part of the true top-k.

use crate::types::{
    DistanceMetric, Embedding, FaceRecord, NewFaceRecord, OverwritePolicy, Provenance,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("embedding dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("model mismatch: index built with {expected}, got {actual}")]
    ModelMismatch { expected: String, actual: String },
    #[error("path already registered with different content: {0}")]
    DuplicatePath(String),
    #[error("repository backend: {0}")]
    Backend(String),
}

impl RepositoryError {
    /// True for errors caused by the record itself rather than the backend.
    pub fn is_input_rejection(&self) -> bool {
        !matches!(self, RepositoryError::Backend(_))
    }
}

/// What `insert_or_update` did. Carries the record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(String),
    Updated(String),
    /// Same path and same content hash: nothing written.
    Unchanged(String),
}

impl UpsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => id,
        }
    }
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub image_path: String,
    pub distance: f32,
}

/// Storage for face records.
///
/// Methods take `&self`; implementations provide their own concurrency
/// control so searches can run alongside registrations.
pub trait FaceRepository: Send + Sync {
    /// Insert a record, or update the one stored under the same path.
    ///
    /// The provenance checks and the write happen atomically.
    fn insert_or_update(
        &self,
        record: NewFaceRecord,
        policy: OverwritePolicy,
    ) -> Result<UpsertOutcome, RepositoryError>;

    /// The `k` records closest to `query`, ascending by distance, ties by
    /// path. `k` larger than the repository returns everything.
    fn nearest(
        &self,
        query: &Embedding,
        k: usize,
        metric: DistanceMetric,
    ) -> Result<Vec<Neighbor>, RepositoryError>;

    fn find_by_path(&self, image_path: &str) -> Result<Option<FaceRecord>, RepositoryError>;

    /// Paths of every record whose source bytes hash to `content_hash`, sorted.
    fn paths_with_content(&self, content_hash: &str) -> Result<Vec<String>, RepositoryError>;

    fn count(&self) -> Result<usize, RepositoryError>;

    /// Returns true if a record was removed.
    fn delete(&self, image_path: &str) -> Result<bool, RepositoryError>;

    /// Remove every record, returning how many were removed.
    fn clear(&self) -> Result<usize, RepositoryError>;

    /// Model identity of the stored vectors, `None` while empty.
    fn provenance(&self) -> Result<Option<Provenance>, RepositoryError>;
}

/// Write decided by [`plan_upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertPlan {
    Insert,
    Replace { id: String },
    Keep { id: String },
}

/// Apply the index invariants to an incoming record.
///
/// `index` is the current provenance, `existing` the `(id, content_hash)`
/// already stored under the record's path.
pub fn plan_upsert(
    index: Option<&Provenance>,
    existing: Option<(&str, &str)>,
    record: &NewFaceRecord,
    policy: OverwritePolicy,
) -> Result<UpsertPlan, RepositoryError> {
    if let Some(index) = index {
        let incoming = record.provenance();
        if index.dimension != incoming.dimension {
            return Err(RepositoryError::DimensionMismatch {
                expected: index.dimension,
                actual: incoming.dimension,
            });
        }
        if index.embedding_model != incoming.embedding_model
            || index.detector_backend != incoming.detector_backend
        {
            return Err(RepositoryError::ModelMismatch {
                expected: format!("{}/{}", index.embedding_model, index.detector_backend),
                actual: format!("{}/{}", incoming.embedding_model, incoming.detector_backend),
            });
        }
    }

    match existing {
        None => Ok(UpsertPlan::Insert),
        Some((id, hash)) if hash == record.content_hash => Ok(UpsertPlan::Keep { id: id.to_string() }),
        Some((id, _)) => match policy {
            OverwritePolicy::Replace => Ok(UpsertPlan::Replace { id: id.to_string() }),
            OverwritePolicy::Reject => Err(RepositoryError::DuplicatePath(record.image_path.clone())),
        },
    }
}

/// Exhaustive k-nearest ranking over `(path, embedding)` pairs.
pub fn rank_neighbors<'a>(
    candidates: impl IntoIterator<Item = (&'a str, &'a Embedding)>,
    query: &Embedding,
    k: usize,
    metric: DistanceMetric,
) -> Vec<Neighbor> {
    let mut scored: Vec<Neighbor> = candidates
        .into_iter()
        .map(|(path, embedding)| Neighbor {
            image_path: path.to_string(),
            distance: query.distance(embedding, metric),
        })
        .collect();
    scored.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.image_path.cmp(&b.image_path))
    });
    scored.truncate(k);
    scored
}

/// Reject a query whose width differs from the stored vectors.
pub fn check_query_dimension(
    index: Option<&Provenance>,
    query: &Embedding,
) -> Result<(), RepositoryError> {
    match index {
        Some(p) if p.dimension != query.dimension() => Err(RepositoryError::DimensionMismatch {
            expected: p.dimension,
            actual: query.dimension(),
        }),
        _ => Ok(()),
    }
}

/// In-process repository keyed by image path.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: RwLock<BTreeMap<String, FaceRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> RepositoryError {
        RepositoryError::Backend("memory repository lock poisoned".into())
    }

    fn provenance_of(records: &BTreeMap<String, FaceRecord>) -> Option<Provenance> {
        records.values().next().map(|r| Provenance {
            embedding_model: r.embedding_model.clone(),
            detector_backend: r.detector_backend.clone(),
            dimension: r.embedding.dimension(),
        })
    }
}

impl FaceRepository for MemoryRepository {
    fn insert_or_update(
        &self,
        record: NewFaceRecord,
        policy: OverwritePolicy,
    ) -> Result<UpsertOutcome, RepositoryError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;

        let plan = {
            let index = Self::provenance_of(&records);
            let existing = records
                .get(&record.image_path)
                .map(|r| (r.id.as_str(), r.content_hash.as_str()));
            plan_upsert(index.as_ref(), existing, &record, policy)?
        };

        let (id, outcome) = match plan {
            UpsertPlan::Keep { id } => return Ok(UpsertOutcome::Unchanged(id)),
            UpsertPlan::Insert => {
                let id = uuid::Uuid::new_v4().to_string();
                (id.clone(), UpsertOutcome::Inserted(id))
            }
            UpsertPlan::Replace { id } => (id.clone(), UpsertOutcome::Updated(id)),
        };

        records.insert(
            record.image_path.clone(),
            FaceRecord {
                id,
                image_path: record.image_path,
                embedding: record.embedding,
                embedding_model: record.embedding_model,
                detector_backend: record.detector_backend,
                distance_metric: record.distance_metric,
                content_hash: record.content_hash,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        Ok(outcome)
    }

    fn nearest(
        &self,
        query: &Embedding,
        k: usize,
        metric: DistanceMetric,
    ) -> Result<Vec<Neighbor>, RepositoryError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        check_query_dimension(Self::provenance_of(&records).as_ref(), query)?;
        Ok(rank_neighbors(
            records.values().map(|r| (r.image_path.as_str(), &r.embedding)),
            query,
            k,
            metric,
        ))
    }

    fn find_by_path(&self, image_path: &str) -> Result<Option<FaceRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(image_path).cloned())
    }

    fn paths_with_content(&self, content_hash: &str) -> Result<Vec<String>, RepositoryError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records
            .values()
            .filter(|r| r.content_hash == content_hash)
            .map(|r| r.image_path.clone())
            .collect())
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        Ok(self.records.read().map_err(|_| Self::poisoned())?.len())
    }

    fn delete(&self, image_path: &str) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        Ok(records.remove(image_path).is_some())
    }

    fn clear(&self) -> Result<usize, RepositoryError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        let removed = records.len();
        records.clear();
        Ok(removed)
    }

    fn provenance(&self) -> Result<Option<Provenance>, RepositoryError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(Self::provenance_of(&records))
    }
}

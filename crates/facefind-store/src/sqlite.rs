use crate::{decode_embedding, encode_embedding, StoreError};
use facefind_core::repository::{
    check_query_dimension, plan_upsert, rank_neighbors, FaceRepository, Neighbor, RepositoryError,
    UpsertOutcome, UpsertPlan,
};
use facefind_core::{DistanceMetric, Embedding, FaceRecord, NewFaceRecord, OverwritePolicy, Provenance};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS faces (
    id TEXT PRIMARY KEY,
    image_path TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    embedding_model TEXT NOT NULL,
    detector_backend TEXT NOT NULL,
    distance_metric TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_content_hash ON faces(content_hash);
";

/// SQLite-backed [`FaceRepository`].
///
/// One connection in WAL mode, serialized behind a mutex. Upserts run in
/// an immediate transaction so the provenance check and the write cannot
/// interleave with another writer.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteRepository {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "face store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn upsert(
        &self,
        record: NewFaceRecord,
        policy: OverwritePolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let index = read_provenance(&tx)?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT id, content_hash FROM faces WHERE image_path = ?1",
                params![record.image_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let plan = plan_upsert(
            index.as_ref(),
            existing.as_ref().map(|(id, hash)| (id.as_str(), hash.as_str())),
            &record,
            policy,
        )?;

        let blob = encode_embedding(&record.embedding.values);
        let now = chrono::Utc::now().to_rfc3339();
        let outcome = match plan {
            UpsertPlan::Keep { id } => return Ok(UpsertOutcome::Unchanged(id)),
            UpsertPlan::Insert => {
                let id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO faces (
                        id, image_path, embedding, dimension, embedding_model,
                        detector_backend, distance_metric, content_hash, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id,
                        record.image_path,
                        blob,
                        record.embedding.dimension() as i64,
                        record.embedding_model,
                        record.detector_backend,
                        record.distance_metric.as_str(),
                        record.content_hash,
                        now,
                    ],
                )?;
                UpsertOutcome::Inserted(id)
            }
            UpsertPlan::Replace { id } => {
                tx.execute(
                    "UPDATE faces SET
                        embedding = ?2, dimension = ?3, embedding_model = ?4,
                        detector_backend = ?5, distance_metric = ?6,
                        content_hash = ?7, created_at = ?8
                     WHERE id = ?1",
                    params![
                        id,
                        blob,
                        record.embedding.dimension() as i64,
                        record.embedding_model,
                        record.detector_backend,
                        record.distance_metric.as_str(),
                        record.content_hash,
                        now,
                    ],
                )?;
                UpsertOutcome::Updated(id)
            }
        };

        tx.commit()?;
        tracing::debug!(path = %record.image_path, outcome = ?outcome, "face stored");
        Ok(outcome)
    }

    fn scan_nearest(
        &self,
        query: &Embedding,
        k: usize,
        metric: DistanceMetric,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let conn = self.lock()?;
        check_query_dimension(read_provenance(&conn)?.as_ref(), query)?;

        let mut stmt = conn.prepare("SELECT image_path, embedding, dimension FROM faces")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut stored = Vec::new();
        for row in rows {
            let (path, blob, dimension) = row?;
            let values = decode_embedding(&blob, dimension as usize)?;
            stored.push((path, Embedding::new(values)));
        }

        Ok(rank_neighbors(
            stored.iter().map(|(path, embedding)| (path.as_str(), embedding)),
            query,
            k,
            metric,
        ))
    }

    fn load_by_path(&self, image_path: &str) -> Result<Option<FaceRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, image_path, embedding, dimension, embedding_model,
                        detector_backend, distance_metric, content_hash, created_at
                 FROM faces WHERE image_path = ?1",
                params![image_path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, image_path, blob, dimension, model, detector, metric, hash, created_at)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(FaceRecord {
            id,
            image_path,
            embedding: Embedding::new(decode_embedding(&blob, dimension as usize)?),
            embedding_model: model,
            detector_backend: detector,
            distance_metric: metric.parse().map_err(StoreError::InvalidValue)?,
            content_hash: hash,
            created_at,
        }))
    }

    fn paths_by_hash(&self, content_hash: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT image_path FROM faces WHERE content_hash = ?1 ORDER BY image_path",
        )?;
        let paths = stmt
            .query_map(params![content_hash], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    fn row_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn delete_path(&self, image_path: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM faces WHERE image_path = ?1", params![image_path])?;
        Ok(removed > 0)
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM faces", [])?;
        tracing::info!(removed, "face store cleared");
        Ok(removed)
    }
}

fn read_provenance(conn: &Connection) -> Result<Option<Provenance>, StoreError> {
    let row = conn
        .query_row(
            "SELECT embedding_model, detector_backend, dimension FROM faces LIMIT 1",
            [],
            |row| {
                Ok(Provenance {
                    embedding_model: row.get(0)?,
                    detector_backend: row.get(1)?,
                    dimension: row.get::<_, i64>(2)? as usize,
                })
            },
        )
        .optional()?;
    Ok(row)
}

impl FaceRepository for SqliteRepository {
    fn insert_or_update(
        &self,
        record: NewFaceRecord,
        policy: OverwritePolicy,
    ) -> Result<UpsertOutcome, RepositoryError> {
        Ok(self.upsert(record, policy)?)
    }

    fn nearest(
        &self,
        query: &Embedding,
        k: usize,
        metric: DistanceMetric,
    ) -> Result<Vec<Neighbor>, RepositoryError> {
        Ok(self.scan_nearest(query, k, metric)?)
    }

    fn find_by_path(&self, image_path: &str) -> Result<Option<FaceRecord>, RepositoryError> {
        Ok(self.load_by_path(image_path)?)
    }

    fn paths_with_content(&self, content_hash: &str) -> Result<Vec<String>, RepositoryError> {
        Ok(self.paths_by_hash(content_hash)?)
    }

    fn count(&self) -> Result<usize, RepositoryError> {
        Ok(self.row_count()?)
    }

    fn delete(&self, image_path: &str) -> Result<bool, RepositoryError> {
        Ok(self.delete_path(image_path)?)
    }

    fn clear(&self) -> Result<usize, RepositoryError> {
        Ok(self.delete_all()?)
    }

    fn provenance(&self) -> Result<Option<Provenance>, RepositoryError> {
        let conn = self.lock()?;
        Ok(read_provenance(&conn)?)
    }
}

use facefind_core::{
    FaceExtractor, MatchingEngine, OverwritePolicy, RegistrationError, RegistrationPipeline,
    RegistrationReport, SearchError, SearchOutcome,
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("cannot start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Search {
        image: Vec<u8>,
        limit: usize,
        reply: oneshot::Sender<Result<SearchOutcome, EngineError>>,
    },
    Register {
        directory: PathBuf,
        policy: OverwritePolicy,
        reply: oneshot::Sender<Result<RegistrationReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Search the index with the face in `image`.
    pub async fn search(&self, image: Vec<u8>, limit: usize) -> Result<SearchOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Search {
                image,
                limit,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Register every photo under `directory`.
    pub async fn register(
        &self,
        directory: PathBuf,
        policy: OverwritePolicy,
    ) -> Result<RegistrationReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register {
                directory,
                policy,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the extractor, so model inference never runs on the
/// async runtime and at most one image is processed at a time. Requests
/// queue in a bounded channel.
pub fn spawn_engine<E>(
    mut extractor: E,
    matcher: MatchingEngine,
    pipeline: RegistrationPipeline,
) -> Result<EngineHandle, EngineError>
where
    E: FaceExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facefind-engine".into())
        .spawn(move || {
            tracing::info!(
                model = extractor.embedding_model(),
                detector = extractor.detector_backend(),
                "engine thread started"
            );
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Search {
                        image,
                        limit,
                        reply,
                    } => {
                        let result = matcher
                            .search(&mut extractor, &image, limit)
                            .map_err(EngineError::from);
                        drop(image);
                        if reply.send(result).is_err() {
                            tracing::debug!("search caller went away before the reply");
                        }
                    }
                    EngineRequest::Register {
                        directory,
                        policy,
                        reply,
                    } => {
                        let result = pipeline
                            .register(&mut extractor, &directory, policy)
                            .map_err(EngineError::from);
                        if reply.send(result).is_err() {
                            tracing::warn!(
                                directory = %directory.display(),
                                "registration finished after its caller went away"
                            );
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facefind_core::{
        DistanceMetric, FaceRepository, MatchSettings, MemoryRepository, ScriptedExtractor,
        ValidationFailure,
    };
    use std::sync::Arc;

    fn handle(repo: Arc<MemoryRepository>) -> EngineHandle {
        let extractor = ScriptedExtractor::new("w600k_r50", "scrfd_10g")
            .with_image(b"me", vec![vec![1.0, 0.0]])
            .with_image(b"us", vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let matcher = MatchingEngine::new(
            repo.clone(),
            MatchSettings {
                metric: DistanceMetric::Cosine,
                threshold: 0.40,
            },
        );
        let pipeline = RegistrationPipeline::new(repo, vec!["jpg".into()], DistanceMetric::Cosine);
        spawn_engine(extractor, matcher, pipeline).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_search_through_engine_thread() {
        let photos = tempfile::tempdir().unwrap();
        std::fs::write(photos.path().join("me.jpg"), b"me").unwrap();
        std::fs::write(photos.path().join("us.jpg"), b"us").unwrap();

        let repo = Arc::new(MemoryRepository::new());
        let engine = handle(repo.clone());

        let report = engine
            .register(photos.path().to_path_buf(), OverwritePolicy::Reject)
            .await
            .unwrap();
        assert_eq!(report.registered_count, 1);
        assert_eq!(report.skipped.multiple_faces, 1);
        assert_eq!(repo.count().unwrap(), 1);

        let outcome = engine.search(b"me".to_vec(), 5).await.unwrap();
        let matches = outcome.matches().unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].image_path.ends_with("me.jpg"));

        let rejected = engine.search(b"us".to_vec(), 5).await.unwrap();
        assert_eq!(
            rejected,
            SearchOutcome::Rejected(ValidationFailure::MultipleFacesDetected { count: 2 })
        );
    }

    #[tokio::test]
    async fn test_engine_errors_are_returned() {
        let engine = handle(Arc::new(MemoryRepository::new()));
        let err = engine.search(b"me".to_vec(), 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Search(SearchError::InvalidLimit)));

        let err = engine
            .register(PathBuf::from("/definitely/not/here"), OverwritePolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Registration(RegistrationError::NotADirectory(_))
        ));
    }
}

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to re-home block entity: {0}")]
    Rehome(#[from] bincode::Error),
    #[error("failed to spawn portal worker thread: {0}")]
    WorkerSpawn(#[from] io::Error),
    #[error("failed to build portal job pool: {0}")]
    JobPool(#[from] rayon::ThreadPoolBuildError),
}

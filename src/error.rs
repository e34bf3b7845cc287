use thiserror::Error;

use crate::transport::Tag;

#[derive(Error, Debug)]
pub enum MatMulError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Dimension mismatch: A is {a_rows}x{a_cols}, B is {b_rows}x{b_cols}")]
    DimensionMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },
    #[error("Worker {worker} unresponsive on channel {channel}")]
    WorkerUnresponsive { worker: i32, channel: Tag },
    #[error("Compute failure on rank {worker}: {reason}")]
    ComputeFailure { worker: i32, reason: String },
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),
    #[error("Timed out waiting on rank {peer}, channel {tag}")]
    Timeout { peer: i32, tag: Tag },
    #[error("Rank {peer} disconnected on channel {tag}")]
    Disconnected { peer: i32, tag: Tag },
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),
    #[error("Process error: {0}")]
    ProcessError(String),
    #[error("Invalid shape: {rows}x{cols} needs {expected} elements, got {actual}")]
    InvalidShape {
        rows: usize,
        cols: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Row block [{offset}, {offset}+{rows}) out of bounds for {total} rows")]
    BlockOutOfBounds {
        offset: usize,
        rows: usize,
        total: usize,
    },
}

impl MatMulError {
    /// Rewrites a transport-level wait failure on a worker's channel into
    /// `WorkerUnresponsive`. Other errors pass through unchanged.
    pub(crate) fn unresponsive(self) -> Self {
        match self {
            MatMulError::Timeout { peer, tag } | MatMulError::Disconnected { peer, tag } => {
                MatMulError::WorkerUnresponsive {
                    worker: peer,
                    channel: tag,
                }
            }
            other => other,
        }
    }
}

impl From<bincode::Error> for MatMulError {
    fn from(e: bincode::Error) -> Self {
        MatMulError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MatMulError>;

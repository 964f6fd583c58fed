//! Error type for record store operations

use fmd_common::FsId;

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("redb compaction error: {0}")]
    Compaction(#[from] redb::CompactionError),
    #[error("prost decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("filesystem {0} is not attached")]
    NotAttached(FsId),
}

impl From<redb::TransactionError> for BackendError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<BackendError> for fmd_common::Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotAttached(fsid) => Self::NotAttached(fsid),
            BackendError::Io(io) => Self::Io(io),
            BackendError::Decode(d) => Self::Serialization(d.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

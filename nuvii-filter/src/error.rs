use std::path::PathBuf;

use thiserror::Error;

use crate::connection::TransferStatus;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata record error: {0}")]
    Record(#[from] serde_json::Error),
    #[error("not a placeholder: {0}")]
    NotAPlaceholder(PathBuf),
    #[error("source is missing: {0}")]
    MissingSource(PathBuf),
    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),
    #[error("path is outside the sync root: {0}")]
    OutOfRoot(PathBuf),
    #[error("file identity is empty")]
    EmptyIdentity,
    #[error("file identity is not valid UTF-16")]
    InvalidIdentity,
    #[error("no filter connection is established")]
    NotConnected,
    #[error("callback table is not terminated by the sentinel entry")]
    UnterminatedCallbackTable,
    #[error("unknown transfer key")]
    UnknownTransfer,
    #[error("transfer already completed")]
    TransferAlreadyComplete,
    #[error("hydration failed with status {0:?}")]
    TransferFailed(TransferStatus),
    #[error("dehydration refused: {0}")]
    DehydrationRefused(&'static str),
    #[error("data directory is unavailable")]
    MissingDataDir,
}

use crate::storage::StorageError;

/// Errors surfaced by the generation and edit flows.
///
/// Storage degradation (quota pressure) and per-record decode failures are
/// recovered internally and never appear here; they only leave a warning in
/// the logs.
#[derive(thiserror::Error, Debug)]
pub enum DriftError {
    #[error("no API key registered")]
    NoCredentials,
    #[error("every registered API key is at its rate limit")]
    KeysExhausted,
    #[error("generation endpoint rejected the request: {status} {body}")]
    RemoteRejected { status: u16, body: String },
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

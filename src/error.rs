use thiserror::Error;

/// Misuse of the public API. Runtime conditions (resolve / connect / proxy
///  failures, disconnects) are never surfaced this way - they arrive as
///  categorised callbacks and are absorbed by the retry policy.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("the handler is already running")]
    AlreadyRunning,
    #[error("the handler is not running")]
    NotRunning,
    #[error("bind limit reached")]
    BindLimit,
    #[error("binding {0} failed")]
    BindFailed(String),
    #[error("unsupported combination of options: {0}")]
    Unsupported(&'static str),
}

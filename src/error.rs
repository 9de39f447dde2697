use std::io;

use thiserror::Error;

/// Boxed error produced by plugins (decoders, guns, sinks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The run context was cancelled. Not a failure on its own: callers filter
    /// it out before surfacing errors upward.
    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("startup schedule emits no instances")]
    EmptyStartup,

    #[error("gun warm up failed: {0}")]
    WarmUp(#[source] BoxError),

    #[error("gun failure: {0}")]
    Gun(#[source] BoxError),

    #[error("gun panicked while shooting: {0}")]
    GunPanic(String),

    #[error("failed to decode ammo #{index}: {source}")]
    Decode {
        index: u64,
        #[source]
        source: BoxError,
    },

    #[error("ammo source yielded no ammo")]
    EmptySource,

    #[error("{0} samples dropped because the sample queue was full")]
    Dropped(u64),

    #[error("aggregator finished before the pool stopped it")]
    AggregatorStopped,

    #[error("task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Folds a list of errors into one: none, the single error, or [`Error::Multiple`].
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }

    /// Whether the error only reports context cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Multiple(errors) => errors.iter().all(Error::is_cancelled),
            _ => false,
        }
    }

    pub fn gun(err: impl Into<BoxError>) -> Self {
        Error::Gun(err.into())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Join(err.to_string())
    }
}

fn join_messages(errors: &[Error]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("{} errors occurred: {}", errors.len(), messages.join("; "))
}

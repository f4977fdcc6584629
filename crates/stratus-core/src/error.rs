use thiserror::Error;

pub type StratusResult<T> = Result<T, StratusError>;

#[derive(Debug, Error)]
pub enum StratusError {
    #[error("remote backend error: {0}")]
    Remote(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("not started")]
    NotStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

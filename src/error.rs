use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or a request template that cannot be built.
    /// A run never starts when one of these is raised.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("histogram error: {0}")]
    Histogram(String),

    #[error("shard report error: {0}")]
    Report(String),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

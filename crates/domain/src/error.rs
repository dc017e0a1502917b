/// Shared error type used across all maestro crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not found: {}", key.join("/"))]
    NotFound { key: Vec<String> },

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("question: {0}")]
    Question(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a `NotFound` from borrowed key segments.
    pub fn not_found(key: &[impl AsRef<str>]) -> Self {
        Self::NotFound {
            key: key.iter().map(|s| s.as_ref().to_owned()).collect(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

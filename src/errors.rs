use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backup protocol error: {0}")]
    Protocol(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("A backup named '{0}' already exists")]
    NameTaken(String),

    #[error("Invalid backup name '{0}': must be non-empty, must not contain '/' and must not be 'successful'")]
    InvalidName(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

impl AppError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FolioError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid entity name '{0}': must be non-empty, contain no path separators and not start with '~'")]
    InvalidName(String),

    #[error("Duplicate key '{key}' in entity set '{set}'")]
    DuplicateKey { set: String, key: String },

    #[error("Document not found: {set}/{id}")]
    NotFound { set: String, id: String },

    #[error("Unknown entity set: {0}")]
    SchemaUnknown(String),

    #[error("Decode error in {path}: {message}")]
    Decode { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FolioError>;

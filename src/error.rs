use thiserror::Error;

#[derive(Debug, Error)]
pub enum NsrvmError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error for '{service}': {msg}")]
    Process { service: String, msg: String },

    #[error("unknown service: '{0}'")]
    UnknownService(String),

    #[error("no module found for service '{0}'")]
    ModuleNotFound(String),

    #[error("api descriptor rejected: {0}")]
    ApiValidation(String),

    #[error("too many child services: {requested} requested, {max} allowed")]
    TooManyChilds { requested: usize, max: usize },

    #[error("token generation failed")]
    TokenGen,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NsrvmError>;

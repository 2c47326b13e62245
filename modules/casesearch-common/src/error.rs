use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaseSearchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed queue message: {0}")]
    MalformedMessage(String),

    #[error("Unknown trigger: {0}")]
    UnknownTrigger(String),

    #[error("Case not found: {0}")]
    CaseNotFound(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

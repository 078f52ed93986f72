use thiserror::Error;

pub type SibResult<T> = Result<T, SibError>;

#[derive(Debug, Error)]
pub enum SibError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

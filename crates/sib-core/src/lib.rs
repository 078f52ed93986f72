pub mod config;
pub mod error;
pub mod types;

pub use error::{SibError, SibResult};
pub use types::{ConfigOutcome, SearchMode};

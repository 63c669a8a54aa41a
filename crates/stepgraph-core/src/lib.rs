pub mod config;
pub mod error;
pub mod structured;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, StepGraphError};
pub use structured::{OutputField, OutputKind, OutputSchema};
pub use traits::{LlmClient, TextGenerator};
pub use types::*;

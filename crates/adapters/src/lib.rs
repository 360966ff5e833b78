mod base_url;
mod error;
mod llm;

pub use base_url::check_base_url;
pub use error::AdapterError;
pub use llm::{create_llm_adapter, create_llm_adapter_from_profile};

pub use writer_core::config::{Config, ConfigStore, LlmConfig};
pub use writer_core::model::{LanguageModel, LanguageModelError};

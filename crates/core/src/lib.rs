pub mod chapter;
pub mod config;
pub mod logging;
pub mod model;
pub mod outline;
pub mod prompts;
pub mod session;

pub use chapter::{ChapterError, ChapterRequest, ChapterService};
pub use config::{
    Config, ConfigError, ConfigStore, LlmConfig, PromptConfig, RecentUsage, SessionDefaults,
    API_KEY_ENV_VAR,
};
pub use logging::{LogLevel, LogRecord, LogSink, StdoutLogSink, VecLogSink};
pub use model::{LanguageModel, LanguageModelError};
pub use outline::{
    Outline, OutlineChapter, OutlineError, OutlineRequest, OutlineRevision, OutlineService,
};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptTemplate};
pub use session::{
    classify_review_input, route, AcceptedChapter, ReviewDecision, Route, SessionError,
    SessionState, Turn, UserBrief, WritingSession, REVISE_INSTRUCTION,
};

use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{LanguageModel, LanguageModelError};
use crate::outline::Outline;
use crate::prompts::{PromptError, PromptRegistry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChapterError {
    #[error("大纲尚未生成，无法生成章节")]
    NoOutline,
    #[error("章节索引 {index} 超出大纲范围（共{len}章）")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("渲染章节提示词失败: {source}")]
    Prompt {
        #[source]
        source: PromptError,
    },
    #[error("调用模型生成章节失败: {source}")]
    Model {
        #[source]
        source: LanguageModelError,
    },
}

#[derive(Clone, Debug)]
pub struct ChapterRequest<'a> {
    pub outline: Option<&'a Outline>,
    pub index: usize,
    pub feedback: Option<&'a str>,
}

impl<'a> ChapterRequest<'a> {
    pub fn new(outline: Option<&'a Outline>, index: usize) -> Self {
        Self {
            outline,
            index,
            feedback: None,
        }
    }

    pub fn with_feedback(mut self, feedback: Option<&'a str>) -> Self {
        self.feedback = feedback;
        self
    }
}

pub struct ChapterService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> ChapterService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    /// Drafts one chapter of the outline. The raw response text is the
    /// draft; any pending revision note is folded into the directive.
    pub fn generate<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        request: &ChapterRequest<'_>,
    ) -> Result<String, ChapterError> {
        let outline = request.outline.ok_or(ChapterError::NoOutline)?;
        let chapter = outline
            .chapter(request.index)
            .ok_or(ChapterError::IndexOutOfRange {
                index: request.index,
                len: outline.len(),
            })?;

        let revision_note = match request.feedback.map(str::trim) {
            Some(note) if !note.is_empty() => format!("人类修订建议：{note}\n"),
            _ => String::new(),
        };

        let prompt = self
            .prompts
            .format_with(
                "chapter",
                [
                    ("chapter_name", chapter.name.clone()),
                    ("chapter_summary", chapter.summary.clone()),
                    ("revision_note", revision_note),
                ],
            )
            .map_err(|source| ChapterError::Prompt { source })?;

        self.log(
            LogLevel::Info,
            format!("调用模型生成第{}章正文。", request.index + 1),
        );
        self.log(LogLevel::Debug, format!("章节提示词：\n{prompt}"));

        let response = model
            .invoke(&prompt)
            .map_err(|source| ChapterError::Model { source })?;

        Ok(response.trim().to_string())
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

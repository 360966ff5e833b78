use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{LanguageModel, LanguageModelError};
use crate::prompts::{PromptError, PromptRegistry};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutlineChapter {
    pub name: String,
    pub summary: String,
}

/// Chapter plan for one session. Replaced wholesale on every revision; the
/// raw model text is retained so a revision directive can quote it back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outline {
    raw_text: String,
    chapters: Vec<OutlineChapter>,
}

impl Outline {
    pub fn new(raw_text: String, chapters: Vec<OutlineChapter>) -> Self {
        Self { raw_text, chapters }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn chapters(&self) -> &[OutlineChapter] {
        &self.chapters
    }

    pub fn chapter(&self, index: usize) -> Option<&OutlineChapter> {
        self.chapters.get(index)
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutlineRequest {
    pub title: String,
    pub idea: String,
    pub chapter_count: u32,
    pub revision: Option<OutlineRevision>,
}

impl OutlineRequest {
    pub fn initial(
        title: impl Into<String>,
        idea: impl Into<String>,
        chapter_count: u32,
    ) -> Self {
        Self {
            title: title.into(),
            idea: idea.into(),
            chapter_count,
            revision: None,
        }
    }

    pub fn revision(mut self, current: Outline, feedback: impl Into<String>) -> Self {
        self.revision = Some(OutlineRevision {
            current,
            feedback: feedback.into(),
        });
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutlineRevision {
    pub current: Outline,
    pub feedback: String,
}

#[derive(Debug, Error)]
pub enum OutlineError {
    #[error("failed to render outline prompt: {source}")]
    Prompt {
        #[source]
        source: PromptError,
    },
    #[error("language model invocation failed for outline: {source}")]
    Model {
        #[source]
        source: LanguageModelError,
    },
    #[error("unable to parse outline JSON from model response: {raw}")]
    Malformed { raw: String },
    #[error("outline response is valid JSON but not an array: {raw}")]
    InvalidShape { raw: String },
}

pub struct OutlineService<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> OutlineService<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    pub fn generate<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        request: &OutlineRequest,
    ) -> Result<Outline, OutlineError> {
        let prompt = match &request.revision {
            Some(revision) => {
                self.log(LogLevel::Info, "根据用户反馈调整大纲中...");
                self.prompts
                    .format_with(
                        "revise_outline",
                        [
                            ("outline_feedback", revision.feedback.trim().to_string()),
                            ("current_outline", revision.current.raw_text().to_string()),
                        ],
                    )
                    .map_err(|source| OutlineError::Prompt { source })?
            }
            None => self
                .prompts
                .format_with(
                    "outline",
                    [
                        ("title", request.title.trim().to_string()),
                        ("idea", request.idea.trim().to_string()),
                        ("chapter_count", request.chapter_count.to_string()),
                    ],
                )
                .map_err(|source| OutlineError::Prompt { source })?,
        };

        self.log(LogLevel::Debug, format!("大纲提示词：\n{prompt}"));

        let response = model
            .invoke(&prompt)
            .map_err(|source| OutlineError::Model { source })?;
        self.log(LogLevel::Debug, format!("大纲模型返回：\n{response}"));

        let outline = self.parse_response(&response)?;

        if outline.len() != request.chapter_count as usize {
            self.log(
                LogLevel::Warn,
                format!(
                    "大纲章节数（{}）与请求章节数（{}）不一致。",
                    outline.len(),
                    request.chapter_count
                ),
            );
        }

        Ok(outline)
    }

    /// Direct parse first; failing that, the first bracketed array-looking
    /// substring of the response is extracted and parsed instead.
    fn parse_response(&self, response: &str) -> Result<Outline, OutlineError> {
        let trimmed = response.trim();

        let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => value,
            Err(_) => {
                let extracted =
                    extract_array_text(trimmed).ok_or_else(|| OutlineError::Malformed {
                        raw: trimmed.to_string(),
                    })?;
                let value = serde_json::from_str::<serde_json::Value>(extracted).map_err(|_| {
                    OutlineError::Malformed {
                        raw: trimmed.to_string(),
                    }
                })?;
                self.log(
                    LogLevel::Warn,
                    "大纲响应无法直接解析，已从文本中提取JSON数组。",
                );
                value
            }
        };

        if !value.is_array() {
            return Err(OutlineError::InvalidShape {
                raw: trimmed.to_string(),
            });
        }

        let chapters: Vec<OutlineChapter> =
            serde_json::from_value(value).map_err(|_| OutlineError::Malformed {
                raw: trimmed.to_string(),
            })?;

        Ok(Outline::new(trimmed.to_string(), chapters))
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn extract_array_text(text: &str) -> Option<&str> {
    array_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn array_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?s)(\[.*\])").expect("invalid outline array regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    struct MockLanguageModel {
        responses: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLanguageModel {
        fn new<I, S>(responses: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl LanguageModel for MockLanguageModel {
        fn invoke(&self, prompt: &str) -> Result<String, LanguageModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses.lock().unwrap().pop_front().ok_or_else(|| {
                LanguageModelError::new(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "no more mock responses",
                ))
            })
        }
    }

    const TWO_CHAPTERS: &str =
        r#"[{"name": "第1章", "summary": "主人公登场"}, {"name": "第2章", "summary": "危机降临"}]"#;

    #[test]
    fn parses_direct_json_response() {
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = OutlineService::new(&prompts, &sink);
        let mock = MockLanguageModel::new([TWO_CHAPTERS]);

        let request = OutlineRequest::initial("时间旅人", "修表匠的怀表", 2);
        let outline = service.generate(&mock, &request).expect("outline");

        assert_eq!(outline.len(), 2);
        assert_eq!(outline.chapter(0).unwrap().name, "第1章");
        assert_eq!(outline.chapter(1).unwrap().summary, "危机降临");
        assert!(mock.prompts()[0].contains("标题：时间旅人"));
    }

    #[test]
    fn extracts_array_wrapped_in_prose() {
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = OutlineService::new(&prompts, &sink);
        let wrapped = format!("好的，大纲如下：\n```json\n{TWO_CHAPTERS}\n```\n希望有帮助。");
        let mock = MockLanguageModel::new([wrapped]);

        let request = OutlineRequest::initial("T", "I", 2);
        let outline = service.generate(&mock, &request).expect("outline");

        assert_eq!(outline.len(), 2);
        assert!(sink.contains(LogLevel::Warn, "提取JSON数组"));
    }

    #[test]
    fn malformed_response_carries_raw_text() {
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = OutlineService::new(&prompts, &sink);
        let mock = MockLanguageModel::new(["抱歉，我无法完成这个请求。"]);

        let request = OutlineRequest::initial("T", "I", 2);
        let error = service.generate(&mock, &request).expect_err("malformed");
        match error {
            OutlineError::Malformed { raw } => assert!(raw.contains("抱歉")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_array_json_is_invalid_shape() {
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = OutlineService::new(&prompts, &sink);
        let mock = MockLanguageModel::new([r#"{"name": "第1章", "summary": "..."}"#]);

        let request = OutlineRequest::initial("T", "I", 1);
        let error = service.generate(&mock, &request).expect_err("shape");
        assert!(matches!(error, OutlineError::InvalidShape { .. }));
    }

    #[test]
    fn array_of_non_objects_is_rejected() {
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = OutlineService::new(&prompts, &sink);
        let mock = MockLanguageModel::new([r#"["第1章", "第2章"]"#]);

        let request = OutlineRequest::initial("T", "I", 2);
        let error = service.generate(&mock, &request).expect_err("rejected");
        assert!(matches!(error, OutlineError::Malformed { .. }));
    }

    #[test]
    fn revision_prompt_includes_feedback_and_current_outline() {
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = OutlineService::new(&prompts, &sink);
        let mock = MockLanguageModel::new([TWO_CHAPTERS]);

        let current = Outline::new(
            TWO_CHAPTERS.to_string(),
            vec![
                OutlineChapter {
                    name: "第1章".into(),
                    summary: "主人公登场".into(),
                },
                OutlineChapter {
                    name: "第2章".into(),
                    summary: "危机降临".into(),
                },
            ],
        );
        let request = OutlineRequest::initial("T", "I", 2).revision(current, "加一个反转");
        service.generate(&mock, &request).expect("outline");

        let sent = mock.prompts();
        assert!(sent[0].contains("加一个反转"));
        assert!(sent[0].contains("危机降临"));
    }

    #[test]
    fn chapter_count_mismatch_logs_warning() {
        let prompts = PromptRegistry::new().expect("registry");
        let sink = VecLogSink::new();
        let service = OutlineService::new(&prompts, &sink);
        let mock = MockLanguageModel::new([TWO_CHAPTERS]);

        let request = OutlineRequest::initial("T", "I", 5);
        service.generate(&mock, &request).expect("outline");
        assert!(sink.contains(LogLevel::Warn, "不一致"));
    }
}

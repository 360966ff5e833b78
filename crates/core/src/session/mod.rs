use crate::chapter::{ChapterError, ChapterRequest, ChapterService};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::LanguageModel;
use crate::outline::{Outline, OutlineError, OutlineRequest, OutlineService};
use crate::prompts::PromptRegistry;
use serde::Serialize;
use thiserror::Error;

/// Fixed instruction stored as chapter feedback when the reviewer answers
/// `revise`.
pub const REVISE_INSTRUCTION: &str = "请重新生成当前章节。";

const DEFAULT_PREVIEW_CHARS: usize = 100;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct UserBrief {
    pub title: String,
    pub idea: String,
    pub chapter_count: u32,
}

impl UserBrief {
    pub fn new(title: impl Into<String>, idea: impl Into<String>, chapter_count: u32) -> Self {
        Self {
            title: title.into(),
            idea: idea.into(),
            chapter_count,
        }
    }
}

/// The single mutable record threaded through the workflow. Created once
/// per session and discarded with it.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct SessionState {
    pub brief: UserBrief,
    #[serde(skip)]
    pub outline: Option<Outline>,
    pub outline_feedback: Option<String>,
    pub chapter_index: usize,
    pub chapter_text: Option<String>,
    pub human_feedback: Option<String>,
}

impl SessionState {
    pub fn new(brief: UserBrief) -> Self {
        Self {
            brief,
            ..Self::default()
        }
    }
}

/// Where the router sends the session next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    ReviseOutline,
    GenerateChapter,
    Finish,
}

fn wants_outline_revision(state: &SessionState) -> bool {
    state.outline_feedback.is_some()
}

fn wants_chapter_revision(state: &SessionState) -> bool {
    state.human_feedback.is_some()
}

fn has_remaining_chapters(state: &SessionState) -> bool {
    state
        .outline
        .as_ref()
        .is_some_and(|outline| state.chapter_index < outline.len())
}

/// Priority order is this table, top to bottom: outline revision beats
/// chapter revision beats normal advancement; anything else finishes.
const ROUTE_RULES: &[(fn(&SessionState) -> bool, Route)] = &[
    (wants_outline_revision, Route::ReviseOutline),
    (wants_chapter_revision, Route::GenerateChapter),
    (has_remaining_chapters, Route::GenerateChapter),
];

pub fn route(state: &SessionState) -> Route {
    ROUTE_RULES
        .iter()
        .find(|(applies, _)| applies(state))
        .map(|(_, target)| *target)
        .unwrap_or(Route::Finish)
}

/// What the reviewer's free-text input meant. Matching is exact and
/// case-insensitive for the three keywords.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReviewDecision {
    Accept,
    Revise,
    ReviseOutline,
    Feedback(String),
    NoDecision,
}

pub fn classify_review_input(input: &str) -> ReviewDecision {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return ReviewDecision::NoDecision;
    }
    match trimmed.to_lowercase().as_str() {
        "accept" => ReviewDecision::Accept,
        "revise" => ReviewDecision::Revise,
        "outline" => ReviewDecision::ReviseOutline,
        _ => ReviewDecision::Feedback(trimmed.to_string()),
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("大纲生成失败: {0}")]
    Outline(#[from] OutlineError),
    #[error("章节生成失败: {0}")]
    Chapter(#[from] ChapterError),
    #[error("会话已经启动，不能重复启动")]
    AlreadyStarted,
    #[error("会话当前不在等待章节审阅")]
    NotAwaitingReview,
    #[error("会话当前不在等待大纲修改建议")]
    NotAwaitingOutlineNote,
}

/// A chapter the reviewer accepted, kept so the caller has something to
/// hand back when the session finishes.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AcceptedChapter {
    pub number: usize,
    pub name: String,
    pub text: String,
}

/// Result of driving the session until it needs the operator again.
#[derive(Clone, Debug, PartialEq)]
pub enum Turn {
    /// First suspension point: a chapter draft awaits review.
    AwaitingReview {
        chapter_number: usize,
        preview: String,
    },
    /// Second suspension point: the reviewer asked to rework the outline
    /// and owes a revision note.
    AwaitingOutlineNote,
    Finished(Vec<AcceptedChapter>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Idle,
    PendingReview,
    PendingOutlineNote,
    Done,
}

/// One end-to-end outline → chapter → review session. The two suspension
/// points are plain request/response boundaries: the engine returns a
/// [`Turn`] and the caller resumes it with the operator's input.
pub struct WritingSession<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    preview_chars: usize,
    state: SessionState,
    accepted: Vec<AcceptedChapter>,
    phase: Phase,
}

impl<'a> WritingSession<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink, brief: UserBrief) -> Self {
        Self {
            prompts,
            sink,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            state: SessionState::new(brief),
            accepted: Vec::new(),
            phase: Phase::Idle,
        }
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars.max(1);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn accepted_chapters(&self) -> &[AcceptedChapter] {
        &self.accepted
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Generates the outline and drives the workflow to its first
    /// suspension point.
    pub fn start<M: LanguageModel + ?Sized>(&mut self, model: &M) -> Result<Turn, SessionError> {
        if self.phase != Phase::Idle {
            return Err(SessionError::AlreadyStarted);
        }

        self.log(
            LogLevel::Info,
            format!(
                "会话开始：《{}》，计划{}章。",
                self.state.brief.title, self.state.brief.chapter_count
            ),
        );

        self.regenerate_outline(model, None)?;
        self.drive(model)
    }

    /// Resolves the pending chapter review with the operator's free text.
    pub fn resume_review<M: LanguageModel + ?Sized>(
        &mut self,
        model: &M,
        input: &str,
    ) -> Result<Turn, SessionError> {
        if self.phase != Phase::PendingReview {
            return Err(SessionError::NotAwaitingReview);
        }

        match classify_review_input(input) {
            ReviewDecision::Accept => {
                self.log(
                    LogLevel::Info,
                    format!("第{}章已接受。", self.state.chapter_index + 1),
                );
                self.record_accepted_chapter();
                self.state.chapter_index += 1;
                self.state.human_feedback = None;
                self.state.outline_feedback = None;
            }
            ReviewDecision::Revise => {
                self.log(LogLevel::Info, "审阅要求重写当前章节。");
                self.state.human_feedback = Some(REVISE_INSTRUCTION.to_string());
            }
            ReviewDecision::ReviseOutline => {
                self.log(LogLevel::Info, "审阅要求调整大纲，等待修改建议。");
                self.phase = Phase::PendingOutlineNote;
                return Ok(Turn::AwaitingOutlineNote);
            }
            ReviewDecision::Feedback(text) => {
                self.log(LogLevel::Info, format!("收到章节修改建议：{text}"));
                self.state.human_feedback = Some(text);
            }
            ReviewDecision::NoDecision => {
                self.log(LogLevel::Info, "审阅输入为空，继续等待。");
                return Ok(self.pending_review_turn());
            }
        }

        self.drive(model)
    }

    /// Resolves the second suspension with the outline revision note.
    pub fn resume_outline_note<M: LanguageModel + ?Sized>(
        &mut self,
        model: &M,
        note: &str,
    ) -> Result<Turn, SessionError> {
        if self.phase != Phase::PendingOutlineNote {
            return Err(SessionError::NotAwaitingOutlineNote);
        }

        let trimmed = note.trim();
        if trimmed.is_empty() {
            self.log(LogLevel::Info, "大纲修改建议为空，返回章节审阅。");
            self.phase = Phase::PendingReview;
            return Ok(self.pending_review_turn());
        }

        self.state.outline_feedback = Some(trimmed.to_string());
        self.state.human_feedback = None;
        self.drive(model)
    }

    fn drive<M: LanguageModel + ?Sized>(&mut self, model: &M) -> Result<Turn, SessionError> {
        loop {
            match route(&self.state) {
                Route::ReviseOutline => {
                    let feedback = self.state.outline_feedback.take();
                    self.regenerate_outline(model, feedback)?;
                }
                Route::GenerateChapter => {
                    let feedback = self.state.human_feedback.take();
                    let chapters = ChapterService::new(self.prompts, self.sink);
                    let request = ChapterRequest::new(
                        self.state.outline.as_ref(),
                        self.state.chapter_index,
                    )
                    .with_feedback(feedback.as_deref());
                    let text = chapters.generate(model, &request)?;
                    self.state.chapter_text = Some(text);
                    self.phase = Phase::PendingReview;
                    return Ok(self.pending_review_turn());
                }
                Route::Finish => {
                    self.log(
                        LogLevel::Info,
                        format!("会话结束，共接受{}章。", self.accepted.len()),
                    );
                    self.phase = Phase::Done;
                    return Ok(Turn::Finished(self.accepted.clone()));
                }
            }
        }
    }

    fn regenerate_outline<M: LanguageModel + ?Sized>(
        &mut self,
        model: &M,
        feedback: Option<String>,
    ) -> Result<(), SessionError> {
        let outlines = OutlineService::new(self.prompts, self.sink);
        let mut request = OutlineRequest::initial(
            self.state.brief.title.clone(),
            self.state.brief.idea.clone(),
            self.state.brief.chapter_count,
        );
        if let (Some(note), Some(current)) = (feedback, self.state.outline.clone()) {
            request = request.revision(current, note);
            // A reworked outline restarts review from the first chapter.
            self.accepted.clear();
        }

        let outline = outlines.generate(model, &request)?;
        self.state.outline = Some(outline);
        self.state.chapter_index = 0;
        self.state.outline_feedback = None;
        Ok(())
    }

    fn record_accepted_chapter(&mut self) {
        let name = self
            .state
            .outline
            .as_ref()
            .and_then(|outline| outline.chapter(self.state.chapter_index))
            .map(|chapter| chapter.name.clone())
            .unwrap_or_default();
        let text = self.state.chapter_text.clone().unwrap_or_default();
        self.accepted.push(AcceptedChapter {
            number: self.state.chapter_index + 1,
            name,
            text,
        });
    }

    fn pending_review_turn(&self) -> Turn {
        let text = self.state.chapter_text.as_deref().unwrap_or_default();
        Turn::AwaitingReview {
            chapter_number: self.state.chapter_index + 1,
            preview: leading_chars(text, self.preview_chars),
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn leading_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(
        outline_len: usize,
        chapter_index: usize,
        outline_feedback: Option<&str>,
        human_feedback: Option<&str>,
    ) -> SessionState {
        use crate::outline::{Outline, OutlineChapter};

        let chapters = (0..outline_len)
            .map(|i| OutlineChapter {
                name: format!("第{}章", i + 1),
                summary: format!("第{}章概要", i + 1),
            })
            .collect();
        SessionState {
            brief: UserBrief::new("T", "I", outline_len as u32),
            outline: Some(Outline::new(String::new(), chapters)),
            outline_feedback: outline_feedback.map(str::to_string),
            chapter_index,
            chapter_text: None,
            human_feedback: human_feedback.map(str::to_string),
        }
    }

    #[test]
    fn outline_feedback_outranks_everything() {
        let state = state_with(2, 0, Some("加反转"), Some("改对话"));
        assert_eq!(route(&state), Route::ReviseOutline);
    }

    #[test]
    fn chapter_feedback_outranks_advancement() {
        let state = state_with(2, 0, None, Some("改对话"));
        assert_eq!(route(&state), Route::GenerateChapter);
    }

    #[test]
    fn remaining_chapters_advance() {
        let state = state_with(2, 1, None, None);
        assert_eq!(route(&state), Route::GenerateChapter);
    }

    #[test]
    fn exhausted_outline_finishes() {
        let state = state_with(2, 2, None, None);
        assert_eq!(route(&state), Route::Finish);
    }

    #[test]
    fn missing_outline_finishes_without_feedback() {
        let state = SessionState::new(UserBrief::new("T", "I", 2));
        assert_eq!(route(&state), Route::Finish);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify_review_input("ACCEPT"), ReviewDecision::Accept);
        assert_eq!(classify_review_input(" Revise "), ReviewDecision::Revise);
        assert_eq!(
            classify_review_input("OUTLINE"),
            ReviewDecision::ReviseOutline
        );
    }

    #[test]
    fn other_text_is_verbatim_feedback() {
        assert_eq!(
            classify_review_input("  节奏太慢了  "),
            ReviewDecision::Feedback("节奏太慢了".to_string())
        );
    }

    #[test]
    fn empty_input_is_no_decision() {
        assert_eq!(classify_review_input("   "), ReviewDecision::NoDecision);
    }

    #[test]
    fn leading_chars_respects_char_boundaries() {
        assert_eq!(leading_chars("第一章正文", 2), "第一");
        assert_eq!(leading_chars("短", 100), "短");
    }
}

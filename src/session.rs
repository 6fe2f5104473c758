use serde::Serialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_DURATION_SECS: u64 = 3600;
pub const VIOLATION_WARN_LIMIT: u32 = 3;
pub const VIOLATION_DEBOUNCE_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Loading,
    Active,
    Saving,
    Completed,
    Failed,
}

/// Which termination trigger fired first. Recorded once; a manual retry after
/// a failed save reuses the original trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishTrigger {
    TimerExpired,
    Submitted,
    ViolationLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// Session is not active; the signal is dropped.
    Ignored,
    /// Within the debounce window of the previous counted signal
    /// (a blur and a visibility-loss for the same event pair).
    Debounced,
    /// Counted; carries the new violation total (1..=VIOLATION_WARN_LIMIT).
    Warning(u32),
    /// Counter exceeded the warning limit; the session must auto-finish.
    LimitReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionQuestion {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    NotActive { status: SessionStatus },
    BadIndex { index: usize, len: usize },
    BadTransition { from: SessionStatus },
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::BadIndex { .. } => "bad_params",
            _ => "bad_state",
        }
    }

    pub fn message(&self) -> String {
        match self {
            SessionError::NotActive { status } => {
                format!("session is not active (status {:?})", status)
            }
            SessionError::BadIndex { index, len } => {
                format!("question index {} out of range ({} questions)", index, len)
            }
            SessionError::BadTransition { from } => {
                format!("operation not allowed in status {:?}", from)
            }
        }
    }
}

/// Full-length submission payload built by the finish procedure. Unanswered
/// slots are empty strings, so the arrays always stay parallel.
#[derive(Debug, Clone)]
pub struct SubmitPayload {
    pub question_ids: Vec<String>,
    pub answers: Vec<String>,
}

/// Timed quiz session: question navigation, answer capture, countdown and
/// integrity-violation counting. Transport and persistence stay outside; the
/// caller drives `tick`/`report_violation` and performs the actual submission
/// when a finish trigger fires.
pub struct QuizSession {
    student_id: String,
    status: SessionStatus,
    questions: Vec<SessionQuestion>,
    answers: Vec<String>,
    current: usize,
    remaining_secs: u64,
    violations: u32,
    last_violation_ms: Option<i64>,
    finish_trigger: Option<FinishTrigger>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub student_id: String,
    pub status: SessionStatus,
    pub question_count: usize,
    pub current_question: usize,
    pub answers: Vec<String>,
    pub remaining_secs: u64,
    pub violations: u32,
    pub finish_trigger: Option<FinishTrigger>,
    pub last_error: Option<String>,
}

impl QuizSession {
    pub fn new(student_id: &str) -> Self {
        QuizSession {
            student_id: student_id.to_string(),
            status: SessionStatus::Idle,
            questions: Vec::new(),
            answers: Vec::new(),
            current: 0,
            remaining_secs: 0,
            violations: 0,
            last_violation_ms: None,
            finish_trigger: None,
            last_error: None,
        }
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn questions(&self) -> &[SessionQuestion] {
        &self.questions
    }

    /// Idle -> Loading. Guards against a duplicate question fetch.
    pub fn begin_loading(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::Idle {
            return Err(SessionError::BadTransition { from: self.status });
        }
        self.status = SessionStatus::Loading;
        Ok(())
    }

    /// Loading -> Active. One empty answer slot per question; countdown armed.
    pub fn activate(
        &mut self,
        questions: Vec<SessionQuestion>,
        duration_secs: u64,
    ) -> Result<(), SessionError> {
        if self.status != SessionStatus::Loading {
            return Err(SessionError::BadTransition { from: self.status });
        }
        self.answers = vec![String::new(); questions.len()];
        self.questions = questions;
        self.current = 0;
        self.remaining_secs = duration_secs;
        self.status = SessionStatus::Active;
        Ok(())
    }

    /// Idempotent overwrite; the value itself is not validated.
    pub fn set_answer(&mut self, index: usize, value: &str) -> Result<(), SessionError> {
        if self.status != SessionStatus::Active {
            return Err(SessionError::NotActive {
                status: self.status,
            });
        }
        if index >= self.answers.len() {
            return Err(SessionError::BadIndex {
                index,
                len: self.answers.len(),
            });
        }
        self.answers[index] = value.to_string();
        Ok(())
    }

    pub fn next(&mut self) -> Result<usize, SessionError> {
        if self.status != SessionStatus::Active {
            return Err(SessionError::NotActive {
                status: self.status,
            });
        }
        if self.current + 1 < self.questions.len() {
            self.current += 1;
        }
        Ok(self.current)
    }

    pub fn previous(&mut self) -> Result<usize, SessionError> {
        if self.status != SessionStatus::Active {
            return Err(SessionError::NotActive {
                status: self.status,
            });
        }
        self.current = self.current.saturating_sub(1);
        Ok(self.current)
    }

    /// Same as `next`; skipping never requires an answer.
    pub fn skip(&mut self) -> Result<usize, SessionError> {
        self.next()
    }

    /// Advances the countdown. Returns the timer trigger exactly once, the
    /// first time the budget is exhausted while the session is active.
    pub fn tick(&mut self, secs: u64) -> Option<FinishTrigger> {
        if self.status != SessionStatus::Active {
            return None;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(secs);
        if self.remaining_secs == 0 {
            Some(FinishTrigger::TimerExpired)
        } else {
            None
        }
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    /// One visibility/focus-loss signal. A blur and a hide arriving for the
    /// same event pair land within the debounce window and count once.
    pub fn report_violation(&mut self, at_ms: i64) -> ViolationOutcome {
        if self.status != SessionStatus::Active {
            return ViolationOutcome::Ignored;
        }
        if let Some(last) = self.last_violation_ms {
            if (at_ms - last).abs() < VIOLATION_DEBOUNCE_MS {
                return ViolationOutcome::Debounced;
            }
        }
        self.last_violation_ms = Some(at_ms);
        self.violations += 1;
        if self.violations > VIOLATION_WARN_LIMIT {
            ViolationOutcome::LimitReached
        } else {
            ViolationOutcome::Warning(self.violations)
        }
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Active|Failed -> Saving. Builds the full-length submission payload.
    /// From Failed this is the manual retry path; the original trigger is kept.
    pub fn begin_saving(
        &mut self,
        trigger: FinishTrigger,
    ) -> Result<SubmitPayload, SessionError> {
        match self.status {
            SessionStatus::Active => {
                self.finish_trigger = Some(trigger);
            }
            SessionStatus::Failed => {
                if self.finish_trigger.is_none() {
                    self.finish_trigger = Some(trigger);
                }
            }
            from => return Err(SessionError::BadTransition { from }),
        }
        self.status = SessionStatus::Saving;
        self.last_error = None;
        Ok(SubmitPayload {
            question_ids: self.questions.iter().map(|q| q.id.clone()).collect(),
            answers: self.answers.clone(),
        })
    }

    /// Saving -> Completed.
    pub fn complete(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::Saving {
            return Err(SessionError::BadTransition { from: self.status });
        }
        self.status = SessionStatus::Completed;
        Ok(())
    }

    /// Loading|Saving -> Failed. The answers stay intact so a manual retry
    /// can resubmit the same payload.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Loading | SessionStatus::Saving => {
                self.status = SessionStatus::Failed;
                self.last_error = Some(message.into());
                Ok(())
            }
            from => Err(SessionError::BadTransition { from }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            student_id: self.student_id.clone(),
            status: self.status,
            question_count: self.questions.len(),
            current_question: self.current,
            answers: self.answers.clone(),
            remaining_secs: self.remaining_secs,
            violations: self.violations,
            finish_trigger: self.finish_trigger,
            last_error: self.last_error.clone(),
        }
    }
}

/// Persisted "completed" marker, the daemon's stand-in for the browser-local
/// flag. Advisory only; the authoritative gate stays the eligibility check.
pub trait CompletionStore {
    fn is_completed(&self, student_id: &str) -> bool;
    fn set_completed(&mut self, student_id: &str) -> anyhow::Result<()>;
    fn clear(&mut self, student_id: &str) -> anyhow::Result<()>;
}

/// Marker files in the workspace directory, one per student.
pub struct FileCompletionStore {
    dir: PathBuf,
}

impl FileCompletionStore {
    pub fn new(workspace: &Path) -> Self {
        FileCompletionStore {
            dir: workspace.to_path_buf(),
        }
    }

    fn marker_path(&self, student_id: &str) -> PathBuf {
        // Student ids are uuids, safe as file name components.
        self.dir.join(format!("apti-completed-{}", student_id))
    }
}

impl CompletionStore for FileCompletionStore {
    fn is_completed(&self, student_id: &str) -> bool {
        self.marker_path(student_id).is_file()
    }

    fn set_completed(&mut self, student_id: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.marker_path(student_id), b"completed")?;
        Ok(())
    }

    fn clear(&mut self, student_id: &str) -> anyhow::Result<()> {
        let path = self.marker_path(student_id);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryCompletionStore {
    completed: std::collections::HashSet<String>,
}

#[cfg(test)]
impl CompletionStore for MemoryCompletionStore {
    fn is_completed(&self, student_id: &str) -> bool {
        self.completed.contains(student_id)
    }

    fn set_completed(&mut self, student_id: &str) -> anyhow::Result<()> {
        self.completed.insert(student_id.to_string());
        Ok(())
    }

    fn clear(&mut self, student_id: &str) -> anyhow::Result<()> {
        self.completed.remove(student_id);
        Ok(())
    }
}

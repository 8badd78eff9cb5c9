// src/engine/session.rs

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::EngineError,
    models::session::{
        AccessAttempt, ClientContext, ExamSession, PlannedQuestion, SessionStatus, StatusChange, StudentInfo,
    },
    repository::{AnswerRepository, SessionRepository},
};

/// Result of `activate`.
#[derive(Debug, Clone)]
pub struct Activation {
    pub session: ExamSession,
    /// False when the session was already in progress.
    pub newly_started: bool,
}

/// Owns session records and their lifecycle.
pub struct SessionStore {
    sessions: Arc<dyn SessionRepository>,
    answers: Arc<dyn AnswerRepository>,
    /// Plan length of lazily planned sessions.
    default_total: u32,
}

impl SessionStore {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        answers: Arc<dyn AnswerRepository>,
        default_total: u32,
    ) -> Self {
        Self {
            sessions,
            answers,
            default_total,
        }
    }

    /// A fresh session id. It is also the seed the sequencer plans from.
    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Inserts a `not_started` session under `id`.
    ///
    /// A non-empty `plan` fixes every position up front and must cover
    /// `0..plan.len()` exactly once; an empty plan is filled lazily.
    /// With `idempotent`, the student's existing pending session is returned
    /// instead, whatever its id.
    pub async fn create_planned_session(
        &self,
        id: String,
        student: StudentInfo,
        mut plan: Vec<PlannedQuestion>,
        idempotent: bool,
    ) -> Result<ExamSession, EngineError> {
        plan.sort_by_key(|q| q.position);
        validate_plan(&plan)?;

        let total = if plan.is_empty() {
            self.default_total
        } else {
            plan.len() as u32
        };
        let session = ExamSession::new(id, student, total, plan);
        let stored = self.sessions.insert(session, idempotent).await?;

        tracing::info!(
            "Planned session {} for student {} ({} questions, {})",
            stored.id,
            stored.student_id(),
            stored.total_questions,
            if stored.question_plan.is_empty() { "lazy" } else { "pre-configured" }
        );
        Ok(stored)
    }

    /// Moves a session to `in_progress` and records the access.
    ///
    /// Calling it on a session already in progress changes nothing but the
    /// access log, so a reloaded start page is harmless.
    pub async fn activate(&self, id: &str, ctx: &ClientContext) -> Result<Activation, EngineError> {
        let change = StatusChange::to(SessionStatus::InProgress);
        let activated = self
            .sessions
            .transition(id, Some(SessionStatus::NotStarted), change)
            .await?;

        let (mut session, newly_started) = match activated {
            Some(session) => {
                tracing::info!("Session {} started for student {}", session.id, session.student_id());
                (session, true)
            }
            None => {
                let session = self.get(id).await?;
                match session.status {
                    SessionStatus::InProgress => (session, false),
                    SessionStatus::Completed | SessionStatus::Timeout => {
                        return Err(EngineError::AlreadyCompleted {
                            session_id: id.to_string(),
                        });
                    }
                    SessionStatus::NotStarted => {
                        return Err(EngineError::Storage(format!(
                            "session {} stayed not_started after activation",
                            id
                        )));
                    }
                }
            }
        };

        let attempt = AccessAttempt::new(ctx, true, None);
        self.sessions.append_access(id, attempt.clone()).await?;
        session.access_log.push(attempt);

        Ok(Activation {
            session,
            newly_started,
        })
    }

    pub async fn get(&self, id: &str) -> Result<ExamSession, EngineError> {
        self.sessions
            .get(id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))
    }

    /// The student's session in progress, if any.
    pub async fn resume(&self, student_id: &str) -> Result<Option<ExamSession>, EngineError> {
        self.sessions
            .find_by_student(student_id, SessionStatus::InProgress)
            .await
    }

    /// The student's planned but not yet started session, if any.
    pub async fn pending(&self, student_id: &str) -> Result<Option<ExamSession>, EngineError> {
        self.sessions
            .find_by_student(student_id, SessionStatus::NotStarted)
            .await
    }

    /// Drops a plan that was never started, such as one that lost a start race.
    pub async fn discard_pending(&self, id: &str) -> Result<bool, EngineError> {
        let discarded = self.sessions.discard_pending(id).await?;
        if discarded {
            tracing::info!("Discarded unstarted session {}", id);
        }
        Ok(discarded)
    }

    /// Every attempt of the student with this email, most recent first.
    pub async fn history(&self, student_email: &str) -> Result<Vec<ExamSession>, EngineError> {
        self.sessions.list_by_student_email(student_email).await
    }

    pub async fn list(&self) -> Result<Vec<ExamSession>, EngineError> {
        self.sessions.list_sessions().await
    }

    pub async fn has_completed(&self, student_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .sessions
            .find_by_student(student_id, SessionStatus::Completed)
            .await?
            .is_some())
    }

    /// Finishes a session in progress.
    ///
    /// Completing a session twice fails with `AlreadyCompleted`.
    pub async fn complete(&self, id: &str, final_score: Option<f64>) -> Result<ExamSession, EngineError> {
        let change = StatusChange {
            final_score,
            ..StatusChange::to(SessionStatus::Completed)
        };
        if let Some(session) = self
            .sessions
            .transition(id, Some(SessionStatus::InProgress), change)
            .await?
        {
            tracing::info!("Session {} completed by student {}", session.id, session.student_id());
            return Ok(session);
        }

        let session = self.get(id).await?;
        match session.status {
            SessionStatus::Completed | SessionStatus::Timeout => Err(EngineError::AlreadyCompleted {
                session_id: id.to_string(),
            }),
            from => Err(EngineError::InvalidTransition {
                session_id: id.to_string(),
                from,
                to: SessionStatus::Completed,
            }),
        }
    }

    /// Number of positions with a final answer. Also refreshes the cached copy.
    pub async fn current_position(&self, id: &str) -> Result<u32, EngineError> {
        let position = self.answers.count_final(id).await?;
        self.sessions.set_current_position(id, position).await?;
        Ok(position)
    }

    /// Administrative status change, allowed in any direction.
    ///
    /// The one-pending and one-in-progress rules still apply.
    pub async fn repair_status(&self, id: &str, to: SessionStatus) -> Result<ExamSession, EngineError> {
        let before = self.get(id).await?;
        let change = StatusChange {
            to,
            at: Utc::now(),
            final_score: None,
        };
        let session = self
            .sessions
            .transition(id, None, change)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;

        tracing::warn!(
            "Session {} status repaired from {} to {}",
            id,
            before.status,
            session.status
        );
        Ok(session)
    }

    pub async fn put_plan_entry(&self, id: &str, entry: PlannedQuestion) -> Result<PlannedQuestion, EngineError> {
        self.sessions.put_plan_entry(id, entry).await
    }
}

fn validate_plan(plan: &[PlannedQuestion]) -> Result<(), EngineError> {
    for (expected, entry) in plan.iter().enumerate() {
        if entry.position != expected as u32 {
            return Err(EngineError::InvalidPlan(format!(
                "expected position {} but found {}",
                expected, entry.position
            )));
        }
        if !(entry.points.is_finite() && entry.points > 0.0) {
            return Err(EngineError::InvalidPlan(format!(
                "position {} has non-positive points",
                entry.position
            )));
        }
    }
    Ok(())
}

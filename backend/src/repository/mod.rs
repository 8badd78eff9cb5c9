// src/repository/mod.rs

//! Persistence ports used by the engine.
//!
//! Every method that checks-then-writes must do so atomically: the engine
//! relies on the store for the one-pending-plan and one-in-progress-session
//! rules and for final-versus-provisional answer merging.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::{
    error::EngineError,
    models::{
        answer::{AnswerRecord, Disposition},
        grade::GradeAggregate,
        question::{Difficulty, QuestionId, QuestionMeta},
        session::{AccessAttempt, ExamSession, PlannedQuestion, SessionStatus, StatusChange},
    },
};

pub mod memory;
pub mod postgres;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Inserts a `not_started` session.
    ///
    /// Fails with `DuplicatePlan` if the student already has a `not_started`
    /// session, unless `idempotent`, in which case that session is returned.
    async fn insert(&self, session: ExamSession, idempotent: bool) -> Result<ExamSession, EngineError>;

    async fn get(&self, id: &str) -> Result<Option<ExamSession>, EngineError>;

    /// Deletes the session if it is still `not_started`. Returns whether it was deleted.
    async fn discard_pending(&self, id: &str) -> Result<bool, EngineError>;

    /// Sessions of the student with this email, most recently started first.
    async fn list_by_student_email(&self, student_email: &str) -> Result<Vec<ExamSession>, EngineError>;

    /// Every session, most recently started first. Never-started sessions come last.
    async fn list_sessions(&self) -> Result<Vec<ExamSession>, EngineError>;

    /// The student's session in `status`, if any. For `completed`, any one of them.
    async fn find_by_student(
        &self,
        student_id: &str,
        status: SessionStatus,
    ) -> Result<Option<ExamSession>, EngineError>;

    /// Applies `change` if the current status is `expected` (any status when `None`).
    ///
    /// Returns `Ok(None)` when the status did not match. Entering `in_progress`
    /// while another session of the same student is in progress fails with
    /// `ConcurrentSessionConflict`. Missing sessions fail with `SessionNotFound`.
    async fn transition(
        &self,
        id: &str,
        expected: Option<SessionStatus>,
        change: StatusChange,
    ) -> Result<Option<ExamSession>, EngineError>;

    async fn append_access(&self, id: &str, attempt: AccessAttempt) -> Result<(), EngineError>;

    /// Stores a plan entry unless its position is already planned.
    /// Returns the entry stored at that position.
    async fn put_plan_entry(&self, id: &str, entry: PlannedQuestion) -> Result<PlannedQuestion, EngineError>;

    async fn set_current_position(&self, id: &str, position: u32) -> Result<(), EngineError>;

    /// Overwrites the embedded review block.
    async fn write_review(&self, id: &str, review: &GradeAggregate) -> Result<(), EngineError>;
}

#[async_trait]
pub trait AnswerRepository: Send + Sync {
    /// Replaces the draft at the record's position in place, or creates it.
    /// Drafts for positions that already hold a final answer are dropped.
    async fn upsert_provisional(&self, record: AnswerRecord) -> Result<(AnswerRecord, Disposition), EngineError>;

    /// Inserts the final answer for the record's position.
    ///
    /// An identical resubmission is `Unchanged`; a differing one fails with
    /// `DuplicateFinalAnswer`.
    async fn insert_final(&self, record: AnswerRecord) -> Result<(AnswerRecord, Disposition), EngineError>;

    /// All records, ordered by position then write sequence.
    async fn list(&self, session_id: &str) -> Result<Vec<AnswerRecord>, EngineError>;

    async fn get(
        &self,
        session_id: &str,
        position: u32,
        provisional: bool,
    ) -> Result<Option<AnswerRecord>, EngineError>;

    /// Number of positions holding a final answer.
    async fn count_final(&self, session_id: &str) -> Result<u32, EngineError>;
}

#[async_trait]
pub trait GradeRepository: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<GradeAggregate>, EngineError>;

    /// Inserts or overwrites the standalone grade record.
    async fn put(&self, grade: &GradeAggregate) -> Result<(), EngineError>;

    /// Every standalone grade record, most recently graded first.
    async fn list_grades(&self) -> Result<Vec<GradeAggregate>, EngineError>;
}

/// Question bank collaborator.
#[async_trait]
pub trait QuestionBank: Send + Sync {
    /// Approved questions of `tier` whose id is not in `excluding`.
    async fn lookup_difficulty_pool(
        &self,
        tier: Difficulty,
        excluding: &HashSet<QuestionId>,
    ) -> Result<Vec<QuestionMeta>, EngineError>;

    async fn question(&self, question_id: QuestionId) -> Result<Option<QuestionMeta>, EngineError>;

    async fn points_for(&self, question_id: QuestionId) -> Result<Option<f64>, EngineError> {
        Ok(self.question(question_id).await?.map(|q| q.points))
    }
}

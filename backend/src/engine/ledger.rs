// src/engine/ledger.rs

use std::{collections::HashSet, sync::Arc};

use crate::{
    error::EngineError,
    models::{
        answer::{AnswerPayload, AnswerRecord, Disposition, RecordOutcome},
        question::QuestionId,
        session::SessionStatus,
    },
    repository::{AnswerRepository, SessionRepository},
};

/// Sequence-numbered answer log of every session.
///
/// Each position holds at most one final record and one provisional draft.
/// A final answer always wins: drafts arriving after it are dropped and a
/// final answer is never replaced. Answers are only taken for positions with
/// an assigned question, and the record's question metadata and points come
/// from that assignment.
pub struct AnswerLedger {
    sessions: Arc<dyn SessionRepository>,
    answers: Arc<dyn AnswerRepository>,
}

impl AnswerLedger {
    pub fn new(sessions: Arc<dyn SessionRepository>, answers: Arc<dyn AnswerRepository>) -> Self {
        Self { sessions, answers }
    }

    pub async fn record_answer(
        &self,
        session_id: &str,
        position: u32,
        payload: AnswerPayload,
        provisional: bool,
    ) -> Result<RecordOutcome, EngineError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        match session.status {
            SessionStatus::InProgress => {}
            SessionStatus::Completed | SessionStatus::Timeout => {
                return Err(EngineError::AlreadyCompleted {
                    session_id: session_id.to_string(),
                });
            }
            status => {
                return Err(EngineError::SessionNotActive {
                    session_id: session_id.to_string(),
                    status,
                });
            }
        }
        if position >= session.total_questions {
            return Err(EngineError::PositionOutOfRange {
                position,
                total: session.total_questions,
            });
        }

        let planned = session
            .planned(position)
            .ok_or_else(|| EngineError::QuestionNotAssigned {
                session_id: session_id.to_string(),
                position,
            })?;
        if payload.question_id != planned.question_id {
            tracing::warn!(
                "Session {} position {}: answer names question {} but {} is assigned",
                session_id,
                position,
                payload.question_id,
                planned.question_id
            );
            return Err(EngineError::QuestionMismatch {
                position,
                assigned: planned.question_id,
                submitted: payload.question_id,
            });
        }

        let record = AnswerRecord::from_payload(session_id, planned, payload, provisional);
        let (record, disposition) = if provisional {
            self.answers.upsert_provisional(record).await?
        } else {
            self.answers.insert_final(record).await?
        };

        match disposition {
            Disposition::Created if !provisional => {
                let answered = self.answers.count_final(session_id).await?;
                self.sessions.set_current_position(session_id, answered).await?;
                tracing::info!(
                    "Final answer recorded for session {} position {} (seq {})",
                    session_id,
                    position,
                    record.sequence
                );
            }
            Disposition::IgnoredAfterFinal => {
                tracing::debug!(
                    "Auto-save for session {} position {} dropped, final answer exists",
                    session_id,
                    position
                );
            }
            Disposition::Unchanged => {
                tracing::debug!(
                    "Duplicate final answer for session {} position {} ignored",
                    session_id,
                    position
                );
            }
            _ => {}
        }

        Ok(RecordOutcome { record, disposition })
    }

    /// Every record of a session, ordered by position then sequence.
    pub async fn answers_for(&self, session_id: &str) -> Result<Vec<AnswerRecord>, EngineError> {
        self.answers.list(session_id).await
    }

    pub async fn final_answers(&self, session_id: &str) -> Result<Vec<AnswerRecord>, EngineError> {
        let mut records = self.answers.list(session_id).await?;
        records.retain(|r| !r.is_provisional);
        Ok(records)
    }

    /// The draft at `position`, unless a final answer superseded it.
    pub async fn provisional_for(
        &self,
        session_id: &str,
        position: u32,
    ) -> Result<Option<AnswerRecord>, EngineError> {
        if self.answers.get(session_id, position, false).await?.is_some() {
            return Ok(None);
        }
        self.answers.get(session_id, position, true).await
    }

    /// Question ids already answered in the session, final or provisional.
    pub async fn used_question_ids(&self, session_id: &str) -> Result<HashSet<QuestionId>, EngineError> {
        Ok(self
            .answers
            .list(session_id)
            .await?
            .into_iter()
            .map(|r| r.question_id)
            .collect())
    }
}

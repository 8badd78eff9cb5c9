// src/models/answer.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{
    question::{Difficulty, QuestionId},
    session::PlannedQuestion,
};

/// What the student sent for one position.
///
/// Question metadata is never taken from the client: `question_id` only has
/// to match the question assigned to the position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AnswerPayload {
    pub question_id: QuestionId,
    #[validate(length(max = 20000, message = "Answer is too long."))]
    pub student_answer: String,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub time_spent_seconds: u32,
    /// Keystroke telemetry, stored as-is.
    #[serde(default)]
    pub typing_telemetry: serde_json::Value,
}

/// A persisted answer. At most one final and one provisional record exist per position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub session_id: String,
    pub position: u32,
    pub question_id: QuestionId,
    pub question_text: String,
    pub difficulty: Difficulty,
    pub student_answer: String,
    pub correct_answer: Option<String>,
    /// Never set on provisional records.
    pub is_correct: Option<bool>,
    pub time_spent_seconds: u32,
    /// Points of the assigned question when the answer was written.
    pub points: Option<f64>,
    pub typing_telemetry: serde_json::Value,
    pub is_provisional: bool,
    /// Store-assigned, strictly increasing write order.
    pub sequence: i64,
    pub submitted_at: DateTime<Utc>,
}

impl AnswerRecord {
    /// Builds an unsaved record for the question assigned at `planned`.
    /// The store assigns `sequence`.
    pub fn from_payload(
        session_id: &str,
        planned: &PlannedQuestion,
        payload: AnswerPayload,
        provisional: bool,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            position: planned.position,
            question_id: planned.question_id,
            question_text: planned.question_text.clone(),
            difficulty: planned.difficulty,
            student_answer: payload.student_answer,
            correct_answer: if provisional { None } else { payload.correct_answer },
            is_correct: if provisional { None } else { payload.is_correct },
            time_spent_seconds: payload.time_spent_seconds,
            points: Some(planned.points).filter(|p| p.is_finite() && *p > 0.0),
            typing_telemetry: payload.typing_telemetry,
            is_provisional: provisional,
            sequence: 0,
            submitted_at: Utc::now(),
        }
    }
}

/// How a write was merged into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Created,
    /// A provisional draft replaced the previous draft in place.
    Replaced,
    /// Identical final resubmission; nothing changed.
    Unchanged,
    /// Auto-save arrived after the final answer and was dropped.
    IgnoredAfterFinal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    /// The record that is now authoritative for the position.
    pub record: AnswerRecord,
    pub disposition: Disposition,
}

/// Body of the answer and auto-save endpoints.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitAnswerRequest {
    pub position: u32,
    #[validate(nested)]
    #[serde(flatten)]
    pub answer: AnswerPayload,
}

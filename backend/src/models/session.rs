// src/models/session.rs

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{
    grade::GradeAggregate,
    question::{Difficulty, QuestionId},
};

/// Lifecycle of an exam session.
///
/// Normal flow is `NotStarted -> InProgress -> Completed`. `Timeout` is only
/// entered through an administrative repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NotStarted,
    InProgress,
    Completed,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "not_started",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Timeout)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(SessionStatus::NotStarted),
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "timeout" => Ok(SessionStatus::Timeout),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Who is taking the exam. Identity is supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StudentInfo {
    #[validate(length(min = 1, max = 64, message = "student_id must be 1-64 characters."))]
    pub student_id: String,
    #[validate(email(message = "student_email must be a valid email address."))]
    pub student_email: String,
    #[validate(length(max = 200))]
    #[serde(default)]
    pub student_name: String,
}

/// One fixed slot of a session's question plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedQuestion {
    pub position: u32,
    pub difficulty: Difficulty,
    pub question_id: QuestionId,
    #[serde(default)]
    pub question_text: String,
    pub points: f64,
    #[serde(default)]
    pub expected_keywords: Vec<String>,
}

/// Where a request came from. Both fields are opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientContext {
    pub client_address: Option<String>,
    pub device_fingerprint: Option<serde_json::Value>,
}

/// Append-only access log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessAttempt {
    pub timestamp: DateTime<Utc>,
    pub client_address: Option<String>,
    pub device_fingerprint: Option<serde_json::Value>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccessAttempt {
    pub fn new(ctx: &ClientContext, accepted: bool, reason: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            client_address: ctx.client_address.clone(),
            device_fingerprint: ctx.device_fingerprint.clone(),
            accepted,
            reason,
        }
    }
}

/// One exam attempt by one student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamSession {
    pub id: String,
    #[serde(flatten)]
    pub student: StudentInfo,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_questions: u32,
    /// Ordered by position. Empty or partial for lazily planned sessions.
    pub question_plan: Vec<PlannedQuestion>,
    /// Cached copy of the final-answer count; the ledger is authoritative.
    pub current_position: u32,
    pub score: Option<f64>,
    pub access_log: Vec<AccessAttempt>,
    /// Embedded copy of the grade aggregate.
    pub review: Option<GradeAggregate>,
}

impl ExamSession {
    pub fn new(id: String, student: StudentInfo, total_questions: u32, plan: Vec<PlannedQuestion>) -> Self {
        Self {
            id,
            student,
            status: SessionStatus::NotStarted,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            total_questions,
            question_plan: plan,
            current_position: 0,
            score: None,
            access_log: Vec::new(),
            review: None,
        }
    }

    pub fn student_id(&self) -> &str {
        &self.student.student_id
    }

    pub fn planned(&self, position: u32) -> Option<&PlannedQuestion> {
        self.question_plan.iter().find(|q| q.position == position)
    }

    /// First accepted access, used as the client pin.
    pub fn first_accepted_access(&self) -> Option<&AccessAttempt> {
        self.access_log.iter().find(|a| a.accepted)
    }

    /// Applies a status change to the in-memory record.
    pub fn apply(&mut self, change: &StatusChange) {
        self.status = change.to;
        match change.to {
            SessionStatus::NotStarted => {
                self.start_time = None;
                self.end_time = None;
            }
            SessionStatus::InProgress => {
                if self.start_time.is_none() {
                    self.start_time = Some(change.at);
                }
                self.end_time = None;
            }
            SessionStatus::Completed | SessionStatus::Timeout => {
                self.end_time = Some(change.at);
            }
        }
        if let Some(score) = change.final_score {
            self.score = Some(score);
        }
    }

    /// Inserts a plan entry unless the position is already planned.
    /// Returns the entry that ends up stored.
    pub fn plan_entry_or_insert(&mut self, entry: PlannedQuestion) -> PlannedQuestion {
        if let Some(existing) = self.planned(entry.position) {
            return existing.clone();
        }
        let at = self
            .question_plan
            .iter()
            .position(|q| q.position > entry.position)
            .unwrap_or(self.question_plan.len());
        self.question_plan.insert(at, entry.clone());
        entry
    }
}

/// A requested status transition, applied atomically by the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub to: SessionStatus,
    pub at: DateTime<Utc>,
    pub final_score: Option<f64>,
}

impl StatusChange {
    pub fn to(status: SessionStatus) -> Self {
        Self {
            to: status,
            at: Utc::now(),
            final_score: None,
        }
    }
}

/// Body of `POST /api/exam/start`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartExamRequest {
    #[validate(nested)]
    #[serde(flatten)]
    pub student: StudentInfo,
    #[serde(default)]
    pub device_fingerprint: Option<serde_json::Value>,
}

/// Body of `POST /api/admin/exam/plan`. An empty plan is generated.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlanExamRequest {
    #[validate(nested)]
    #[serde(flatten)]
    pub student: StudentInfo,
    #[serde(default)]
    pub plan: Vec<PlannedQuestion>,
    #[serde(default)]
    pub idempotent: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompleteExamRequest {
    #[serde(default)]
    pub final_score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairStatusRequest {
    pub status: SessionStatus,
}

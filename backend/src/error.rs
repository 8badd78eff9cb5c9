// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::models::{
    question::{Difficulty, QuestionId},
    session::SessionStatus,
};

/// Failures of the exam engine.
///
/// Warnings that do not stop an operation (degraded question selection,
/// low-confidence max scores) are not errors; they travel on the returned value.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A second in-progress session was about to be created for a student.
    /// Callers should resume `existing_session` instead.
    #[error("student {student_id} already has session {existing_session} in progress")]
    ConcurrentSessionConflict {
        student_id: String,
        existing_session: String,
    },

    #[error("session {session_id} is already completed")]
    AlreadyCompleted { session_id: String },

    /// The one-exam-per-lifetime rule denied a new start.
    #[error("student {student_id} has already completed an exam")]
    ExamAlreadyTaken { student_id: String },

    #[error("a pending exam plan already exists for student {student_id}")]
    DuplicatePlan { student_id: String },

    #[error("position {position} of session {session_id} already has a different final answer")]
    DuplicateFinalAnswer { session_id: String, position: u32 },

    #[error("no approved question available (requested tier: {tier})")]
    QuestionPoolExhausted { tier: Difficulty },

    /// The grade record was written but the session's review block was not.
    #[error("grade for session {session_id} saved, review block not synchronized: {reason}")]
    SyncPending { session_id: String, reason: String },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {session_id} is {status}, not in progress")]
    SessionNotActive {
        session_id: String,
        status: SessionStatus,
    },

    #[error("session {session_id} cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("position {position} is outside the exam (total questions: {total})")]
    PositionOutOfRange { position: u32, total: u32 },

    /// An answer arrived for a position whose question was never served.
    #[error("no question has been assigned to position {position} of session {session_id}")]
    QuestionNotAssigned { session_id: String, position: u32 },

    #[error("position {position} is assigned question {assigned}, not {submitted}")]
    QuestionMismatch {
        position: u32,
        assigned: QuestionId,
        submitted: QuestionId,
    },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid grade: {0}")]
    InvalidGrade(String),

    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

/// Global Application Error Enum.
/// Centralizes error handling and mapping to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    // 500 Internal Server Error
    InternalServerError(String),

    // 503 Service Unavailable (grade saved, review sync pending)
    SyncPending(String),

    // 400 Bad Request
    BadRequest(String),

    // 403 Forbidden (exam already taken, access denied)
    Forbidden(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict (e.g., concurrent session, duplicate plan)
    Conflict(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for AppError {}

/// Implements `IntoResponse` for `AppError`.
/// Converts the error into a JSON response with appropriate HTTP status code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::SyncPending(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };
        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Maps engine failures onto HTTP semantics.
impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let msg = err.to_string();
        match err {
            EngineError::ConcurrentSessionConflict { .. }
            | EngineError::DuplicatePlan { .. }
            | EngineError::DuplicateFinalAnswer { .. } => AppError::Conflict(msg),
            EngineError::AlreadyCompleted { .. }
            | EngineError::ExamAlreadyTaken { .. }
            | EngineError::AccessDenied { .. } => AppError::Forbidden(msg),
            EngineError::SessionNotFound(_) => AppError::NotFound(msg),
            EngineError::SessionNotActive { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::PositionOutOfRange { .. }
            | EngineError::QuestionNotAssigned { .. }
            | EngineError::QuestionMismatch { .. }
            | EngineError::InvalidPlan(_)
            | EngineError::InvalidGrade(_) => AppError::BadRequest(msg),
            EngineError::SyncPending { .. } => AppError::SyncPending(msg),
            EngineError::QuestionPoolExhausted { .. } | EngineError::Storage(_) => {
                AppError::InternalServerError(msg)
            }
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

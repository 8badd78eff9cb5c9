// src/handlers/grading.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use validator::Validate;

use crate::{
    engine::ExamEngine,
    error::AppError,
    models::{
        grade::{FullGradeInput, PartialGradeInput},
        session::{PlanExamRequest, RepairStatusRequest},
    },
};

/// Creates a pre-configured exam for a student.
///
/// An empty `plan` is generated from the question bank.
pub async fn plan_exam(
    State(engine): State<Arc<ExamEngine>>,
    Json(payload): Json<PlanExamRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let (session, warnings) = engine
        .plan_exam(payload.student, payload.plan, payload.idempotent)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "session": session,
            "warnings": warnings,
        })),
    ))
}

/// All sessions, most recently started first, with a `graded` flag.
pub async fn list_sessions(State(engine): State<Arc<ExamEngine>>) -> Result<impl IntoResponse, AppError> {
    let sessions = engine.list_sessions().await?;
    Ok(Json(sessions))
}

pub async fn list_grades(State(engine): State<Arc<ExamEngine>>) -> Result<impl IntoResponse, AppError> {
    let grades = engine.list_grades().await?;
    Ok(Json(grades))
}

/// The session with its final answers and their questions, for the grader.
pub async fn exam_for_grading(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let view = engine.exam_for_grading(&id).await?;
    Ok(Json(view))
}

/// Grades a whole session. Totals in the response are recomputed server-side.
pub async fn grade_exam(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
    Json(payload): Json<FullGradeInput>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let outcome = engine.grade_full(&id, payload).await?;
    Ok(Json(outcome))
}

pub async fn grade_question(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
    Json(payload): Json<PartialGradeInput>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let outcome = engine.grade_question(&id, payload).await?;
    Ok(Json(outcome))
}

pub async fn get_grade(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let grade = engine
        .grade_for(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Session {} has not been graded", id)))?;
    Ok(Json(grade))
}

pub async fn reconcile(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let aggregate = engine.reconcile(&id).await?;
    Ok(Json(aggregate))
}

pub async fn repair_status(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
    Json(payload): Json<RepairStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = engine.repair_status(&id, payload.status).await?;
    Ok(Json(session))
}

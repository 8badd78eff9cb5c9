// src/handlers/exam.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::json;
use validator::Validate;

use crate::{
    engine::ExamEngine,
    error::AppError,
    models::{
        answer::SubmitAnswerRequest,
        session::{CompleteExamRequest, StartExamRequest},
    },
    utils::client::client_context,
};

/// Starts the student's exam, or resumes the one in progress.
///
/// * Refuses students who already completed an exam (403).
/// * Reloading the start page returns the same session (`resumed: true`).
pub async fn start_exam(
    State(engine): State<Arc<ExamEngine>>,
    headers: HeaderMap,
    Json(payload): Json<StartExamRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let ctx = client_context(&headers, payload.device_fingerprint);
    let outcome = engine.start_exam(payload.student, &ctx).await?;

    let status = if outcome.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

pub async fn check_session(
    State(engine): State<Arc<ExamEngine>>,
    Path(student_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let check = engine.check_session(&student_id).await?;
    Ok(Json(json!({
        "has_active_session": check.is_some(),
        "active": check,
    })))
}

pub async fn check_completed(
    State(engine): State<Arc<ExamEngine>>,
    Path(student_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let completed = engine.has_completed(&student_id).await?;
    Ok(Json(json!({
        "student_id": student_id,
        "has_completed": completed,
    })))
}

pub async fn get_session(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = engine.session(&id).await?;
    Ok(Json(session))
}

/// Returns the question at a position, assigning one on first access.
pub async fn get_question(
    State(engine): State<Arc<ExamEngine>>,
    Path((id, position)): Path<(String, u32)>,
) -> Result<impl IntoResponse, AppError> {
    let assignment = engine.question_at(&id, position).await?;
    Ok(Json(assignment))
}

/// Records the final answer for a position.
pub async fn submit_answer(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let outcome = engine.submit_answer(&id, payload.position, payload.answer).await?;
    Ok(Json(outcome))
}

/// Saves a draft. Drafts never replace a final answer.
pub async fn auto_save(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let outcome = engine.auto_save(&id, payload.position, payload.answer).await?;
    Ok(Json(outcome))
}

pub async fn get_draft(
    State(engine): State<Arc<ExamEngine>>,
    Path((id, position)): Path<(String, u32)>,
) -> Result<impl IntoResponse, AppError> {
    let draft = engine
        .draft(&id, position)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No draft saved at position {}", position)))?;
    Ok(Json(draft))
}

pub async fn complete_exam(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
    payload: Option<Json<CompleteExamRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let session = engine.complete(&id, payload.final_score).await?;
    Ok(Json(session))
}

pub async fn get_results(
    State(engine): State<Arc<ExamEngine>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let results = engine.results(&id).await?;
    Ok(Json(results))
}

/// Every attempt of a student, looked up by email.
pub async fn exam_history(
    State(engine): State<Arc<ExamEngine>>,
    Path(student_email): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let history = engine.exam_history(&student_email).await?;
    Ok(Json(history))
}

// src/routes.rs

use axum::{
    Router,
    http::{Method, header},
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers::{exam, grading},
    state::AppState,
};

/// Assembles the main application router.
///
/// * Student-facing exam routes under `/api/exam` and `/api/student`.
/// * Grading, overview and repair routes under `/api/admin`.
/// * Global middleware (Trace, CORS).
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let exam_routes = Router::new()
        .route("/start", post(exam::start_exam))
        .route("/check-session/{student_id}", get(exam::check_session))
        .route("/check-completed/{student_id}", get(exam::check_completed))
        .route("/{id}", get(exam::get_session))
        .route("/{id}/question/{position}", get(exam::get_question))
        .route("/{id}/answer", post(exam::submit_answer))
        .route("/{id}/auto-save", post(exam::auto_save))
        .route("/{id}/draft/{position}", get(exam::get_draft))
        .route("/{id}/complete", post(exam::complete_exam))
        .route("/{id}/results", get(exam::get_results));

    let student_routes = Router::new().route("/{student_email}/exam-history", get(exam::exam_history));

    let admin_routes = Router::new()
        .route("/exam-sessions", get(grading::list_sessions))
        .route("/exam-grades", get(grading::list_grades))
        .route("/exam/plan", post(grading::plan_exam))
        .route("/exam/{id}/for-grading", get(grading::exam_for_grading))
        .route(
            "/exam/{id}/grade",
            get(grading::get_grade).post(grading::grade_exam),
        )
        .route("/exam/{id}/grade/question", post(grading::grade_question))
        .route("/exam/{id}/reconcile", post(grading::reconcile))
        .route("/exam/{id}/repair", post(grading::repair_status));

    Router::new()
        .nest("/api/exam", exam_routes)
        .nest("/api/student", student_routes)
        .nest("/api/admin", admin_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

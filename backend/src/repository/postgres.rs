// src/repository/postgres.rs

//! Postgres adapters. Sessions keep their plan, access log and review block
//! as JSONB; the one-pending / one-active rules are partial unique indexes
//! (see `migrations/`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row, types::Json};

use crate::{
    error::EngineError,
    models::{
        answer::{AnswerRecord, Disposition},
        grade::{GradeAggregate, QuestionGrade},
        question::RawQuestion,
        session::{AccessAttempt, ExamSession, PlannedQuestion, SessionStatus, StatusChange, StudentInfo},
    },
    repository::{AnswerRepository, GradeRepository, SessionRepository, memory::MemoryQuestionBank},
};

const SESSION_COLUMNS: &str = "id, student_id, student_email, student_name, status, created_at, \
     start_time, end_time, total_questions, question_plan, current_position, score, access_log, review";

const ANSWER_COLUMNS: &str = "session_id, position, is_provisional, question_id, question_text, \
     difficulty, student_answer, correct_answer, is_correct, time_spent_seconds, points, \
     typing_telemetry, sequence, submitted_at";

const PENDING_INDEX: &str = "exam_sessions_one_pending";
const ACTIVE_INDEX: &str = "exam_sessions_one_active";

/// Which per-student uniqueness rule a failed write hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionConstraint {
    OnePending,
    OneActive,
}

/// Maps a unique-index name on `exam_sessions` to the rule it enforces.
pub fn classify_constraint(constraint: Option<&str>) -> Option<SessionConstraint> {
    match constraint? {
        PENDING_INDEX => Some(SessionConstraint::OnePending),
        ACTIVE_INDEX => Some(SessionConstraint::OneActive),
        _ => None,
    }
}

fn violated_constraint(err: &sqlx::Error) -> Option<SessionConstraint> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => classify_constraint(db.constraint()),
        _ => None,
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: String,
    student_id: String,
    student_email: String,
    student_name: String,
    status: String,
    created_at: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    total_questions: i32,
    question_plan: Json<Vec<PlannedQuestion>>,
    current_position: i32,
    score: Option<f64>,
    access_log: Json<Vec<AccessAttempt>>,
    review: Option<Json<GradeAggregate>>,
}

impl TryFrom<SessionRow> for ExamSession {
    type Error = EngineError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<SessionStatus>().map_err(EngineError::Storage)?;
        Ok(ExamSession {
            id: row.id,
            student: StudentInfo {
                student_id: row.student_id,
                student_email: row.student_email,
                student_name: row.student_name,
            },
            status,
            created_at: row.created_at,
            start_time: row.start_time,
            end_time: row.end_time,
            total_questions: row.total_questions.max(0) as u32,
            question_plan: row.question_plan.0,
            current_position: row.current_position.max(0) as u32,
            score: row.score,
            access_log: row.access_log.0,
            review: row.review.map(|r| r.0),
        })
    }
}

#[derive(FromRow)]
struct AnswerRow {
    session_id: String,
    position: i32,
    is_provisional: bool,
    question_id: i64,
    question_text: String,
    difficulty: String,
    student_answer: String,
    correct_answer: Option<String>,
    is_correct: Option<bool>,
    time_spent_seconds: i32,
    points: Option<f64>,
    typing_telemetry: Json<serde_json::Value>,
    sequence: i64,
    submitted_at: DateTime<Utc>,
}

impl TryFrom<AnswerRow> for AnswerRecord {
    type Error = EngineError;

    fn try_from(row: AnswerRow) -> Result<Self, Self::Error> {
        Ok(AnswerRecord {
            session_id: row.session_id,
            position: row.position.max(0) as u32,
            question_id: row.question_id,
            question_text: row.question_text,
            difficulty: row.difficulty.parse().map_err(EngineError::Storage)?,
            student_answer: row.student_answer,
            correct_answer: row.correct_answer,
            is_correct: row.is_correct,
            time_spent_seconds: row.time_spent_seconds.max(0) as u32,
            points: row.points,
            typing_telemetry: row.typing_telemetry.0,
            is_provisional: row.is_provisional,
            sequence: row.sequence,
            submitted_at: row.submitted_at,
        })
    }
}

#[derive(FromRow)]
struct GradeRow {
    session_id: String,
    graded_by: String,
    graded_at: DateTime<Utc>,
    total_score: f64,
    max_score: f64,
    percentage: i32,
    question_grades: Json<Vec<QuestionGrade>>,
    overall_feedback: String,
    excluded_positions: Json<Vec<u32>>,
    is_graded: bool,
}

impl From<GradeRow> for GradeAggregate {
    fn from(row: GradeRow) -> Self {
        GradeAggregate {
            session_id: row.session_id,
            graded_by: row.graded_by,
            graded_at: row.graded_at,
            total_score: row.total_score,
            max_score: row.max_score,
            percentage: row.percentage.max(0) as u32,
            question_grades: row.question_grades.0,
            overall_feedback: row.overall_feedback,
            excluded_positions: row.excluded_positions.0,
            is_graded: row.is_graded,
        }
    }
}

#[derive(FromRow)]
struct QuestionRow {
    id: i64,
    difficulty: String,
    points: Option<f64>,
    text: String,
    expected_keywords: Json<Vec<String>>,
    approved: bool,
}

/// Loads approved questions into an in-memory bank, resolving tiers and points once.
pub async fn load_question_bank(pool: &PgPool) -> Result<MemoryQuestionBank, EngineError> {
    let rows = sqlx::query_as::<_, QuestionRow>(
        "SELECT id, difficulty, points, text, expected_keywords, approved FROM questions WHERE approved",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to load question bank: {:?}", e);
        EngineError::from(e)
    })?;

    let raw = rows
        .into_iter()
        .map(|r| RawQuestion {
            id: r.id,
            difficulty: r.difficulty,
            points: r.points,
            text: r.text,
            expected_keywords: r.expected_keywords.0,
            approved: r.approved,
        })
        .collect();

    let bank = MemoryQuestionBank::from_raw(raw);
    tracing::info!("Loaded {} approved questions from database", bank.len());
    Ok(bank)
}

/// Sessions, answers and grades in Postgres. Cheap to clone; shares one pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<ExamSession>, EngineError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM exam_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExamSession::try_from).transpose()
    }

    async fn conflict_for(&self, session_id: &str) -> Result<EngineError, EngineError> {
        let student_id: String = sqlx::query_scalar("SELECT student_id FROM exam_sessions WHERE id = $1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let existing = self
            .find_by_student(&student_id, SessionStatus::InProgress)
            .await?
            .map(|s| s.id)
            .unwrap_or_default();
        Ok(EngineError::ConcurrentSessionConflict {
            student_id,
            existing_session: existing,
        })
    }

    async fn fetch_answer(
        &self,
        session_id: &str,
        position: u32,
        provisional: bool,
    ) -> Result<Option<AnswerRecord>, EngineError> {
        let row = sqlx::query_as::<_, AnswerRow>(&format!(
            "SELECT {} FROM exam_answers WHERE session_id = $1 AND position = $2 AND is_provisional = $3",
            ANSWER_COLUMNS
        ))
        .bind(session_id)
        .bind(position as i32)
        .bind(provisional)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AnswerRecord::try_from).transpose()
    }
}

#[async_trait]
impl SessionRepository for PgStore {
    async fn insert(&self, session: ExamSession, idempotent: bool) -> Result<ExamSession, EngineError> {
        let result = sqlx::query_as::<_, SessionRow>(&format!(
            "INSERT INTO exam_sessions (id, student_id, student_email, student_name, status, created_at, \
             total_questions, question_plan, current_position, access_log) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, '[]'::jsonb) RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(&session.id)
        .bind(session.student_id())
        .bind(&session.student.student_email)
        .bind(&session.student.student_name)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.total_questions as i32)
        .bind(Json(&session.question_plan))
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => ExamSession::try_from(row),
            Err(e) if violated_constraint(&e) == Some(SessionConstraint::OnePending) => {
                if idempotent {
                    if let Some(pending) = self
                        .find_by_student(session.student_id(), SessionStatus::NotStarted)
                        .await?
                    {
                        return Ok(pending);
                    }
                }
                Err(EngineError::DuplicatePlan {
                    student_id: session.student_id().to_string(),
                })
            }
            Err(e) => {
                tracing::error!("Failed to insert exam session: {:?}", e);
                Err(e.into())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ExamSession>, EngineError> {
        self.fetch_session(id).await
    }

    async fn discard_pending(&self, id: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM exam_sessions WHERE id = $1 AND status = 'not_started'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_student_email(&self, student_email: &str) -> Result<Vec<ExamSession>, EngineError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM exam_sessions WHERE student_email = $1 \
             ORDER BY start_time DESC NULLS LAST, created_at DESC",
            SESSION_COLUMNS
        ))
        .bind(student_email)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExamSession::try_from).collect()
    }

    async fn list_sessions(&self) -> Result<Vec<ExamSession>, EngineError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM exam_sessions ORDER BY start_time DESC NULLS LAST, created_at DESC",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExamSession::try_from).collect()
    }

    async fn find_by_student(
        &self,
        student_id: &str,
        status: SessionStatus,
    ) -> Result<Option<ExamSession>, EngineError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM exam_sessions WHERE student_id = $1 AND status = $2 \
             ORDER BY created_at ASC LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(student_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExamSession::try_from).transpose()
    }

    async fn transition(
        &self,
        id: &str,
        expected: Option<SessionStatus>,
        change: StatusChange,
    ) -> Result<Option<ExamSession>, EngineError> {
        let result = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE exam_sessions SET \
                status = $3::text, \
                start_time = CASE \
                    WHEN $3::text = 'in_progress' THEN COALESCE(start_time, $4::timestamptz) \
                    WHEN $3::text = 'not_started' THEN NULL \
                    ELSE start_time END, \
                end_time = CASE WHEN $3::text IN ('completed', 'timeout') THEN $4::timestamptz ELSE NULL END, \
                score = COALESCE($5::double precision, score) \
             WHERE id = $1 AND ($2::text IS NULL OR status = $2::text) \
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(id)
        .bind(expected.map(SessionStatus::as_str))
        .bind(change.to.as_str())
        .bind(change.at)
        .bind(change.final_score)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => ExamSession::try_from(row).map(Some),
            Ok(None) => match self.fetch_session(id).await? {
                Some(_) => Ok(None),
                None => Err(EngineError::SessionNotFound(id.to_string())),
            },
            Err(e) => match violated_constraint(&e) {
                Some(SessionConstraint::OneActive) => Err(self.conflict_for(id).await?),
                Some(SessionConstraint::OnePending) => {
                    let session = self
                        .fetch_session(id)
                        .await?
                        .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
                    Err(EngineError::DuplicatePlan {
                        student_id: session.student.student_id,
                    })
                }
                None => {
                    tracing::error!("Failed to update session {} status: {:?}", id, e);
                    Err(e.into())
                }
            },
        }
    }

    async fn append_access(&self, id: &str, attempt: AccessAttempt) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE exam_sessions SET access_log = access_log || jsonb_build_array($2::jsonb) WHERE id = $1",
        )
        .bind(id)
        .bind(Json(&attempt))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn put_plan_entry(&self, id: &str, entry: PlannedQuestion) -> Result<PlannedQuestion, EngineError> {
        sqlx::query(
            "UPDATE exam_sessions SET question_plan = ( \
                SELECT jsonb_agg(e ORDER BY (e->>'position')::int) \
                FROM jsonb_array_elements(question_plan || jsonb_build_array($2::jsonb)) AS e) \
             WHERE id = $1 AND NOT EXISTS ( \
                SELECT 1 FROM jsonb_array_elements(question_plan) AS p \
                WHERE (p->>'position')::int = $3)",
        )
        .bind(id)
        .bind(Json(&entry))
        .bind(entry.position as i32)
        .execute(&self.pool)
        .await?;

        let session = self
            .fetch_session(id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        session
            .planned(entry.position)
            .cloned()
            .ok_or_else(|| EngineError::Storage(format!("plan entry {} of {} not stored", entry.position, id)))
    }

    async fn set_current_position(&self, id: &str, position: u32) -> Result<(), EngineError> {
        sqlx::query("UPDATE exam_sessions SET current_position = $2 WHERE id = $1")
            .bind(id)
            .bind(position as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_review(&self, id: &str, review: &GradeAggregate) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE exam_sessions SET review = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(review))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnswerRepository for PgStore {
    async fn upsert_provisional(&self, record: AnswerRecord) -> Result<(AnswerRecord, Disposition), EngineError> {
        let row = sqlx::query(&format!(
            "INSERT INTO exam_answers (session_id, position, is_provisional, question_id, question_text, \
                difficulty, student_answer, correct_answer, is_correct, time_spent_seconds, points, \
                typing_telemetry, submitted_at) \
             SELECT $1::text, $2::int, TRUE, $3::bigint, $4::text, $5::text, $6::text, NULL, NULL, \
                $7::int, $8::double precision, $9::jsonb, $10::timestamptz \
             WHERE NOT EXISTS ( \
                SELECT 1 FROM exam_answers \
                WHERE session_id = $1 AND position = $2 AND is_provisional = FALSE) \
             ON CONFLICT (session_id, position, is_provisional) DO UPDATE SET \
                question_id = EXCLUDED.question_id, \
                question_text = EXCLUDED.question_text, \
                difficulty = EXCLUDED.difficulty, \
                student_answer = EXCLUDED.student_answer, \
                time_spent_seconds = EXCLUDED.time_spent_seconds, \
                points = EXCLUDED.points, \
                typing_telemetry = EXCLUDED.typing_telemetry, \
                submitted_at = EXCLUDED.submitted_at, \
                sequence = nextval('exam_answer_seq') \
             RETURNING {}, (xmax = 0) AS inserted",
            ANSWER_COLUMNS
        ))
        .bind(&record.session_id)
        .bind(record.position as i32)
        .bind(record.question_id)
        .bind(&record.question_text)
        .bind(record.difficulty.as_str())
        .bind(&record.student_answer)
        .bind(record.time_spent_seconds as i32)
        .bind(record.points)
        .bind(Json(&record.typing_telemetry))
        .bind(record.submitted_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let inserted: bool = row.try_get("inserted")?;
                let stored = AnswerRecord::try_from(AnswerRow::from_row(&row)?)?;
                let disposition = if inserted {
                    Disposition::Created
                } else {
                    Disposition::Replaced
                };
                Ok((stored, disposition))
            }
            None => {
                let final_record = self
                    .fetch_answer(&record.session_id, record.position, false)
                    .await?
                    .ok_or_else(|| EngineError::Storage("auto-save dropped without a final answer".into()))?;
                Ok((final_record, Disposition::IgnoredAfterFinal))
            }
        }
    }

    async fn insert_final(&self, record: AnswerRecord) -> Result<(AnswerRecord, Disposition), EngineError> {
        let row = sqlx::query_as::<_, AnswerRow>(&format!(
            "INSERT INTO exam_answers (session_id, position, is_provisional, question_id, question_text, \
                difficulty, student_answer, correct_answer, is_correct, time_spent_seconds, points, \
                typing_telemetry, submitted_at) \
             VALUES ($1, $2, FALSE, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (session_id, position, is_provisional) DO NOTHING \
             RETURNING {}",
            ANSWER_COLUMNS
        ))
        .bind(&record.session_id)
        .bind(record.position as i32)
        .bind(record.question_id)
        .bind(&record.question_text)
        .bind(record.difficulty.as_str())
        .bind(&record.student_answer)
        .bind(&record.correct_answer)
        .bind(record.is_correct)
        .bind(record.time_spent_seconds as i32)
        .bind(record.points)
        .bind(Json(&record.typing_telemetry))
        .bind(record.submitted_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok((AnswerRecord::try_from(row)?, Disposition::Created));
        }

        let existing = self
            .fetch_answer(&record.session_id, record.position, false)
            .await?
            .ok_or_else(|| EngineError::Storage("final answer conflict without a stored row".into()))?;
        if existing.student_answer == record.student_answer {
            Ok((existing, Disposition::Unchanged))
        } else {
            Err(EngineError::DuplicateFinalAnswer {
                session_id: record.session_id,
                position: record.position,
            })
        }
    }

    async fn list(&self, session_id: &str) -> Result<Vec<AnswerRecord>, EngineError> {
        let rows = sqlx::query_as::<_, AnswerRow>(&format!(
            "SELECT {} FROM exam_answers WHERE session_id = $1 ORDER BY position ASC, sequence ASC",
            ANSWER_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AnswerRecord::try_from).collect()
    }

    async fn get(
        &self,
        session_id: &str,
        position: u32,
        provisional: bool,
    ) -> Result<Option<AnswerRecord>, EngineError> {
        self.fetch_answer(session_id, position, provisional).await
    }

    async fn count_final(&self, session_id: &str) -> Result<u32, EngineError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM exam_answers WHERE session_id = $1 AND is_provisional = FALSE",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }
}

#[async_trait]
impl GradeRepository for PgStore {
    async fn get(&self, session_id: &str) -> Result<Option<GradeAggregate>, EngineError> {
        let row = sqlx::query_as::<_, GradeRow>(
            "SELECT session_id, graded_by, graded_at, total_score, max_score, percentage, \
                question_grades, overall_feedback, excluded_positions, is_graded \
             FROM exam_grades WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GradeAggregate::from))
    }

    async fn list_grades(&self) -> Result<Vec<GradeAggregate>, EngineError> {
        let rows = sqlx::query_as::<_, GradeRow>(
            "SELECT session_id, graded_by, graded_at, total_score, max_score, percentage, \
                question_grades, overall_feedback, excluded_positions, is_graded \
             FROM exam_grades ORDER BY graded_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(GradeAggregate::from).collect())
    }

    async fn put(&self, grade: &GradeAggregate) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO exam_grades (session_id, graded_by, graded_at, total_score, max_score, percentage, \
                question_grades, overall_feedback, excluded_positions, is_graded) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (session_id) DO UPDATE SET \
                graded_by = EXCLUDED.graded_by, \
                graded_at = EXCLUDED.graded_at, \
                total_score = EXCLUDED.total_score, \
                max_score = EXCLUDED.max_score, \
                percentage = EXCLUDED.percentage, \
                question_grades = EXCLUDED.question_grades, \
                overall_feedback = EXCLUDED.overall_feedback, \
                excluded_positions = EXCLUDED.excluded_positions, \
                is_graded = EXCLUDED.is_graded",
        )
        .bind(&grade.session_id)
        .bind(&grade.graded_by)
        .bind(grade.graded_at)
        .bind(grade.total_score)
        .bind(grade.max_score)
        .bind(grade.percentage as i32)
        .bind(Json(&grade.question_grades))
        .bind(&grade.overall_feedback)
        .bind(Json(&grade.excluded_positions))
        .bind(grade.is_graded)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to upsert exam grade for {}: {:?}", grade.session_id, e);
            EngineError::from(e)
        })?;
        Ok(())
    }
}

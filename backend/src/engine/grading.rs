// src/engine/grading.rs

//! Grade aggregates and their two homes.
//!
//! The standalone grade record is written first and is the source of truth.
//! The session's review block is a copy rewritten after every grading write;
//! if that copy cannot be written the caller gets `SyncPending`, and the next
//! `grade_for` or `reconcile` repairs it.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    error::EngineError,
    models::{
        answer::AnswerRecord,
        grade::{
            FullGradeInput, GradeAggregate, GradeOutcome, GradeRead, GradeSource, PartialGradeInput, QuestionGrade,
            QuestionGradeInput,
        },
        question::FALLBACK_MAX_SCORE,
        session::ExamSession,
    },
    repository::{AnswerRepository, GradeRepository, QuestionBank, SessionRepository},
};

/// A max score and whether it came from a placeholder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedMax {
    pub value: f64,
    pub low_confidence: bool,
}

pub struct GradingCoordinator {
    sessions: Arc<dyn SessionRepository>,
    answers: Arc<dyn AnswerRepository>,
    grades: Arc<dyn GradeRepository>,
    bank: Arc<dyn QuestionBank>,
    /// Review block write attempts before giving up with `SyncPending`.
    sync_retries: u32,
    /// Serializes read-merge-write cycles on aggregates.
    write_lock: Mutex<()>,
}

impl GradingCoordinator {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        answers: Arc<dyn AnswerRepository>,
        grades: Arc<dyn GradeRepository>,
        bank: Arc<dyn QuestionBank>,
        sync_retries: u32,
    ) -> Self {
        Self {
            sessions,
            answers,
            grades,
            bank,
            sync_retries: sync_retries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Replaces the whole aggregate. Totals are derived, never taken from the caller.
    pub async fn grade_full(&self, session_id: &str, input: FullGradeInput) -> Result<GradeOutcome, EngineError> {
        let _guard = self.write_lock.lock().await;
        let session = self.session(session_id).await?;
        let finals = self.finals_by_position(session_id).await?;

        let excluded: BTreeSet<u32> = input.excluded_positions.iter().copied().collect();
        for position in &excluded {
            check_position(&session, *position)?;
        }

        let mut aggregate = GradeAggregate::new(session_id, &input.graded_by);
        aggregate.overall_feedback = input.overall_feedback;
        aggregate.excluded_positions = excluded.iter().copied().collect();

        let mut seen = BTreeSet::new();
        for grade in input.question_grades {
            check_position(&session, grade.position)?;
            check_score(&grade)?;
            if !seen.insert(grade.position) {
                return Err(EngineError::InvalidGrade(format!(
                    "position {} graded twice",
                    grade.position
                )));
            }
            if excluded.contains(&grade.position) {
                tracing::debug!(
                    "Dropping grade for excluded position {} of session {}",
                    grade.position,
                    session_id
                );
                continue;
            }
            let grade = self.build_grade(&session, finals.get(&grade.position), grade).await?;
            aggregate.upsert(grade);
        }

        aggregate.recompute(answered_positions(&finals, &aggregate.excluded_positions));
        self.persist(&aggregate).await?;

        tracing::info!(
            "Session {} graded by {}: {}/{} ({}%)",
            session_id,
            aggregate.graded_by,
            aggregate.total_score,
            aggregate.max_score,
            aggregate.percentage
        );
        Ok(outcome(aggregate))
    }

    /// Merges one position into the existing aggregate by position.
    pub async fn grade_question(
        &self,
        session_id: &str,
        input: PartialGradeInput,
    ) -> Result<GradeOutcome, EngineError> {
        let _guard = self.write_lock.lock().await;
        let session = self.session(session_id).await?;
        check_position(&session, input.grade.position)?;
        check_score(&input.grade)?;

        let mut aggregate = match self.grades.get(session_id).await? {
            Some(existing) => existing,
            None => session
                .review
                .clone()
                .unwrap_or_else(|| GradeAggregate::new(session_id, &input.graded_by)),
        };
        if aggregate.excluded_positions.contains(&input.grade.position) {
            return Err(EngineError::InvalidGrade(format!(
                "position {} is excluded from grading",
                input.grade.position
            )));
        }

        let finals = self.finals_by_position(session_id).await?;
        let position = input.grade.position;
        let grade = self.build_grade(&session, finals.get(&position), input.grade).await?;
        aggregate.upsert(grade);
        aggregate.graded_by = input.graded_by;
        aggregate.graded_at = Utc::now();
        aggregate.recompute(answered_positions(&finals, &aggregate.excluded_positions));
        self.persist(&aggregate).await?;

        tracing::info!(
            "Session {} position {} regraded: total {}/{} ({}%)",
            session_id,
            position,
            aggregate.total_score,
            aggregate.max_score,
            aggregate.percentage
        );
        Ok(outcome(aggregate))
    }

    /// Reads the aggregate, standalone record first.
    ///
    /// A review block that disagrees with the standalone record is rewritten
    /// on the spot; if that fails the read still succeeds with `sync_pending`.
    pub async fn grade_for(&self, session_id: &str) -> Result<Option<GradeRead>, EngineError> {
        let _guard = self.write_lock.lock().await;
        let session = self.session(session_id).await?;

        let finals = self.finals_by_position(session_id).await?;

        let Some(mut standalone) = self.grades.get(session_id).await? else {
            return Ok(session.review.map(|mut review| {
                if !review.totals_consistent() {
                    review.recompute(answered_positions(&finals, &review.excluded_positions));
                }
                GradeRead {
                    warnings: review.warnings(),
                    aggregate: review,
                    source: GradeSource::Review,
                    reconciled: false,
                    sync_pending: false,
                }
            }));
        };

        if !standalone.totals_consistent() {
            tracing::warn!("Grade record of session {} had stale totals, recomputing", session_id);
            standalone.recompute(answered_positions(&finals, &standalone.excluded_positions));
            self.grades.put(&standalone).await?;
        }

        let in_sync = session
            .review
            .as_ref()
            .is_some_and(|review| review.agrees_with(&standalone));
        let (reconciled, sync_pending) = if in_sync {
            (false, false)
        } else {
            tracing::warn!("Review block of session {} diverged, reconciling", session_id);
            match self.sync_review(&standalone).await {
                Ok(()) => (true, false),
                Err(e) => {
                    tracing::error!("Reconciling session {} failed: {}", session_id, e);
                    (false, true)
                }
            }
        };

        Ok(Some(GradeRead {
            warnings: standalone.warnings(),
            aggregate: standalone,
            source: GradeSource::Standalone,
            reconciled,
            sync_pending,
        }))
    }

    /// Recomputes the aggregate from its question grades and rewrites both homes.
    pub async fn reconcile(&self, session_id: &str) -> Result<GradeAggregate, EngineError> {
        let _guard = self.write_lock.lock().await;
        let session = self.session(session_id).await?;

        let mut aggregate = match self.grades.get(session_id).await? {
            Some(standalone) => standalone,
            None => session.review.ok_or_else(|| {
                EngineError::InvalidGrade(format!("session {} has not been graded", session_id))
            })?,
        };

        let finals = self.finals_by_position(session_id).await?;
        aggregate.recompute(answered_positions(&finals, &aggregate.excluded_positions));
        self.persist(&aggregate).await?;

        tracing::info!("Session {} grade reconciled", session_id);
        Ok(aggregate)
    }

    /// Standalone grade records, most recently graded first.
    pub async fn list_grades(&self) -> Result<Vec<GradeAggregate>, EngineError> {
        self.grades.list_grades().await
    }

    /// Max score of a position without an explicit one.
    ///
    /// Plan points, then the bank, then the tier default. Only the last step
    /// is low confidence. Points cached on answer records are never consulted.
    pub async fn resolve_max_score(
        &self,
        session: &ExamSession,
        answer: Option<&AnswerRecord>,
        position: u32,
    ) -> Result<ResolvedMax, EngineError> {
        let planned = session.planned(position);

        let planned_points = planned.map(|p| p.points).filter(|p| p.is_finite() && *p > 0.0);
        if let Some(value) = planned_points {
            return Ok(ResolvedMax {
                value,
                low_confidence: false,
            });
        }

        let question_id = planned.map(|p| p.question_id).or_else(|| answer.map(|a| a.question_id));
        if let Some(question_id) = question_id {
            if let Some(value) = self
                .bank
                .points_for(question_id)
                .await?
                .filter(|p| p.is_finite() && *p > 0.0)
            {
                return Ok(ResolvedMax {
                    value,
                    low_confidence: false,
                });
            }
        }

        let value = planned
            .map(|p| p.difficulty)
            .or_else(|| answer.map(|a| a.difficulty))
            .map(|d| d.default_points())
            .unwrap_or(FALLBACK_MAX_SCORE);
        tracing::warn!(
            "No authoritative max score for session {} position {}, assuming {}",
            session.id,
            position,
            value
        );
        Ok(ResolvedMax {
            value,
            low_confidence: true,
        })
    }

    async fn build_grade(
        &self,
        session: &ExamSession,
        answer: Option<&AnswerRecord>,
        input: QuestionGradeInput,
    ) -> Result<QuestionGrade, EngineError> {
        let resolved = match input.max_score {
            Some(value) => ResolvedMax {
                value,
                low_confidence: false,
            },
            None => self.resolve_max_score(session, answer, input.position).await?,
        };

        Ok(QuestionGrade {
            position: input.position,
            score: input.score,
            max_score: resolved.value,
            feedback: input.feedback.unwrap_or_default(),
            graded_at: Utc::now(),
            low_confidence: resolved.low_confidence,
        })
    }

    /// Standalone record first; a failure there leaves both homes untouched.
    async fn persist(&self, aggregate: &GradeAggregate) -> Result<(), EngineError> {
        self.grades.put(aggregate).await.map_err(|e| {
            tracing::error!("Failed to save grade of session {}: {}", aggregate.session_id, e);
            e
        })?;
        self.sync_review(aggregate).await
    }

    async fn sync_review(&self, aggregate: &GradeAggregate) -> Result<(), EngineError> {
        let mut last_error = None;
        for attempt in 1..=self.sync_retries {
            match self.sessions.write_review(&aggregate.session_id, aggregate).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "Review sync for session {} failed (attempt {}/{}): {}",
                        aggregate.session_id,
                        attempt,
                        self.sync_retries,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        tracing::error!(
            "Review block of session {} left out of sync: {}",
            aggregate.session_id,
            reason
        );
        Err(EngineError::SyncPending {
            session_id: aggregate.session_id.clone(),
            reason,
        })
    }

    async fn session(&self, session_id: &str) -> Result<ExamSession, EngineError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    async fn finals_by_position(&self, session_id: &str) -> Result<HashMap<u32, AnswerRecord>, EngineError> {
        Ok(self
            .answers
            .list(session_id)
            .await?
            .into_iter()
            .filter(|r| !r.is_provisional)
            .map(|r| (r.position, r))
            .collect())
    }
}

fn outcome(aggregate: GradeAggregate) -> GradeOutcome {
    GradeOutcome {
        warnings: aggregate.warnings(),
        aggregate,
    }
}

/// Final-answer positions that still count toward grading.
fn answered_positions(finals: &HashMap<u32, AnswerRecord>, excluded: &[u32]) -> usize {
    finals.keys().filter(|p| !excluded.contains(p)).count()
}

fn check_position(session: &ExamSession, position: u32) -> Result<(), EngineError> {
    if position >= session.total_questions {
        return Err(EngineError::PositionOutOfRange {
            position,
            total: session.total_questions,
        });
    }
    Ok(())
}

fn check_score(grade: &QuestionGradeInput) -> Result<(), EngineError> {
    if !grade.score.is_finite() || grade.score < 0.0 {
        return Err(EngineError::InvalidGrade(format!(
            "score {} at position {} must be a non-negative number",
            grade.score, grade.position
        )));
    }
    if let Some(max) = grade.max_score {
        if !max.is_finite() || max <= 0.0 {
            return Err(EngineError::InvalidGrade(format!(
                "max score {} at position {} must be positive",
                max, grade.position
            )));
        }
    }
    Ok(())
}

// src/models/grade.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Score given to one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionGrade {
    pub position: u32,
    pub score: f64,
    pub max_score: f64,
    #[serde(default)]
    pub feedback: String,
    pub graded_at: DateTime<Utc>,
    /// `max_score` came from a placeholder rather than the question's points.
    #[serde(default)]
    pub low_confidence: bool,
}

/// Grade aggregate of a session.
///
/// Stored twice: as the standalone grade record and as the session's review
/// block. Totals are always derived from `question_grades` via [`recompute`].
///
/// [`recompute`]: GradeAggregate::recompute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeAggregate {
    pub session_id: String,
    pub graded_by: String,
    pub graded_at: DateTime<Utc>,
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: u32,
    /// Sorted by position, one entry per position.
    pub question_grades: Vec<QuestionGrade>,
    #[serde(default)]
    pub overall_feedback: String,
    /// Positions removed from grading.
    #[serde(default)]
    pub excluded_positions: Vec<u32>,
    pub is_graded: bool,
}

impl GradeAggregate {
    pub fn new(session_id: &str, graded_by: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            graded_by: graded_by.to_string(),
            graded_at: Utc::now(),
            total_score: 0.0,
            max_score: 0.0,
            percentage: 0,
            question_grades: Vec::new(),
            overall_feedback: String::new(),
            excluded_positions: Vec::new(),
            is_graded: false,
        }
    }

    /// Replaces the grade at `grade.position`, or inserts it in order.
    pub fn upsert(&mut self, grade: QuestionGrade) {
        match self
            .question_grades
            .binary_search_by_key(&grade.position, |g| g.position)
        {
            Ok(i) => self.question_grades[i] = grade,
            Err(i) => self.question_grades.insert(i, grade),
        }
    }

    /// Re-derives totals and the graded flag from `question_grades`.
    ///
    /// `answered_positions` is the number of positions holding a final answer
    /// that are not excluded.
    pub fn recompute(&mut self, answered_positions: usize) {
        self.question_grades.sort_by_key(|g| g.position);
        self.question_grades.dedup_by_key(|g| g.position);
        self.total_score = self.question_grades.iter().map(|g| g.score).sum();
        self.max_score = self.question_grades.iter().map(|g| g.max_score).sum();
        self.percentage = percentage(self.total_score, self.max_score);
        self.is_graded = self.question_grades.len() >= answered_positions;
    }

    /// True when the stored totals are exactly what `question_grades` yields.
    pub fn totals_consistent(&self) -> bool {
        let total: f64 = self.question_grades.iter().map(|g| g.score).sum();
        let max: f64 = self.question_grades.iter().map(|g| g.max_score).sum();
        total == self.total_score
            && max == self.max_score
            && percentage(total, max) == self.percentage
    }

    /// True when both homes report the same totals and per-question breakdown.
    pub fn agrees_with(&self, other: &GradeAggregate) -> bool {
        self.total_score == other.total_score
            && self.max_score == other.max_score
            && self.percentage == other.percentage
            && self.question_grades == other.question_grades
            && self.is_graded == other.is_graded
    }

    pub fn warnings(&self) -> Vec<GradeWarning> {
        self.question_grades
            .iter()
            .filter(|g| g.low_confidence)
            .map(|g| GradeWarning::LowConfidenceMaxScore {
                position: g.position,
                assumed_max_score: g.max_score,
            })
            .collect()
    }
}

/// `round(100 * total / max)`, 0 when nothing is gradable.
pub fn percentage(total: f64, max: f64) -> u32 {
    if max > 0.0 {
        (100.0 * total / max).round().max(0.0) as u32
    } else {
        0
    }
}

/// Non-fatal grading condition attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradeWarning {
    LowConfidenceMaxScore { position: u32, assumed_max_score: f64 },
}

/// Which home satisfied a grade read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeSource {
    Standalone,
    Review,
}

/// Result of `grade_for`.
#[derive(Debug, Clone, Serialize)]
pub struct GradeRead {
    pub aggregate: GradeAggregate,
    pub source: GradeSource,
    /// The review block was rewritten during this read.
    pub reconciled: bool,
    /// Divergence was detected but the review block could not be rewritten.
    pub sync_pending: bool,
    pub warnings: Vec<GradeWarning>,
}

/// Result of a grading write.
#[derive(Debug, Clone, Serialize)]
pub struct GradeOutcome {
    pub aggregate: GradeAggregate,
    pub warnings: Vec<GradeWarning>,
}

/// Grade for one position as supplied by a grader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct QuestionGradeInput {
    pub position: u32,
    #[validate(range(min = 0.0, message = "score must be non-negative"))]
    pub score: f64,
    #[validate(range(exclusive_min = 0.0, message = "max_score must be positive"))]
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Full grading of a session. Caller totals are not accepted.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FullGradeInput {
    #[validate(length(min = 1, max = 100))]
    pub graded_by: String,
    #[validate(nested)]
    pub question_grades: Vec<QuestionGradeInput>,
    #[serde(default)]
    pub overall_feedback: String,
    #[serde(default)]
    pub excluded_positions: Vec<u32>,
}

/// Grading of a single position.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PartialGradeInput {
    #[validate(length(min = 1, max = 100))]
    pub graded_by: String,
    #[validate(nested)]
    #[serde(flatten)]
    pub grade: QuestionGradeInput,
}

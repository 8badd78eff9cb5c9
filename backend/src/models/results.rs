// src/models/results.rs

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{
    answer::AnswerRecord,
    question::{Difficulty, QuestionMeta},
    session::ExamSession,
};

/// Summary of a session's final answers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExamStatistics {
    pub answered: u32,
    pub correct: u32,
    pub incorrect: u32,
    /// Percentage of answered questions marked correct.
    pub accuracy: f64,
    pub average_time_seconds: f64,
    pub by_difficulty: BTreeMap<Difficulty, u32>,
}

impl ExamStatistics {
    /// Computes statistics over final records only.
    pub fn from_answers(answers: &[AnswerRecord]) -> Self {
        let finals: Vec<&AnswerRecord> = answers.iter().filter(|a| !a.is_provisional).collect();
        let answered = finals.len() as u32;
        let correct = finals.iter().filter(|a| a.is_correct == Some(true)).count() as u32;

        let mut by_difficulty = BTreeMap::new();
        for answer in &finals {
            *by_difficulty.entry(answer.difficulty).or_insert(0) += 1;
        }

        let (accuracy, average_time_seconds) = if answered == 0 {
            (0.0, 0.0)
        } else {
            let total_time: u64 = finals.iter().map(|a| a.time_spent_seconds as u64).sum();
            (
                correct as f64 / answered as f64 * 100.0,
                total_time as f64 / answered as f64,
            )
        };

        Self {
            answered,
            correct,
            incorrect: answered - correct,
            accuracy,
            average_time_seconds,
            by_difficulty,
        }
    }
}

/// Everything a student sees after finishing.
#[derive(Debug, Clone, Serialize)]
pub struct ExamResults {
    pub session: ExamSession,
    pub answers: Vec<AnswerRecord>,
    pub statistics: ExamStatistics,
}

/// One row of the grader's session list.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOverview {
    #[serde(flatten)]
    pub session: ExamSession,
    /// A standalone grade record or a review block exists.
    pub graded: bool,
}

/// A final answer next to the bank's copy of its question.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerForGrading {
    #[serde(flatten)]
    pub answer: AnswerRecord,
    /// `None` when the question has left the bank.
    pub question_details: Option<QuestionMeta>,
}

/// What a grader works from: the session and its final answers by position.
#[derive(Debug, Clone, Serialize)]
pub struct GradingView {
    pub session: ExamSession,
    pub answers: Vec<AnswerForGrading>,
}

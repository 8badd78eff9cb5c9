// tests/engine_flow.rs

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use exam_backend::{
    engine::{
        EngineOptions, ExamEngine, Stores,
        access::{PinnedClient, StartDecision},
    },
    error::EngineError,
    models::{
        answer::{AnswerPayload, Disposition},
        grade::{FullGradeInput, GradeAggregate, GradeSource, GradeWarning, PartialGradeInput, QuestionGradeInput},
        question::{Difficulty, QuestionMeta},
        session::{
            AccessAttempt, ClientContext, ExamSession, PlannedQuestion, SessionStatus, StatusChange, StudentInfo,
        },
    },
    repository::{
        SessionRepository,
        memory::{MemoryQuestionBank, MemoryStore},
    },
};

fn bank() -> MemoryQuestionBank {
    let mut questions = Vec::new();
    for (base, tier, count) in [
        (0, Difficulty::Easy, 20),
        (100, Difficulty::Medium, 10),
        (200, Difficulty::Hard, 10),
        (300, Difficulty::Algebra, 3),
    ] {
        for i in 1..=count {
            questions.push(QuestionMeta {
                id: base + i,
                difficulty: tier,
                points: tier.default_points(),
                text: format!("{} question {}", tier, i),
                expected_keywords: vec!["SELECT".to_string()],
            });
        }
    }
    MemoryQuestionBank::new(questions)
}

fn engine() -> ExamEngine {
    ExamEngine::new(Stores::memory(bank()), EngineOptions::default())
}

fn student(id: &str) -> StudentInfo {
    StudentInfo {
        student_id: id.to_string(),
        student_email: format!("{}@exam.local", id),
        student_name: format!("Student {}", id),
    }
}

fn payload(question: &PlannedQuestion, text: &str) -> AnswerPayload {
    AnswerPayload {
        question_id: question.question_id,
        student_answer: text.to_string(),
        correct_answer: None,
        is_correct: Some(true),
        time_spent_seconds: 40,
        typing_telemetry: serde_json::json!({ "keystrokes": text.len() }),
    }
}

fn grade(position: u32, score: f64, max_score: f64) -> QuestionGradeInput {
    QuestionGradeInput {
        position,
        score,
        max_score: Some(max_score),
        feedback: None,
    }
}

/// Starts an exam and submits final answers for `finals` positions.
async fn started_with_answers(engine: &ExamEngine, student_id: &str, finals: u32) -> ExamSession {
    let outcome = engine
        .start_exam(student(student_id), &ClientContext::default())
        .await
        .expect("start");
    let id = outcome.session.id.clone();
    for position in 0..finals {
        let question = engine.question_at(&id, position).await.expect("question").question;
        engine
            .submit_answer(&id, position, payload(&question, "SELECT 1"))
            .await
            .expect("answer");
    }
    outcome.session
}

#[tokio::test]
async fn scenario_answers_and_grades_agree_in_both_homes() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-100", 5).await;
    assert_eq!(session.total_questions, 13);

    let draft_question = engine.question_at(&session.id, 5).await.unwrap().question;
    engine
        .auto_save(&session.id, 5, payload(&draft_question, "SELECT na"))
        .await
        .unwrap();

    let check = engine.check_session("s-100").await.unwrap().unwrap();
    assert_eq!(check.current_position, 5);

    // Act
    let full = FullGradeInput {
        graded_by: "grader".into(),
        question_grades: vec![
            grade(0, 6.0, 6.0),
            grade(1, 6.0, 6.0),
            grade(2, 0.0, 6.0),
            grade(3, 8.0, 8.0),
            grade(4, 8.0, 8.0),
        ],
        overall_feedback: "solid".into(),
        excluded_positions: vec![],
    };
    let outcome = engine.grade_full(&session.id, full).await.unwrap();

    // Assert
    assert_eq!(outcome.aggregate.total_score, 28.0);
    assert_eq!(outcome.aggregate.max_score, 34.0);
    assert_eq!(outcome.aggregate.percentage, 82);
    assert!(outcome.aggregate.is_graded);
    let review = engine.session(&session.id).await.unwrap().review.unwrap();
    assert!(review.agrees_with(&outcome.aggregate));

    // Act: regrade position 2
    let partial = PartialGradeInput {
        graded_by: "grader".into(),
        grade: grade(2, 6.0, 6.0),
    };
    let regraded = engine.grade_question(&session.id, partial).await.unwrap();

    // Assert
    assert_eq!(regraded.aggregate.total_score, 34.0);
    assert_eq!(regraded.aggregate.max_score, 34.0);
    assert_eq!(regraded.aggregate.percentage, 100);

    let read = engine.grade_for(&session.id).await.unwrap().unwrap();
    assert_eq!(read.source, GradeSource::Standalone);
    assert!(!read.reconciled);
    assert_eq!(read.aggregate.total_score, 34.0);

    let review = engine.session(&session.id).await.unwrap().review.unwrap();
    assert_eq!(review.total_score, 34.0);
    assert_eq!(review.percentage, 100);
    assert!(review.totals_consistent());
}

#[tokio::test]
async fn starting_twice_resumes_without_reset() {
    // Arrange
    let engine = engine();
    let first = started_with_answers(&engine, "s-200", 2).await;

    // Act
    let again = engine
        .start_exam(student("s-200"), &ClientContext::default())
        .await
        .unwrap();

    // Assert
    assert!(again.resumed);
    assert_eq!(again.session.id, first.id);
    assert_eq!(again.session.start_time, first.start_time);
    assert_eq!(again.current_position, 2);
    assert_eq!(engine.ledger().final_answers(&first.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_starts_yield_one_session() {
    // Arrange
    let engine = engine();
    let ctx = ClientContext::default();

    // Act
    let (a, b) = tokio::join!(
        engine.start_exam(student("s-300"), &ctx),
        engine.start_exam(student("s-300"), &ctx)
    );

    // Assert
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.session.id, b.session.id);
    assert!(a.resumed != b.resumed);
    assert_eq!(a.session.status, SessionStatus::InProgress);
}

#[tokio::test]
async fn completed_student_cannot_start_again() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-400", 1).await;
    engine.complete(&session.id, Some(6.0)).await.unwrap();

    // Act
    let decision = engine.gate().can_start("s-400").await.unwrap();
    let err = engine
        .start_exam(student("s-400"), &ClientContext::default())
        .await
        .unwrap_err();

    // Assert
    assert_eq!(decision, StartDecision::AlreadyCompleted);
    assert!(matches!(err, EngineError::ExamAlreadyTaken { .. }));
    assert!(engine.has_completed("s-400").await.unwrap());
}

#[tokio::test]
async fn completing_twice_fails_and_freezes_answers() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-500", 1).await;

    // Act
    let completed = engine.complete(&session.id, None).await.unwrap();
    let again = engine.complete(&session.id, None).await.unwrap_err();
    let question = engine.question_at(&session.id, 0).await.unwrap().question;
    let late = engine
        .submit_answer(&session.id, 1, payload(&question, "late"))
        .await
        .unwrap_err();

    // Assert
    assert_eq!(completed.status, SessionStatus::Completed);
    assert!(completed.end_time.is_some());
    assert_eq!(completed.current_position, 1);
    assert!(matches!(again, EngineError::AlreadyCompleted { .. }));
    assert!(matches!(late, EngineError::AlreadyCompleted { .. }));
}

#[tokio::test]
async fn final_answer_wins_over_drafts() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-600", 0).await;
    let question = engine.question_at(&session.id, 0).await.unwrap().question;

    // Act
    let first_draft = engine
        .auto_save(&session.id, 0, payload(&question, "SEL"))
        .await
        .unwrap();
    let second_draft = engine
        .auto_save(&session.id, 0, payload(&question, "SELECT"))
        .await
        .unwrap();
    let final_answer = engine
        .submit_answer(&session.id, 0, payload(&question, "SELECT 1"))
        .await
        .unwrap();
    let late_draft = engine
        .auto_save(&session.id, 0, payload(&question, "SELECT 2"))
        .await
        .unwrap();

    // Assert
    assert_eq!(first_draft.disposition, Disposition::Created);
    assert_eq!(second_draft.disposition, Disposition::Replaced);
    assert!(second_draft.record.sequence > first_draft.record.sequence);
    assert_eq!(final_answer.disposition, Disposition::Created);
    assert!(final_answer.record.sequence > second_draft.record.sequence);
    assert_eq!(late_draft.disposition, Disposition::IgnoredAfterFinal);
    assert_eq!(late_draft.record.student_answer, "SELECT 1");

    let records = engine.ledger().answers_for(&session.id).await.unwrap();
    assert_eq!(records.iter().filter(|r| !r.is_provisional).count(), 1);
    assert!(records.iter().filter(|r| r.is_provisional).count() <= 1);
    assert!(engine.draft(&session.id, 0).await.unwrap().is_none());
    assert_eq!(engine.sessions().current_position(&session.id).await.unwrap(), 1);
}

#[tokio::test]
async fn second_final_answer_is_idempotent_or_rejected() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-700", 0).await;
    let question = engine.question_at(&session.id, 0).await.unwrap().question;
    engine
        .submit_answer(&session.id, 0, payload(&question, "SELECT 1"))
        .await
        .unwrap();

    // Act
    let same = engine
        .submit_answer(&session.id, 0, payload(&question, "SELECT 1"))
        .await
        .unwrap();
    let different = engine
        .submit_answer(&session.id, 0, payload(&question, "SELECT 2"))
        .await
        .unwrap_err();

    // Assert
    assert_eq!(same.disposition, Disposition::Unchanged);
    assert!(matches!(
        different,
        EngineError::DuplicateFinalAnswer { position: 0, .. }
    ));
}

#[tokio::test]
async fn drafts_are_recoverable_before_the_final_answer() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-750", 0).await;
    let question = engine.question_at(&session.id, 3).await.unwrap().question;

    // Act
    engine
        .auto_save(&session.id, 3, payload(&question, "SELECT name FROM"))
        .await
        .unwrap();
    let draft = engine.draft(&session.id, 3).await.unwrap().unwrap();

    // Assert
    assert!(draft.is_provisional);
    assert_eq!(draft.student_answer, "SELECT name FROM");
    assert_eq!(draft.is_correct, None);
    assert_eq!(engine.sessions().current_position(&session.id).await.unwrap(), 0);
}

#[tokio::test]
async fn questions_do_not_repeat_within_a_session() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-800", 0).await;

    // Act
    let mut by_tier: HashMap<Difficulty, Vec<i64>> = HashMap::new();
    for position in 0..session.total_questions {
        let assignment = engine.question_at(&session.id, position).await.unwrap();
        assert!(assignment.warnings.is_empty());
        assert_eq!(assignment.question.difficulty, assignment.requested_tier);
        by_tier
            .entry(assignment.question.difficulty)
            .or_default()
            .push(assignment.question.question_id);
    }

    // Assert
    for ids in by_tier.values() {
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }
    assert_eq!(by_tier[&Difficulty::Algebra].len(), 1);
}

#[tokio::test]
async fn question_assignment_is_stable_and_follows_the_plan() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-850", 0).await;
    let plan = engine.sequencer().plan_for(&session.id);

    // Act
    let first = engine.question_at(&session.id, 7).await.unwrap();
    let second = engine.question_at(&session.id, 7).await.unwrap();

    // Assert
    assert_eq!(first.question, second.question);
    assert_eq!(first.requested_tier, plan[7]);
    assert!(matches!(
        engine.question_at(&session.id, 13).await,
        Err(EngineError::PositionOutOfRange { position: 13, total: 13 })
    ));
}

#[tokio::test]
async fn preconfigured_plan_is_served_as_is() {
    // Arrange
    let engine = engine();
    let (planned, warnings) = engine.plan_exam(student("s-900"), Vec::new(), false).await.unwrap();
    assert!(warnings.is_empty());
    assert_eq!(planned.question_plan.len(), 13);

    // Act
    let started = engine
        .start_exam(student("s-900"), &ClientContext::default())
        .await
        .unwrap();
    let duplicate = engine.plan_exam(student("s-900"), Vec::new(), false).await;

    // Assert
    assert_eq!(started.session.id, planned.id);
    assert!(!started.resumed);
    let question = engine.question_at(&planned.id, 4).await.unwrap().question;
    assert_eq!(&question, planned.planned(4).unwrap());
    // The first plan is in progress now, so a new pending one is allowed.
    assert!(duplicate.is_ok());
    let again = engine.plan_exam(student("s-900"), Vec::new(), false).await;
    assert!(matches!(again, Err(EngineError::DuplicatePlan { .. })));
    let idempotent = engine.plan_exam(student("s-900"), Vec::new(), true).await.unwrap();
    assert_eq!(idempotent.0.id, duplicate.unwrap().0.id);
}

#[tokio::test]
async fn max_score_falls_back_with_a_warning() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1000", 1).await;
    let planned = engine.question_at(&session.id, 0).await.unwrap().question;

    // Act: position 0 has a plan entry, position 9 was never assigned.
    let outcome = engine
        .grade_full(
            &session.id,
            FullGradeInput {
                graded_by: "grader".into(),
                question_grades: vec![
                    QuestionGradeInput {
                        position: 0,
                        score: 3.0,
                        max_score: None,
                        feedback: Some("partial".into()),
                    },
                    QuestionGradeInput {
                        position: 9,
                        score: 0.0,
                        max_score: None,
                        feedback: None,
                    },
                ],
                overall_feedback: String::new(),
                excluded_positions: vec![],
            },
        )
        .await
        .unwrap();

    // Assert
    let grades = &outcome.aggregate.question_grades;
    assert_eq!(grades[0].max_score, planned.points);
    assert!(!grades[0].low_confidence);
    assert!(grades[1].low_confidence);
    assert_eq!(
        outcome.warnings,
        vec![GradeWarning::LowConfidenceMaxScore {
            position: 9,
            assumed_max_score: grades[1].max_score,
        }]
    );
    assert_eq!(outcome.aggregate.max_score, planned.points + grades[1].max_score);
}

#[tokio::test]
async fn client_declared_points_never_reach_max_score() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1050", 0).await;
    let planned = engine.question_at(&session.id, 0).await.unwrap().question;
    let forged: AnswerPayload = serde_json::from_value(serde_json::json!({
        "question_id": planned.question_id,
        "question_text": "forged",
        "difficulty": "hard",
        "student_answer": "SELECT 1",
        "points": 1.0,
    }))
    .unwrap();

    // Act
    let stored = engine.submit_answer(&session.id, 0, forged).await.unwrap().record;
    let outcome = engine
        .grade_question(
            &session.id,
            PartialGradeInput {
                graded_by: "grader".into(),
                grade: QuestionGradeInput {
                    position: 0,
                    score: 1.0,
                    max_score: None,
                    feedback: None,
                },
            },
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(stored.points, Some(planned.points));
    assert_eq!(stored.difficulty, planned.difficulty);
    assert_eq!(stored.question_text, planned.question_text);
    assert_eq!(outcome.aggregate.max_score, planned.points);
    assert!(!outcome.aggregate.question_grades[0].low_confidence);
    assert!(outcome.warnings.is_empty());
}

#[tokio::test]
async fn answers_must_name_the_assigned_question() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1060", 0).await;
    let planned = engine.question_at(&session.id, 0).await.unwrap().question;
    let mut wrong = payload(&planned, "SELECT 1");
    wrong.question_id = 999_999;

    // Act
    let mismatch = engine.submit_answer(&session.id, 0, wrong).await;
    let unassigned = engine
        .auto_save(&session.id, 1, payload(&planned, "SELECT 1"))
        .await;
    let used = engine.ledger().used_question_ids(&session.id).await.unwrap();

    // Assert
    assert!(matches!(
        mismatch,
        Err(EngineError::QuestionMismatch { position: 0, assigned, submitted: 999_999 }) if assigned == planned.question_id
    ));
    assert!(matches!(
        unassigned,
        Err(EngineError::QuestionNotAssigned { position: 1, .. })
    ));
    assert!(used.is_empty());
}

#[tokio::test]
async fn excluded_positions_do_not_count() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1100", 3).await;

    // Act
    let outcome = engine
        .grade_full(
            &session.id,
            FullGradeInput {
                graded_by: "grader".into(),
                question_grades: vec![grade(0, 6.0, 6.0), grade(1, 3.0, 6.0), grade(2, 6.0, 6.0)],
                overall_feedback: String::new(),
                excluded_positions: vec![2],
            },
        )
        .await
        .unwrap();
    let regrade_excluded = engine
        .grade_question(
            &session.id,
            PartialGradeInput {
                graded_by: "grader".into(),
                grade: grade(2, 6.0, 6.0),
            },
        )
        .await;

    // Assert
    assert_eq!(outcome.aggregate.question_grades.len(), 2);
    assert_eq!(outcome.aggregate.total_score, 9.0);
    assert_eq!(outcome.aggregate.max_score, 12.0);
    assert_eq!(outcome.aggregate.percentage, 75);
    assert!(outcome.aggregate.is_graded);
    assert!(matches!(regrade_excluded, Err(EngineError::InvalidGrade(_))));
}

#[tokio::test]
async fn partial_grades_mark_graded_only_when_complete() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1200", 2).await;
    let partial = |position| PartialGradeInput {
        graded_by: "grader".into(),
        grade: grade(position, 6.0, 6.0),
    };

    // Act
    let first = engine.grade_question(&session.id, partial(0)).await.unwrap();
    let second = engine.grade_question(&session.id, partial(1)).await.unwrap();

    // Assert
    assert!(!first.aggregate.is_graded);
    assert!(second.aggregate.is_graded);
    assert_eq!(second.aggregate.total_score, 12.0);
    let review = engine.session(&session.id).await.unwrap().review.unwrap();
    assert!(review.is_graded);
}

#[tokio::test]
async fn grade_rejects_positions_outside_the_exam() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1300", 0).await;

    // Act
    let err = engine
        .grade_question(
            &session.id,
            PartialGradeInput {
                graded_by: "grader".into(),
                grade: grade(13, 1.0, 1.0),
            },
        )
        .await
        .unwrap_err();

    // Assert
    assert!(matches!(err, EngineError::PositionOutOfRange { .. }));
    assert!(engine.grade_for(&session.id).await.unwrap().is_none());
}

/// Session store with switchable faults.
///
/// Review writes fail while `failing` is set. With `hide_active_once`, the next
/// lookup of an in-progress session misses, as if a concurrent start activated
/// it right after.
struct FaultyStore {
    inner: Arc<MemoryStore>,
    failing: AtomicBool,
    hide_active_once: AtomicBool,
}

impl FaultyStore {
    fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
            hide_active_once: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionRepository for FaultyStore {
    async fn insert(&self, session: ExamSession, idempotent: bool) -> Result<ExamSession, EngineError> {
        self.inner.insert(session, idempotent).await
    }

    async fn get(&self, id: &str) -> Result<Option<ExamSession>, EngineError> {
        SessionRepository::get(self.inner.as_ref(), id).await
    }

    async fn discard_pending(&self, id: &str) -> Result<bool, EngineError> {
        self.inner.discard_pending(id).await
    }

    async fn list_by_student_email(&self, student_email: &str) -> Result<Vec<ExamSession>, EngineError> {
        self.inner.list_by_student_email(student_email).await
    }

    async fn list_sessions(&self) -> Result<Vec<ExamSession>, EngineError> {
        self.inner.list_sessions().await
    }

    async fn find_by_student(
        &self,
        student_id: &str,
        status: SessionStatus,
    ) -> Result<Option<ExamSession>, EngineError> {
        if status == SessionStatus::InProgress && self.hide_active_once.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_student(student_id, status).await
    }

    async fn transition(
        &self,
        id: &str,
        expected: Option<SessionStatus>,
        change: StatusChange,
    ) -> Result<Option<ExamSession>, EngineError> {
        self.inner.transition(id, expected, change).await
    }

    async fn append_access(&self, id: &str, attempt: AccessAttempt) -> Result<(), EngineError> {
        self.inner.append_access(id, attempt).await
    }

    async fn put_plan_entry(&self, id: &str, entry: PlannedQuestion) -> Result<PlannedQuestion, EngineError> {
        self.inner.put_plan_entry(id, entry).await
    }

    async fn set_current_position(&self, id: &str, position: u32) -> Result<(), EngineError> {
        self.inner.set_current_position(id, position).await
    }

    async fn write_review(&self, id: &str, review: &GradeAggregate) -> Result<(), EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("review write timed out".into()));
        }
        self.inner.write_review(id, review).await
    }
}

#[tokio::test]
async fn failed_review_write_surfaces_sync_pending_and_reconciles_on_read() {
    // Arrange
    let store = Arc::new(MemoryStore::new());
    let flaky = FaultyStore::new(store.clone());
    let stores = Stores {
        sessions: flaky.clone(),
        answers: store.clone(),
        grades: store,
        bank: Arc::new(bank()),
    };
    let engine = ExamEngine::new(stores, EngineOptions::default());
    let session = started_with_answers(&engine, "s-1400", 2).await;

    // Act
    flaky.failing.store(true, Ordering::SeqCst);
    let err = engine
        .grade_full(
            &session.id,
            FullGradeInput {
                graded_by: "grader".into(),
                question_grades: vec![grade(0, 6.0, 6.0), grade(1, 2.0, 6.0)],
                overall_feedback: String::new(),
                excluded_positions: vec![],
            },
        )
        .await
        .unwrap_err();
    let pending_read = engine.grade_for(&session.id).await.unwrap().unwrap();

    flaky.failing.store(false, Ordering::SeqCst);
    let healed_read = engine.grade_for(&session.id).await.unwrap().unwrap();
    let settled_read = engine.grade_for(&session.id).await.unwrap().unwrap();

    // Assert
    assert!(matches!(err, EngineError::SyncPending { .. }));
    assert_eq!(pending_read.source, GradeSource::Standalone);
    assert!(pending_read.sync_pending);
    assert_eq!(pending_read.aggregate.total_score, 8.0);

    assert!(healed_read.reconciled);
    assert!(!healed_read.sync_pending);
    assert!(!settled_read.reconciled);

    let review = engine.session(&session.id).await.unwrap().review.unwrap();
    assert!(review.agrees_with(&healed_read.aggregate));
}

#[tokio::test]
async fn reconcile_rewrites_the_review_block() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1500", 1).await;
    engine
        .grade_question(
            &session.id,
            PartialGradeInput {
                graded_by: "grader".into(),
                grade: grade(0, 4.0, 6.0),
            },
        )
        .await
        .unwrap();

    // Act
    let aggregate = engine.reconcile(&session.id).await.unwrap();

    // Assert
    assert_eq!(aggregate.total_score, 4.0);
    assert_eq!(aggregate.percentage, 67);
    let review = engine.session(&session.id).await.unwrap().review.unwrap();
    assert!(review.agrees_with(&aggregate));
}

#[tokio::test]
async fn reconcile_without_grades_is_rejected() {
    let engine = engine();
    let session = started_with_answers(&engine, "s-1550", 0).await;

    let err = engine.reconcile(&session.id).await.unwrap_err();

    assert!(matches!(err, EngineError::InvalidGrade(_)));
}

#[tokio::test]
async fn pinned_client_policy_rejects_a_different_client() {
    // Arrange
    let options = EngineOptions {
        policy: Arc::new(PinnedClient),
        ..EngineOptions::default()
    };
    let engine = ExamEngine::new(Stores::memory(bank()), options);
    let home = ClientContext {
        client_address: Some("203.0.113.10".into()),
        device_fingerprint: None,
    };
    let elsewhere = ClientContext {
        client_address: Some("198.51.100.99".into()),
        device_fingerprint: None,
    };
    let started = engine.start_exam(student("s-1600"), &home).await.unwrap();

    // Act
    let same_client = engine.start_exam(student("s-1600"), &home).await;
    let other_client = engine.start_exam(student("s-1600"), &elsewhere).await;

    // Assert
    assert!(same_client.unwrap().resumed);
    assert!(matches!(other_client, Err(EngineError::AccessDenied { .. })));
    let log = engine.session(&started.session.id).await.unwrap().access_log;
    assert_eq!(log.len(), 3);
    assert!(!log[2].accepted);
    assert!(log[2].reason.is_some());
}

#[tokio::test]
async fn repair_status_moves_sessions_and_keeps_single_active_rule() {
    // Arrange
    let engine = engine();
    let first = started_with_answers(&engine, "s-1700", 0).await;

    // Act
    let timed_out = engine.repair_status(&first.id, SessionStatus::Timeout).await.unwrap();
    let second = engine
        .start_exam(student("s-1700"), &ClientContext::default())
        .await
        .unwrap();
    let reopen = engine.repair_status(&first.id, SessionStatus::InProgress).await;

    // Assert
    assert_eq!(timed_out.status, SessionStatus::Timeout);
    assert!(timed_out.end_time.is_some());
    assert_ne!(second.session.id, first.id);
    assert!(matches!(
        reopen,
        Err(EngineError::ConcurrentSessionConflict { existing_session, .. }) if existing_session == second.session.id
    ));
}

#[tokio::test]
async fn results_report_final_answers_only() {
    // Arrange
    let engine = engine();
    let session = started_with_answers(&engine, "s-1800", 3).await;
    let question = engine.question_at(&session.id, 3).await.unwrap().question;
    engine
        .auto_save(&session.id, 3, payload(&question, "draft"))
        .await
        .unwrap();
    engine.complete(&session.id, None).await.unwrap();

    // Act
    let results = engine.results(&session.id).await.unwrap();

    // Assert
    assert_eq!(results.answers.len(), 3);
    assert_eq!(results.statistics.answered, 3);
    assert_eq!(results.statistics.correct, 3);
    assert_eq!(results.statistics.accuracy, 100.0);
    assert_eq!(results.statistics.average_time_seconds, 40.0);
    assert_eq!(results.session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let engine = engine();

    let err = engine.question_at("missing", 0).await.unwrap_err();

    assert!(matches!(err, EngineError::SessionNotFound(_)));
}

#[tokio::test]
async fn start_that_loses_a_race_leaves_no_orphan_plan() {
    // Arrange
    let store = Arc::new(MemoryStore::new());
    let faulty = FaultyStore::new(store.clone());
    let stores = Stores {
        sessions: faulty.clone(),
        answers: store.clone(),
        grades: store,
        bank: Arc::new(bank()),
    };
    let engine = ExamEngine::new(stores, EngineOptions::default());
    let first = started_with_answers(&engine, "s-2000", 1).await;

    // Act
    faulty.hide_active_once.store(true, Ordering::SeqCst);
    let second = engine
        .start_exam(student("s-2000"), &ClientContext::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(second.session.id, first.id);
    assert!(second.resumed);
    assert_eq!(second.current_position, 1);
    assert!(engine.sessions().pending("s-2000").await.unwrap().is_none());
    assert_eq!(engine.exam_history("s-2000@exam.local").await.unwrap().len(), 1);
}

#[tokio::test]
async fn generated_plans_differ_between_attempts() {
    // Arrange
    let engine = engine();
    let (first, _) = engine.plan_exam(student("s-2100"), Vec::new(), false).await.unwrap();
    engine.repair_status(&first.id, SessionStatus::Timeout).await.unwrap();

    // Act
    let (second, _) = engine.plan_exam(student("s-2100"), Vec::new(), false).await.unwrap();

    // Assert
    let ids = |s: &ExamSession| s.question_plan.iter().map(|q| q.question_id).collect::<Vec<_>>();
    assert_ne!(first.id, second.id);
    assert_ne!(ids(&first), ids(&second));
    let tiers = |s: &ExamSession| engine.sequencer().plan_for(&s.id);
    for session in [&first, &second] {
        let planned: Vec<Difficulty> = session.question_plan.iter().map(|q| q.difficulty).collect();
        assert_eq!(planned, tiers(session));
    }
}

#[tokio::test]
async fn grader_views_list_history_sessions_and_grades() {
    // Arrange
    let engine = engine();
    let graded = started_with_answers(&engine, "s-2200", 2).await;
    let ungraded = started_with_answers(&engine, "s-2300", 1).await;
    engine.complete(&graded.id, None).await.unwrap();
    engine
        .grade_full(
            &graded.id,
            FullGradeInput {
                graded_by: "grader".into(),
                question_grades: vec![grade(0, 6.0, 6.0), grade(1, 3.0, 6.0)],
                overall_feedback: String::new(),
                excluded_positions: vec![],
            },
        )
        .await
        .unwrap();
    engine.repair_status(&ungraded.id, SessionStatus::Timeout).await.unwrap();
    let retake = engine
        .start_exam(student("s-2300"), &ClientContext::default())
        .await
        .unwrap();

    // Act
    let history = engine.exam_history("s-2300@exam.local").await.unwrap();
    let sessions = engine.list_sessions().await.unwrap();
    let grades = engine.list_grades().await.unwrap();
    let view = engine.exam_for_grading(&graded.id).await.unwrap();

    // Assert
    let history_ids: Vec<&str> = history.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(history_ids, vec![retake.session.id.as_str(), ungraded.id.as_str()]);
    assert_eq!(sessions.len(), 3);
    let flags: HashMap<&str, bool> = sessions.iter().map(|o| (o.session.id.as_str(), o.graded)).collect();
    assert!(flags[graded.id.as_str()]);
    assert!(!flags[ungraded.id.as_str()]);
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0].session_id, graded.id);
    assert_eq!(view.session.id, graded.id);
    assert_eq!(view.answers.len(), 2);
    for (position, entry) in view.answers.iter().enumerate() {
        assert_eq!(entry.answer.position, position as u32);
        let details = entry.question_details.as_ref().expect("question in bank");
        assert_eq!(details.id, entry.answer.question_id);
    }
}

#[tokio::test]
async fn grading_view_of_unknown_session_is_not_found() {
    let engine = engine();

    let err = engine.exam_for_grading("missing").await.unwrap_err();

    assert!(matches!(err, EngineError::SessionNotFound(_)));
}

// src/engine/mod.rs

//! The exam engine: sequencing, sessions, answers, grading and access,
//! composed behind [`ExamEngine`].

use std::{collections::HashSet, sync::Arc};

use serde::Serialize;

use crate::{
    config::Config,
    error::EngineError,
    models::{
        answer::{AnswerPayload, AnswerRecord, RecordOutcome},
        grade::{FullGradeInput, GradeAggregate, GradeOutcome, GradeRead, PartialGradeInput},
        question::{Difficulty, QuestionId, QuestionMeta},
        results::{AnswerForGrading, ExamResults, ExamStatistics, GradingView, SessionOverview},
        session::{ClientContext, ExamSession, PlannedQuestion, SessionStatus, StudentInfo},
    },
    repository::{
        AnswerRepository, GradeRepository, QuestionBank, SessionRepository,
        memory::{MemoryQuestionBank, MemoryStore},
        postgres::PgStore,
    },
};

pub mod access;
pub mod grading;
pub mod ledger;
pub mod sequencer;
pub mod session;

use access::{AccessGate, AccessPolicy, AllowAll, StartDecision, policy_for};
use grading::GradingCoordinator;
use ledger::AnswerLedger;
use sequencer::{QuestionSequencer, SelectionWarning};
use session::SessionStore;

/// Storage handles injected into the engine.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionRepository>,
    pub answers: Arc<dyn AnswerRepository>,
    pub grades: Arc<dyn GradeRepository>,
    pub bank: Arc<dyn QuestionBank>,
}

impl Stores {
    pub fn memory(bank: MemoryQuestionBank) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            sessions: store.clone(),
            answers: store.clone(),
            grades: store,
            bank: Arc::new(bank),
        }
    }

    pub fn postgres(store: PgStore, bank: MemoryQuestionBank) -> Self {
        let store = Arc::new(store);
        Self {
            sessions: store.clone(),
            answers: store.clone(),
            grades: store,
            bank: Arc::new(bank),
        }
    }
}

#[derive(Clone)]
pub struct EngineOptions {
    pub sequencer: QuestionSequencer,
    pub policy: Arc<dyn AccessPolicy>,
    pub sync_retries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sequencer: QuestionSequencer::default(),
            policy: Arc::new(AllowAll),
            sync_retries: crate::config::DEFAULT_GRADE_SYNC_RETRIES,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sequencer: QuestionSequencer::from_mix(config.tier_mix),
            policy: policy_for(config.access_policy),
            sync_retries: config.grade_sync_retries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub session: ExamSession,
    /// The student already had this session in progress.
    pub resumed: bool,
    pub current_position: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionAssignment {
    pub position: u32,
    pub total_questions: u32,
    pub requested_tier: Difficulty,
    pub question: PlannedQuestion,
    pub warnings: Vec<SelectionWarning>,
}

/// Where a student stands, for the check-session view.
#[derive(Debug, Clone, Serialize)]
pub struct SessionCheck {
    pub session: ExamSession,
    pub current_position: u32,
}

pub struct ExamEngine {
    sessions: SessionStore,
    ledger: AnswerLedger,
    grading: GradingCoordinator,
    gate: AccessGate,
    sequencer: QuestionSequencer,
    bank: Arc<dyn QuestionBank>,
}

impl ExamEngine {
    pub fn new(stores: Stores, options: EngineOptions) -> Self {
        let total = options.sequencer.plan_len() as u32;
        Self {
            sessions: SessionStore::new(stores.sessions.clone(), stores.answers.clone(), total),
            ledger: AnswerLedger::new(stores.sessions.clone(), stores.answers.clone()),
            grading: GradingCoordinator::new(
                stores.sessions.clone(),
                stores.answers,
                stores.grades,
                stores.bank.clone(),
                options.sync_retries,
            ),
            gate: AccessGate::new(stores.sessions, options.policy),
            sequencer: options.sequencer,
            bank: stores.bank,
        }
    }

    /// Starts or resumes the student's exam.
    ///
    /// Safe to call repeatedly: an exam in progress is returned unchanged, and
    /// a start that loses a race to a concurrent one resumes the winner.
    pub async fn start_exam(&self, student: StudentInfo, ctx: &ClientContext) -> Result<StartOutcome, EngineError> {
        let student_id = student.student_id.clone();
        if self.gate.can_start(&student_id).await? == StartDecision::AlreadyCompleted {
            return Err(EngineError::ExamAlreadyTaken { student_id });
        }

        if let Some(existing) = self.sessions.resume(&student_id).await? {
            return self.resume_existing(existing, ctx).await;
        }

        let (pending, created_here) = match self.sessions.pending(&student_id).await? {
            Some(session) => (session, false),
            None => {
                let id = SessionStore::new_session_id();
                let session = self
                    .sessions
                    .create_planned_session(id.clone(), student, Vec::new(), true)
                    .await?;
                let created_here = session.id == id;
                (session, created_here)
            }
        };
        self.gate.check_access(&pending, ctx).await?;

        match self.sessions.activate(&pending.id, ctx).await {
            Ok(activation) => {
                let mut session = activation.session;
                let current_position = self.sessions.current_position(&session.id).await?;
                session.current_position = current_position;
                Ok(StartOutcome {
                    session,
                    resumed: !activation.newly_started,
                    current_position,
                })
            }
            Err(EngineError::ConcurrentSessionConflict { existing_session, .. }) => {
                tracing::info!(
                    "Concurrent start for student {}, resuming session {}",
                    student_id,
                    existing_session
                );
                if created_here {
                    self.sessions.discard_pending(&pending.id).await?;
                }
                let existing = self.sessions.get(&existing_session).await?;
                self.resume_existing(existing, ctx).await
            }
            Err(e) => Err(e),
        }
    }

    async fn resume_existing(&self, existing: ExamSession, ctx: &ClientContext) -> Result<StartOutcome, EngineError> {
        self.gate.check_access(&existing, ctx).await?;
        let mut session = self.sessions.activate(&existing.id, ctx).await?.session;
        let current_position = self.sessions.current_position(&existing.id).await?;
        session.current_position = current_position;
        tracing::info!(
            "Student {} resumed session {} at position {}",
            existing.student_id(),
            existing.id,
            current_position
        );
        Ok(StartOutcome {
            session,
            resumed: true,
            current_position,
        })
    }

    /// Creates a pre-configured session. An empty `plan` is generated from the
    /// sequencer, seeded with the new session's id.
    pub async fn plan_exam(
        &self,
        student: StudentInfo,
        plan: Vec<PlannedQuestion>,
        idempotent: bool,
    ) -> Result<(ExamSession, Vec<SelectionWarning>), EngineError> {
        let id = SessionStore::new_session_id();
        let (plan, warnings) = if plan.is_empty() {
            self.build_plan(&id).await?
        } else {
            (plan, Vec::new())
        };
        let session = self
            .sessions
            .create_planned_session(id, student, plan, idempotent)
            .await?;
        Ok((session, warnings))
    }

    async fn build_plan(&self, identity: &str) -> Result<(Vec<PlannedQuestion>, Vec<SelectionWarning>), EngineError> {
        let mut used = HashSet::new();
        let mut plan = Vec::new();
        let mut warnings = Vec::new();

        for (position, tier) in self.sequencer.plan_for(identity).into_iter().enumerate() {
            let position = position as u32;
            let selection = self
                .sequencer
                .select(self.bank.as_ref(), identity, position, tier, &used)
                .await?;
            used.insert(selection.question.id);
            warnings.extend(selection.warnings);
            plan.push(planned_from(position, selection.question));
        }
        Ok((plan, warnings))
    }

    /// The question at `position`, assigning one on first access.
    pub async fn question_at(&self, session_id: &str, position: u32) -> Result<QuestionAssignment, EngineError> {
        let session = self.sessions.get(session_id).await?;
        if position >= session.total_questions {
            return Err(EngineError::PositionOutOfRange {
                position,
                total: session.total_questions,
            });
        }

        if let Some(planned) = session.planned(position) {
            return Ok(QuestionAssignment {
                position,
                total_questions: session.total_questions,
                requested_tier: planned.difficulty,
                question: planned.clone(),
                warnings: Vec::new(),
            });
        }
        if session.status.is_terminal() {
            return Err(EngineError::AlreadyCompleted {
                session_id: session_id.to_string(),
            });
        }

        let tier = self
            .sequencer
            .tier_at(&session.id, position)
            .ok_or(EngineError::PositionOutOfRange {
                position,
                total: self.sequencer.plan_len() as u32,
            })?;

        let mut used: HashSet<QuestionId> = self.ledger.used_question_ids(session_id).await?;
        used.extend(session.question_plan.iter().map(|q| q.question_id));

        let selection = self
            .sequencer
            .select(self.bank.as_ref(), &session.id, position, tier, &used)
            .await?;
        let chosen = selection.question.id;
        let stored = self
            .sessions
            .put_plan_entry(session_id, planned_from(position, selection.question))
            .await?;

        // Lost the race to a concurrent fetch; its choice stands.
        let warnings = if stored.question_id == chosen {
            selection.warnings
        } else {
            Vec::new()
        };

        Ok(QuestionAssignment {
            position,
            total_questions: session.total_questions,
            requested_tier: tier,
            question: stored,
            warnings,
        })
    }

    pub async fn submit_answer(
        &self,
        session_id: &str,
        position: u32,
        payload: AnswerPayload,
    ) -> Result<RecordOutcome, EngineError> {
        self.ledger.record_answer(session_id, position, payload, false).await
    }

    pub async fn auto_save(
        &self,
        session_id: &str,
        position: u32,
        payload: AnswerPayload,
    ) -> Result<RecordOutcome, EngineError> {
        self.ledger.record_answer(session_id, position, payload, true).await
    }

    pub async fn draft(&self, session_id: &str, position: u32) -> Result<Option<AnswerRecord>, EngineError> {
        self.ledger.provisional_for(session_id, position).await
    }

    pub async fn complete(&self, session_id: &str, final_score: Option<f64>) -> Result<ExamSession, EngineError> {
        let session = self.sessions.complete(session_id, final_score).await?;
        let current_position = self.sessions.current_position(session_id).await?;
        Ok(ExamSession {
            current_position,
            ..session
        })
    }

    pub async fn session(&self, session_id: &str) -> Result<ExamSession, EngineError> {
        self.sessions.get(session_id).await
    }

    /// The student's session in progress with its authoritative position.
    pub async fn check_session(&self, student_id: &str) -> Result<Option<SessionCheck>, EngineError> {
        let Some(session) = self.sessions.resume(student_id).await? else {
            return Ok(None);
        };
        let current_position = self.sessions.current_position(&session.id).await?;
        Ok(Some(SessionCheck {
            session,
            current_position,
        }))
    }

    pub async fn has_completed(&self, student_id: &str) -> Result<bool, EngineError> {
        self.sessions.has_completed(student_id).await
    }

    pub async fn results(&self, session_id: &str) -> Result<ExamResults, EngineError> {
        let session = self.sessions.get(session_id).await?;
        let answers = self.ledger.final_answers(session_id).await?;
        let statistics = ExamStatistics::from_answers(&answers);
        Ok(ExamResults {
            session,
            answers,
            statistics,
        })
    }

    /// Every attempt of the student with this email, most recent first.
    pub async fn exam_history(&self, student_email: &str) -> Result<Vec<ExamSession>, EngineError> {
        self.sessions.history(student_email).await
    }

    /// All sessions, each flagged with whether a grade exists for it.
    pub async fn list_sessions(&self) -> Result<Vec<SessionOverview>, EngineError> {
        let graded: HashSet<String> = self
            .grading
            .list_grades()
            .await?
            .into_iter()
            .map(|g| g.session_id)
            .collect();
        Ok(self
            .sessions
            .list()
            .await?
            .into_iter()
            .map(|session| SessionOverview {
                graded: session.review.is_some() || graded.contains(&session.id),
                session,
            })
            .collect())
    }

    pub async fn list_grades(&self) -> Result<Vec<GradeAggregate>, EngineError> {
        self.grading.list_grades().await
    }

    /// The session, its final answers by position and each answer's question
    /// as the bank holds it.
    pub async fn exam_for_grading(&self, session_id: &str) -> Result<GradingView, EngineError> {
        let session = self.sessions.get(session_id).await?;
        let mut answers = Vec::new();
        for answer in self.ledger.final_answers(session_id).await? {
            let question_details = self.bank.question(answer.question_id).await?;
            answers.push(AnswerForGrading {
                answer,
                question_details,
            });
        }
        Ok(GradingView { session, answers })
    }

    pub async fn grade_full(&self, session_id: &str, input: FullGradeInput) -> Result<GradeOutcome, EngineError> {
        self.grading.grade_full(session_id, input).await
    }

    pub async fn grade_question(
        &self,
        session_id: &str,
        input: PartialGradeInput,
    ) -> Result<GradeOutcome, EngineError> {
        self.grading.grade_question(session_id, input).await
    }

    pub async fn grade_for(&self, session_id: &str) -> Result<Option<GradeRead>, EngineError> {
        self.grading.grade_for(session_id).await
    }

    pub async fn reconcile(&self, session_id: &str) -> Result<GradeAggregate, EngineError> {
        self.grading.reconcile(session_id).await
    }

    pub async fn repair_status(&self, session_id: &str, to: SessionStatus) -> Result<ExamSession, EngineError> {
        self.sessions.repair_status(session_id, to).await
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn ledger(&self) -> &AnswerLedger {
        &self.ledger
    }

    pub fn grading(&self) -> &GradingCoordinator {
        &self.grading
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn sequencer(&self) -> &QuestionSequencer {
        &self.sequencer
    }
}

fn planned_from(position: u32, question: QuestionMeta) -> PlannedQuestion {
    PlannedQuestion {
        position,
        difficulty: question.difficulty,
        question_id: question.id,
        question_text: question.text,
        points: question.points,
        expected_keywords: question.expected_keywords,
    }
}

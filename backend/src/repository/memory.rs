// src/repository/memory.rs

//! In-process adapters. Each collection sits behind one mutex, so every
//! check-and-write below is atomic.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    error::EngineError,
    models::{
        answer::{AnswerRecord, Disposition},
        grade::GradeAggregate,
        question::{Difficulty, QuestionId, QuestionMeta, RawQuestion},
        session::{AccessAttempt, ExamSession, PlannedQuestion, SessionStatus, StatusChange},
    },
    repository::{AnswerRepository, GradeRepository, QuestionBank, SessionRepository},
};

/// `(position, is_provisional)` inside one session.
type AnswerKey = (u32, bool);

#[derive(Default)]
struct AnswerTable {
    next_sequence: i64,
    by_session: HashMap<String, BTreeMap<AnswerKey, AnswerRecord>>,
}

impl AnswerTable {
    fn stamp(&mut self, mut record: AnswerRecord) -> AnswerRecord {
        self.next_sequence += 1;
        record.sequence = self.next_sequence;
        record
    }
}

/// Sessions, answers and grades held in memory.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, ExamSession>>,
    answers: Mutex<AnswerTable>,
    grades: Mutex<HashMap<String, GradeAggregate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &str) -> EngineError {
    EngineError::SessionNotFound(id.to_string())
}

fn newest_first(mut sessions: Vec<ExamSession>) -> Vec<ExamSession> {
    sessions.sort_by_key(|s| Reverse((s.start_time, s.created_at)));
    sessions
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert(&self, session: ExamSession, idempotent: bool) -> Result<ExamSession, EngineError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(pending) = sessions
            .values()
            .find(|s| s.student_id() == session.student_id() && s.status == SessionStatus::NotStarted)
        {
            if idempotent {
                return Ok(pending.clone());
            }
            return Err(EngineError::DuplicatePlan {
                student_id: session.student_id().to_string(),
            });
        }

        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<ExamSession>, EngineError> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn discard_pending(&self, id: &str) -> Result<bool, EngineError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(id).is_some_and(|s| s.status == SessionStatus::NotStarted) {
            sessions.remove(id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_by_student_email(&self, student_email: &str) -> Result<Vec<ExamSession>, EngineError> {
        let sessions = self.sessions.lock().await;
        Ok(newest_first(
            sessions
                .values()
                .filter(|s| s.student.student_email == student_email)
                .cloned()
                .collect(),
        ))
    }

    async fn list_sessions(&self) -> Result<Vec<ExamSession>, EngineError> {
        let sessions = self.sessions.lock().await;
        Ok(newest_first(sessions.values().cloned().collect()))
    }

    async fn find_by_student(
        &self,
        student_id: &str,
        status: SessionStatus,
    ) -> Result<Option<ExamSession>, EngineError> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .values()
            .filter(|s| s.student_id() == student_id && s.status == status)
            .min_by_key(|s| s.created_at)
            .cloned())
    }

    async fn transition(
        &self,
        id: &str,
        expected: Option<SessionStatus>,
        change: StatusChange,
    ) -> Result<Option<ExamSession>, EngineError> {
        let mut sessions = self.sessions.lock().await;

        let (student_id, current) = match sessions.get(id) {
            Some(s) => (s.student_id().to_string(), s.status),
            None => return Err(not_found(id)),
        };
        if expected.is_some_and(|e| e != current) {
            return Ok(None);
        }

        if change.to == SessionStatus::InProgress {
            if let Some(other) = sessions.values().find(|s| {
                s.id != id && s.student_id() == student_id && s.status == SessionStatus::InProgress
            }) {
                return Err(EngineError::ConcurrentSessionConflict {
                    student_id,
                    existing_session: other.id.clone(),
                });
            }
        }
        if change.to == SessionStatus::NotStarted
            && sessions.values().any(|s| {
                s.id != id && s.student_id() == student_id && s.status == SessionStatus::NotStarted
            })
        {
            return Err(EngineError::DuplicatePlan { student_id });
        }

        let session = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        session.apply(&change);
        Ok(Some(session.clone()))
    }

    async fn append_access(&self, id: &str, attempt: AccessAttempt) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        session.access_log.push(attempt);
        Ok(())
    }

    async fn put_plan_entry(&self, id: &str, entry: PlannedQuestion) -> Result<PlannedQuestion, EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        Ok(session.plan_entry_or_insert(entry))
    }

    async fn set_current_position(&self, id: &str, position: u32) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        session.current_position = position;
        Ok(())
    }

    async fn write_review(&self, id: &str, review: &GradeAggregate) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        session.review = Some(review.clone());
        Ok(())
    }
}

#[async_trait]
impl AnswerRepository for MemoryStore {
    async fn upsert_provisional(&self, record: AnswerRecord) -> Result<(AnswerRecord, Disposition), EngineError> {
        let mut table = self.answers.lock().await;
        let key_final = (record.position, false);
        let key_draft = (record.position, true);

        if let Some(existing) = table
            .by_session
            .get(&record.session_id)
            .and_then(|m| m.get(&key_final))
        {
            return Ok((existing.clone(), Disposition::IgnoredAfterFinal));
        }

        let session_id = record.session_id.clone();
        let record = table.stamp(record);
        let previous = table
            .by_session
            .entry(session_id)
            .or_default()
            .insert(key_draft, record.clone());

        let disposition = if previous.is_some() {
            Disposition::Replaced
        } else {
            Disposition::Created
        };
        Ok((record, disposition))
    }

    async fn insert_final(&self, record: AnswerRecord) -> Result<(AnswerRecord, Disposition), EngineError> {
        let mut table = self.answers.lock().await;
        let key = (record.position, false);

        if let Some(existing) = table
            .by_session
            .get(&record.session_id)
            .and_then(|m| m.get(&key))
        {
            if existing.student_answer == record.student_answer {
                return Ok((existing.clone(), Disposition::Unchanged));
            }
            return Err(EngineError::DuplicateFinalAnswer {
                session_id: record.session_id,
                position: record.position,
            });
        }

        let session_id = record.session_id.clone();
        let record = table.stamp(record);
        table
            .by_session
            .entry(session_id)
            .or_default()
            .insert(key, record.clone());
        Ok((record, Disposition::Created))
    }

    async fn list(&self, session_id: &str) -> Result<Vec<AnswerRecord>, EngineError> {
        let table = self.answers.lock().await;
        let mut records: Vec<AnswerRecord> = table
            .by_session
            .get(session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| (r.position, r.sequence));
        Ok(records)
    }

    async fn get(
        &self,
        session_id: &str,
        position: u32,
        provisional: bool,
    ) -> Result<Option<AnswerRecord>, EngineError> {
        let table = self.answers.lock().await;
        Ok(table
            .by_session
            .get(session_id)
            .and_then(|m| m.get(&(position, provisional)))
            .cloned())
    }

    async fn count_final(&self, session_id: &str) -> Result<u32, EngineError> {
        let table = self.answers.lock().await;
        Ok(table
            .by_session
            .get(session_id)
            .map(|m| m.keys().filter(|(_, provisional)| !provisional).count() as u32)
            .unwrap_or(0))
    }
}

#[async_trait]
impl GradeRepository for MemoryStore {
    async fn get(&self, session_id: &str) -> Result<Option<GradeAggregate>, EngineError> {
        Ok(self.grades.lock().await.get(session_id).cloned())
    }

    async fn put(&self, grade: &GradeAggregate) -> Result<(), EngineError> {
        self.grades
            .lock()
            .await
            .insert(grade.session_id.clone(), grade.clone());
        Ok(())
    }

    async fn list_grades(&self) -> Result<Vec<GradeAggregate>, EngineError> {
        let mut grades: Vec<GradeAggregate> = self.grades.lock().await.values().cloned().collect();
        grades.sort_by_key(|g| Reverse(g.graded_at));
        Ok(grades)
    }
}

/// Question bank backed by a fixed list, resolved once at load.
#[derive(Debug, Default)]
pub struct MemoryQuestionBank {
    questions: Vec<QuestionMeta>,
}

impl MemoryQuestionBank {
    pub fn new(questions: Vec<QuestionMeta>) -> Self {
        Self { questions }
    }

    pub fn from_raw(raw: Vec<RawQuestion>) -> Self {
        Self::new(raw.into_iter().filter_map(RawQuestion::resolve).collect())
    }

    /// Loads a JSON array of questions.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Storage(format!("{}: {}", path.as_ref().display(), e)))?;
        let raw: Vec<RawQuestion> = serde_json::from_str(&data)?;
        let bank = Self::from_raw(raw);
        tracing::info!("Loaded {} approved questions into memory bank", bank.questions.len());
        Ok(bank)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

#[async_trait]
impl QuestionBank for MemoryQuestionBank {
    async fn lookup_difficulty_pool(
        &self,
        tier: Difficulty,
        excluding: &HashSet<QuestionId>,
    ) -> Result<Vec<QuestionMeta>, EngineError> {
        Ok(self
            .questions
            .iter()
            .filter(|q| q.difficulty == tier && !excluding.contains(&q.id))
            .cloned()
            .collect())
    }

    async fn question(&self, question_id: QuestionId) -> Result<Option<QuestionMeta>, EngineError> {
        Ok(self.questions.iter().find(|q| q.id == question_id).cloned())
    }
}

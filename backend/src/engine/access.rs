// src/engine/access.rs

use std::sync::Arc;

use serde::Serialize;

use crate::{
    config::AccessPolicyKind,
    error::EngineError,
    models::session::{AccessAttempt, ClientContext, ExamSession, SessionStatus},
    repository::SessionRepository,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartDecision {
    Allowed,
    AlreadyCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessVerdict {
    Allowed,
    Denied { reason: String },
}

/// Client validation applied to every start or resume of a session.
pub trait AccessPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, session: &ExamSession, ctx: &ClientContext) -> AccessVerdict;
}

/// Accepts every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn name(&self) -> &'static str {
        "allow_all"
    }

    fn evaluate(&self, _session: &ExamSession, _ctx: &ClientContext) -> AccessVerdict {
        AccessVerdict::Allowed
    }
}

/// Pins a session to the client that first opened it.
///
/// A value missing on either side is not compared.
#[derive(Debug, Default, Clone, Copy)]
pub struct PinnedClient;

impl AccessPolicy for PinnedClient {
    fn name(&self) -> &'static str {
        "pinned_client"
    }

    fn evaluate(&self, session: &ExamSession, ctx: &ClientContext) -> AccessVerdict {
        let Some(first) = session.first_accepted_access() else {
            return AccessVerdict::Allowed;
        };

        if let (Some(pinned), Some(current)) = (&first.client_address, &ctx.client_address) {
            if pinned != current {
                return AccessVerdict::Denied {
                    reason: format!("client address changed from {} to {}", pinned, current),
                };
            }
        }
        if let (Some(pinned), Some(current)) = (&first.device_fingerprint, &ctx.device_fingerprint) {
            if pinned != current {
                return AccessVerdict::Denied {
                    reason: "device fingerprint does not match the first access".to_string(),
                };
            }
        }
        AccessVerdict::Allowed
    }
}

pub fn policy_for(kind: AccessPolicyKind) -> Arc<dyn AccessPolicy> {
    match kind {
        AccessPolicyKind::AllowAll => Arc::new(AllowAll),
        AccessPolicyKind::PinnedClient => Arc::new(PinnedClient),
    }
}

/// One-exam-per-lifetime check plus the configured client policy.
pub struct AccessGate {
    sessions: Arc<dyn SessionRepository>,
    policy: Arc<dyn AccessPolicy>,
}

impl AccessGate {
    pub fn new(sessions: Arc<dyn SessionRepository>, policy: Arc<dyn AccessPolicy>) -> Self {
        Self { sessions, policy }
    }

    /// A student who ever completed a session may not start another.
    ///
    /// Races between two starts are settled by the session store, not here.
    pub async fn can_start(&self, student_id: &str) -> Result<StartDecision, EngineError> {
        let completed = self
            .sessions
            .find_by_student(student_id, SessionStatus::Completed)
            .await?;

        Ok(match completed {
            Some(session) => {
                tracing::info!(
                    "Student {} already completed session {}, start refused",
                    student_id,
                    session.id
                );
                StartDecision::AlreadyCompleted
            }
            None => StartDecision::Allowed,
        })
    }

    /// Runs the client policy. Denials are written to the access log.
    pub async fn check_access(&self, session: &ExamSession, ctx: &ClientContext) -> Result<(), EngineError> {
        match self.policy.evaluate(session, ctx) {
            AccessVerdict::Allowed => Ok(()),
            AccessVerdict::Denied { reason } => {
                tracing::warn!(
                    "Access to session {} denied by {} policy: {}",
                    session.id,
                    self.policy.name(),
                    reason
                );
                let attempt = AccessAttempt::new(ctx, false, Some(reason.clone()));
                self.sessions.append_access(&session.id, attempt).await?;
                Err(EngineError::AccessDenied { reason })
            }
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::StudentInfo;
    use serde_json::json;

    fn session_with_access(address: &str, fingerprint: serde_json::Value) -> ExamSession {
        let student = StudentInfo {
            student_id: "s1".into(),
            student_email: "s1@example.com".into(),
            student_name: "Student One".into(),
        };
        let mut session = ExamSession::new("exam-1".into(), student, 13, vec![]);
        let ctx = ClientContext {
            client_address: Some(address.into()),
            device_fingerprint: Some(fingerprint),
        };
        session.access_log.push(AccessAttempt::new(&ctx, true, None));
        session
    }

    fn ctx(address: Option<&str>, fingerprint: Option<serde_json::Value>) -> ClientContext {
        ClientContext {
            client_address: address.map(str::to_string),
            device_fingerprint: fingerprint,
        }
    }

    #[test]
    fn test_allow_all_accepts_anything() {
        let session = session_with_access("10.0.0.1", json!({"ua": "a"}));
        let verdict = AllowAll.evaluate(&session, &ctx(Some("10.9.9.9"), Some(json!({"ua": "b"}))));
        assert_eq!(verdict, AccessVerdict::Allowed);
    }

    #[test]
    fn test_pinned_client_allows_first_access() {
        let student = StudentInfo {
            student_id: "s1".into(),
            student_email: "s1@example.com".into(),
            student_name: "Student One".into(),
        };
        let session = ExamSession::new("exam-1".into(), student, 13, vec![]);
        let verdict = PinnedClient.evaluate(&session, &ctx(Some("10.0.0.1"), None));
        assert_eq!(verdict, AccessVerdict::Allowed);
    }

    #[test]
    fn test_pinned_client_denies_changed_address() {
        let session = session_with_access("10.0.0.1", json!({"ua": "a"}));
        let verdict = PinnedClient.evaluate(&session, &ctx(Some("10.0.0.2"), None));
        assert!(matches!(verdict, AccessVerdict::Denied { .. }));
    }

    #[test]
    fn test_pinned_client_denies_changed_fingerprint() {
        let session = session_with_access("10.0.0.1", json!({"ua": "a"}));
        let verdict = PinnedClient.evaluate(&session, &ctx(Some("10.0.0.1"), Some(json!({"ua": "b"}))));
        assert!(matches!(verdict, AccessVerdict::Denied { .. }));
    }

    #[test]
    fn test_pinned_client_ignores_missing_values() {
        let session = session_with_access("10.0.0.1", json!({"ua": "a"}));
        let verdict = PinnedClient.evaluate(&session, &ctx(None, None));
        assert_eq!(verdict, AccessVerdict::Allowed);
    }

    #[test]
    fn test_policy_for_config_kind() {
        assert_eq!(policy_for(AccessPolicyKind::AllowAll).name(), "allow_all");
        assert_eq!(policy_for(AccessPolicyKind::PinnedClient).name(), "pinned_client");
    }
}

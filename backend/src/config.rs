// src/config.rs

use std::env;
use std::str::FromStr;

use dotenvy::dotenv;

/// Default number of attempts for writing the review block after the grade record.
pub const DEFAULT_GRADE_SYNC_RETRIES: u32 = 3;

/// Where sessions, answers and grades are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

/// Device/address validation applied when a student starts or resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicyKind {
    AllowAll,
    PinnedClient,
}

impl FromStr for AccessPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow_all" | "disabled" => Ok(Self::AllowAll),
            "pinned_client" | "pinned" => Ok(Self::PinnedClient),
            other => Err(format!("unknown access policy '{}'", other)),
        }
    }
}

/// Counts of the shuffled middle block of a legacy plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierMix {
    pub easy: usize,
    pub medium: usize,
    pub hard: usize,
}

impl Default for TierMix {
    fn default() -> Self {
        Self {
            easy: 5,
            medium: 3,
            hard: 3,
        }
    }
}

impl FromStr for TierMix {
    type Err = String;

    /// Parses `"easy,medium,hard"`, e.g. `"5,3,3"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let counts = s
            .split(',')
            .map(|part| part.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid tier mix '{}': {}", s, e))?;

        match counts.as_slice() {
            [easy, medium, hard] => Ok(Self {
                easy: *easy,
                medium: *medium,
                hard: *hard,
            }),
            _ => Err(format!("tier mix '{}' must have exactly three counts", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub rust_log: String,
    pub bind_addr: String,
    pub tier_mix: TierMix,
    pub access_policy: AccessPolicyKind,
    pub grade_sync_retries: u32,
    /// JSON seed for the in-memory question bank.
    pub question_bank_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Memory,
            database_url: None,
            rust_log: "info".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            tier_mix: TierMix::default(),
            access_policy: AccessPolicyKind::AllowAll,
            grade_sync_retries: DEFAULT_GRADE_SYNC_RETRIES,
            question_bank_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let storage = parse_var("STORAGE", StorageBackend::Postgres);

        let database_url = env::var("DATABASE_URL").ok();
        if storage == StorageBackend::Postgres && database_url.is_none() {
            panic!("DATABASE_URL must be set when STORAGE=postgres");
        }

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        Self {
            storage,
            database_url,
            rust_log,
            bind_addr,
            tier_mix: parse_var("EXAM_TIER_MIX", TierMix::default()),
            access_policy: parse_var("ACCESS_POLICY", AccessPolicyKind::AllowAll),
            grade_sync_retries: parse_var("GRADE_SYNC_RETRIES", DEFAULT_GRADE_SYNC_RETRIES).max(1),
            question_bank_path: env::var("QUESTION_BANK_PATH").ok(),
        }
    }
}

/// Reads and parses an env var, falling back to `default` when unset or malformed.
fn parse_var<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Ignoring {}={}: {}", key, raw, e);
                default
            }
        },
        Err(_) => default,
    }
}

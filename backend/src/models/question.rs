// src/models/question.rs

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Question identifier as issued by the question bank.
pub type QuestionId = i64;

/// Max score assumed when neither the caller, the answer, nor the bank knows better.
pub const FALLBACK_MAX_SCORE: f64 = 1.0;

/// Difficulty tier a question is drawn from.
///
/// `Algebra` is the distinguished closing tier of every plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    #[serde(alias = "synthesis")]
    Algebra,
}

impl Difficulty {
    /// Fallback order when a tier has no questions left: easiest first.
    pub const ALL: [Difficulty; 4] = [
        Difficulty::Easy,
        Difficulty::Medium,
        Difficulty::Hard,
        Difficulty::Algebra,
    ];

    /// Points a question of this tier is worth when the bank does not say otherwise.
    pub fn default_points(self) -> f64 {
        match self {
            Difficulty::Easy => 6.0,
            Difficulty::Medium => 8.0,
            Difficulty::Hard => 10.0,
            Difficulty::Algebra => 12.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::Algebra => "algebra",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            "algebra" | "synthesis" => Ok(Difficulty::Algebra),
            other => Err(format!("unknown difficulty '{}'", other)),
        }
    }
}

/// A question as the engine sees it: tier and points are already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionMeta {
    pub id: QuestionId,
    pub difficulty: Difficulty,
    pub points: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub expected_keywords: Vec<String>,
}

/// A question as stored by the bank, before its tier string is parsed.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuestion {
    pub id: QuestionId,
    pub difficulty: String,
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default, alias = "question")]
    pub text: String,
    #[serde(default)]
    pub expected_keywords: Vec<String>,
    #[serde(default = "default_approved")]
    pub approved: bool,
}

fn default_approved() -> bool {
    true
}

impl RawQuestion {
    /// Resolves the tier and points once, at load time.
    ///
    /// Returns `None` for unapproved questions and unknown tiers.
    pub fn resolve(self) -> Option<QuestionMeta> {
        if !self.approved {
            return None;
        }
        let difficulty = match self.difficulty.parse::<Difficulty>() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Skipping question {}: {}", self.id, e);
                return None;
            }
        };
        let points = self
            .points
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or_else(|| difficulty.default_points());

        Some(QuestionMeta {
            id: self.id,
            difficulty,
            points,
            text: self.text,
            expected_keywords: self.expected_keywords,
        })
    }
}

// src/engine/sequencer.rs

//! Deterministic difficulty plans and non-repeating question selection.
//!
//! A plan is `[first, shuffle(middle), last]`. The middle block is shuffled
//! with Fisher-Yates driven by a linear congruential generator seeded from a
//! 32-bit string hash of the exam identity, so the same identity always
//! yields the same plan.

use std::collections::HashSet;

use serde::Serialize;

use crate::{
    config::TierMix,
    error::EngineError,
    models::question::{Difficulty, QuestionId, QuestionMeta},
    repository::QuestionBank,
};

const LCG_MULTIPLIER: i64 = 9301;
const LCG_INCREMENT: i64 = 49297;
const LCG_MODULUS: i64 = 233280;

/// `h = h * 31 + unit` over UTF-16 code units, wrapping at 32 bits.
pub fn identity_hash(identity: &str) -> i32 {
    identity
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(unit as i32))
}

/// Linear congruential generator yielding fractions in `[0, 1)`.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: i64,
}

impl Lcg {
    pub fn seeded(seed: i32) -> Self {
        Self { state: seed as i64 }
    }

    pub fn next_fraction(&mut self) -> f64 {
        self.state = (self.state * LCG_MULTIPLIER + LCG_INCREMENT).rem_euclid(LCG_MODULUS);
        self.state as f64 / LCG_MODULUS as f64
    }

    /// Index in `0..len`; `len` must be non-zero.
    pub fn next_index(&mut self, len: usize) -> usize {
        ((self.next_fraction() * len as f64).floor() as usize).min(len - 1)
    }
}

/// Why a selection deviated from "unused question of the requested tier".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionWarning {
    /// Every question of the tier was already used in this session.
    RepeatedQuestion { tier: Difficulty },
    /// The requested tier had no questions; another tier was served.
    TierSubstituted { requested: Difficulty, served: Difficulty },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub question: QuestionMeta,
    pub warnings: Vec<SelectionWarning>,
}

#[derive(Debug, Clone)]
pub struct QuestionSequencer {
    first: Difficulty,
    middle: Vec<Difficulty>,
    last: Difficulty,
}

impl Default for QuestionSequencer {
    fn default() -> Self {
        Self::from_mix(TierMix::default())
    }
}

impl QuestionSequencer {
    pub fn new(first: Difficulty, middle: Vec<Difficulty>, last: Difficulty) -> Self {
        Self { first, middle, last }
    }

    /// Easy opener, shuffled easy/medium/hard block, algebra closer.
    pub fn from_mix(mix: TierMix) -> Self {
        let middle = std::iter::repeat_n(Difficulty::Easy, mix.easy)
            .chain(std::iter::repeat_n(Difficulty::Medium, mix.medium))
            .chain(std::iter::repeat_n(Difficulty::Hard, mix.hard))
            .collect();
        Self::new(Difficulty::Easy, middle, Difficulty::Algebra)
    }

    /// Number of positions in every plan.
    pub fn plan_len(&self) -> usize {
        self.middle.len() + 2
    }

    pub fn plan_for(&self, identity: &str) -> Vec<Difficulty> {
        let mut middle = self.middle.clone();
        let mut rng = Lcg::seeded(identity_hash(identity));
        for i in (1..middle.len()).rev() {
            let j = rng.next_index(i + 1);
            middle.swap(i, j);
        }

        let mut plan = Vec::with_capacity(self.plan_len());
        plan.push(self.first);
        plan.extend(middle);
        plan.push(self.last);
        plan
    }

    pub fn tier_at(&self, identity: &str, position: u32) -> Option<Difficulty> {
        self.plan_for(identity).get(position as usize).copied()
    }

    /// Picks a concrete question for `position`, avoiding ids in `used`.
    ///
    /// Falls back to repeating a question of the same tier, then to other
    /// tiers, recording a warning for each step taken. Only a bank with no
    /// approved question at all is an error.
    pub async fn select(
        &self,
        bank: &dyn QuestionBank,
        identity: &str,
        position: u32,
        tier: Difficulty,
        used: &HashSet<QuestionId>,
    ) -> Result<Selection, EngineError> {
        let none = HashSet::new();
        let mut warnings = Vec::new();

        let mut pool = bank.lookup_difficulty_pool(tier, used).await?;

        if pool.is_empty() {
            pool = bank.lookup_difficulty_pool(tier, &none).await?;
            if !pool.is_empty() {
                tracing::warn!(
                    "No unused {} question left for exam {}, repeating at position {}",
                    tier,
                    identity,
                    position
                );
                warnings.push(SelectionWarning::RepeatedQuestion { tier });
            }
        }

        if pool.is_empty() {
            pool = self.substitute_pool(bank, tier, used, &none, &mut warnings).await?;
        }

        if pool.is_empty() {
            tracing::error!("Question bank has no approved questions (exam {})", identity);
            return Err(EngineError::QuestionPoolExhausted { tier });
        }

        pool.sort_by_key(|q| q.id);
        let mut rng = Lcg::seeded(identity_hash(&format!("{}:{}", identity, position)));
        let question = pool.swap_remove(rng.next_index(pool.len()));

        if question.difficulty != tier {
            tracing::warn!(
                "Served {} question {} instead of {} for exam {} position {}",
                question.difficulty,
                question.id,
                tier,
                identity,
                position
            );
            warnings.push(SelectionWarning::TierSubstituted {
                requested: tier,
                served: question.difficulty,
            });
        }

        Ok(Selection { question, warnings })
    }

    async fn substitute_pool(
        &self,
        bank: &dyn QuestionBank,
        tier: Difficulty,
        used: &HashSet<QuestionId>,
        none: &HashSet<QuestionId>,
        warnings: &mut Vec<SelectionWarning>,
    ) -> Result<Vec<QuestionMeta>, EngineError> {
        let others: Vec<Difficulty> = Difficulty::ALL.into_iter().filter(|d| *d != tier).collect();

        for other in &others {
            let pool = bank.lookup_difficulty_pool(*other, used).await?;
            if !pool.is_empty() {
                return Ok(pool);
            }
        }
        for other in &others {
            let pool = bank.lookup_difficulty_pool(*other, none).await?;
            if !pool.is_empty() {
                warnings.push(SelectionWarning::RepeatedQuestion { tier: *other });
                return Ok(pool);
            }
        }
        Ok(Vec::new())
    }
}

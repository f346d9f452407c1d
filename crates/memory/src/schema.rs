//! The record model (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SubstrateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Observation,
    Decision,
    Question,
    Insight,
    Routine,
    Significant,
    Interesting,
}

impl RecordType {
    pub fn slug(self) -> &'static str {
        match self {
            RecordType::Observation => "observation",
            RecordType::Decision => "decision",
            RecordType::Question => "question",
            RecordType::Insight => "insight",
            RecordType::Routine => "routine",
            RecordType::Significant => "significant",
            RecordType::Interesting => "interesting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Primary,
    Compressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    Public,
    Private,
    Team,
}

/// Pleasure-arousal-dominance emotion tuple, each component in `[-1, 1]`.
/// Absence means "neutral / untagged" — distinct from all-zero, which is a
/// tagged-but-neutral emotion (see §8 boundary behaviors).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    pub pleasure: f32,
    pub arousal: f32,
    pub dominance: f32,
}

impl Emotion {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("pleasure", self.pleasure),
            ("arousal", self.arousal),
            ("dominance", self.dominance),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(SubstrateError::bad_input(format!(
                    "emotion.{name} must be in [-1,1], got {v}"
                )));
            }
        }
        Ok(())
    }

    /// Overall intensity, used by consolidation's emotional-outlier selection.
    pub fn intensity(&self) -> f32 {
        (self.pleasure.powi(2) + self.arousal.powi(2) + self.dominance.powi(2))
            .sqrt()
            .min(1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marks {
    pub important: bool,
    pub forgettable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormationContext {
    pub question: Option<String>,
    pub resolution: Option<String>,
    pub uncertainty: Option<String>,
    pub related_to: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMembership {
    pub pattern_id: Uuid,
    pub frequency: usize,
    pub is_outlier: bool,
    pub summary: Option<String>,
}

/// The atomic unit of memory (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub record_id: Uuid,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub record_type: RecordType,
    pub content: String,
    pub importance: f32,
    pub emotion: Option<Emotion>,
    pub marks: Marks,
    pub isolation: Isolation,
    pub team_name: Option<String>,
    pub tier: Tier,
    pub formation_context: Option<FormationContext>,
    pub pattern_membership: Option<PatternMembership>,
    pub centrality: f32,
    pub embedding_ref: Option<Uuid>,
}

impl Record {
    /// Construct a freshly-minted record (`create_record`, §4.1). Validates
    /// shape; never partially constructs — on error nothing is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        owner_id: impl Into<String>,
        record_type: RecordType,
        content: impl Into<String>,
        importance: f32,
        emotion: Option<Emotion>,
        formation_context: Option<FormationContext>,
        isolation: Isolation,
        team_name: Option<String>,
    ) -> Result<Self> {
        let content = content.into();
        if content.is_empty() {
            return Err(SubstrateError::bad_input("content must not be empty"));
        }
        if !(0.0..=1.0).contains(&importance) {
            return Err(SubstrateError::bad_input(format!(
                "importance must be in [0,1], got {importance}"
            )));
        }
        if let Some(e) = &emotion {
            e.validate()?;
        }
        if isolation == Isolation::Team && team_name.as_deref().unwrap_or("").is_empty() {
            return Err(SubstrateError::bad_input(
                "team isolation requires a non-empty team_name",
            ));
        }

        let now = Utc::now();
        Ok(Self {
            record_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            record_type,
            content,
            importance,
            emotion,
            marks: Marks::default(),
            isolation,
            team_name,
            tier: Tier::Primary,
            formation_context,
            pattern_membership: None,
            centrality: 0.0,
            embedding_ref: None,
        })
    }

    /// Record a read: bumps `access_count`, refreshes `last_accessed_at`.
    /// Both updates are monotone (invariant 2) — last-writer-wins under
    /// concurrent access per §5.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
    }
}

pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_is_rejected() {
        let err = Record::create(
            "alice",
            RecordType::Observation,
            "",
            0.5,
            None,
            None,
            Isolation::Private,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "BadInput");
    }

    #[test]
    fn importance_boundaries() {
        assert!(Record::create(
            "alice",
            RecordType::Observation,
            "x",
            0.0,
            None,
            None,
            Isolation::Private,
            None
        )
        .is_ok());
        assert!(Record::create(
            "alice",
            RecordType::Observation,
            "x",
            1.0,
            None,
            None,
            Isolation::Private,
            None
        )
        .is_ok());
        assert!(Record::create(
            "alice",
            RecordType::Observation,
            "x",
            1.000001,
            None,
            None,
            Isolation::Private,
            None
        )
        .is_err());
    }

    #[test]
    fn team_isolation_requires_team_name() {
        let err = Record::create(
            "alice",
            RecordType::Observation,
            "x",
            0.5,
            None,
            None,
            Isolation::Team,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "BadInput");
    }

    #[test]
    fn touch_is_monotone() {
        let mut r = Record::create(
            "alice",
            RecordType::Observation,
            "x",
            0.5,
            None,
            None,
            Isolation::Private,
            None,
        )
        .unwrap();
        let first_access = r.last_accessed_at;
        r.touch();
        assert_eq!(r.access_count, 1);
        assert!(r.last_accessed_at >= first_access);
    }
}

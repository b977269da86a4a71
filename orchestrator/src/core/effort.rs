//! Adaptive effort-tier table.
//!
//! | kind     | base     |
//! |----------|----------|
//! | docs     | minimal  |
//! | config   | minimal  |
//! | test     | standard |
//! | bugfix   | standard |
//! | refactor | standard |
//! | feature  | standard |
//!
//! Each verification rejection raises the tier one step, saturating at `deep`.
//! Transient retries keep the tier.

use crate::core::types::{EffortTier, TaskKind};

pub fn base_tier(kind: TaskKind) -> EffortTier {
    match kind {
        TaskKind::Docs | TaskKind::Config => EffortTier::Minimal,
        TaskKind::Test | TaskKind::Bugfix | TaskKind::Refactor | TaskKind::Feature => {
            EffortTier::Standard
        }
    }
}

/// Tier for the next execution of a task with `fix_attempts` rejections so far.
pub fn effort_for(kind: TaskKind, fix_attempts: u32) -> EffortTier {
    (0..fix_attempts).fold(base_tier(kind), |tier, _| tier.raised())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_base_tier() {
        assert_eq!(effort_for(TaskKind::Docs, 0), EffortTier::Minimal);
        assert_eq!(effort_for(TaskKind::Config, 0), EffortTier::Minimal);
        assert_eq!(effort_for(TaskKind::Feature, 0), EffortTier::Standard);
        assert_eq!(effort_for(TaskKind::Bugfix, 0), EffortTier::Standard);
    }

    #[test]
    fn rejections_raise_tier_and_saturate() {
        assert_eq!(effort_for(TaskKind::Feature, 1), EffortTier::Deep);
        assert_eq!(effort_for(TaskKind::Docs, 1), EffortTier::Standard);
        assert_eq!(effort_for(TaskKind::Docs, 2), EffortTier::Deep);
        assert_eq!(effort_for(TaskKind::Docs, 9), EffortTier::Deep);
    }
}

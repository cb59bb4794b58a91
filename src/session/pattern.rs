// Traffic tier assignment
//
// Pure computation: maps a session id to how often that session sends.
// The send loop only uses the resulting period; the session state machine
// is the same for every tier.

use std::time::Duration;

/// Send-rate tier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficTier {
    /// Sends at the base probe interval.
    Active,
    /// Sends at three times the base interval.
    Moderate,
    /// Sends at ten times the base interval.
    Passive,
}

impl TrafficTier {
    /// Tier for `session_id`: 10% active, 30% moderate, 60% passive by
    /// `id % 100`.
    pub fn for_session(session_id: u64) -> Self {
        match session_id % 100 {
            0..=9 => TrafficTier::Active,
            10..=39 => TrafficTier::Moderate,
            _ => TrafficTier::Passive,
        }
    }

    pub fn multiplier(&self) -> u32 {
        match self {
            TrafficTier::Active => 1,
            TrafficTier::Moderate => 3,
            TrafficTier::Passive => 10,
        }
    }

    /// Send-loop period for this tier.
    pub fn period(&self, base: Duration) -> Duration {
        base * self.multiplier()
    }

    pub fn index(&self) -> usize {
        match self {
            TrafficTier::Active => 0,
            TrafficTier::Moderate => 1,
            TrafficTier::Passive => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrafficTier::Active => "active",
            TrafficTier::Moderate => "moderate",
            TrafficTier::Passive => "passive",
        }
    }
}

/// Tier and send period for a session. With tiers disabled every session
/// is active and sends at `base`.
pub fn assign(session_id: u64, base: Duration, tiers_enabled: bool) -> (TrafficTier, Duration) {
    let tier = if tiers_enabled {
        TrafficTier::for_session(session_id)
    } else {
        TrafficTier::Active
    };
    (tier, tier.period(base))
}

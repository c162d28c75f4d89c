//! Downtime classification rules.
//!
//! Every aggregation path decides up/down/excluded through this module and
//! nowhere else. The rules, in order:
//!
//! 1. While the park shows no activity, no ride observation is trusted.
//! 2. A ride that never counts as up in a period is left out of that
//!    period's statistics entirely.
//! 3. Down-aware operators only count an explicit DOWN as downtime; other
//!    operators report one generic CLOSED, which counts as down.

use crate::model::{ParkActivitySnapshot, ParkType, RideStatus, RideStatusSnapshot};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    CountsAsUp,
    CountsAsDown,
    Excluded,
}

/// Park state at the instant of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkState {
    pub appears_open: bool,
}

impl From<&ParkActivitySnapshot> for ParkState {
    fn from(activity: &ParkActivitySnapshot) -> Self {
        Self {
            appears_open: activity.appears_open,
        }
    }
}

/// Classifies one observation (Rules 1 and 3).
pub fn classify(
    observation: &RideStatusSnapshot,
    park: ParkState,
    park_type: ParkType,
) -> Classification {
    if !park.appears_open {
        return Classification::Excluded;
    }

    if observation.computed_open() {
        return Classification::CountsAsUp;
    }

    match (park_type, observation.status) {
        (_, Some(RideStatus::Refurbishment)) => Classification::Excluded,
        (ParkType::DownAware, Some(RideStatus::Down)) => Classification::CountsAsDown,
        // Closed, missing, or OPERATING with no wait and no open flag.
        (ParkType::DownAware, _) => Classification::Excluded,
        (ParkType::GenericClosed, _) => Classification::CountsAsDown,
    }
}

/// Rule 2: a ride operated in a period when at least one of its
/// classifications in that period counts as up.
pub fn has_operated<I>(classifications: I) -> bool
where
    I: IntoIterator<Item = Classification>,
{
    classifications
        .into_iter()
        .any(|c| c == Classification::CountsAsUp)
}

/// The rule set as an injectable seam for the aggregation engine.
pub trait DowntimeRules: Send + Sync {
    fn classify(
        &self,
        observation: &RideStatusSnapshot,
        park: ParkState,
        park_type: ParkType,
    ) -> Classification;

    fn has_operated(&self, classifications: &[Classification]) -> bool;
}

/// The production rule set, backed by [`classify`] and [`has_operated`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRules;

impl DowntimeRules for StandardRules {
    fn classify(
        &self,
        observation: &RideStatusSnapshot,
        park: ParkState,
        park_type: ParkType,
    ) -> Classification {
        classify(observation, park, park_type)
    }

    fn has_operated(&self, classifications: &[Classification]) -> bool {
        has_operated(classifications.iter().copied())
    }
}

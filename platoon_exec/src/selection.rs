//! # Platoon selection
//!
//! Chooses which of the known platoons (local or federated) a candidate vehicle should join.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{ControllerId, PlatoonSummary, ProducerId, Vec3};
use log::debug;
use serde::Deserialize;

use crate::platoon::unit_or_zero;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Identifies the selected platoon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatoonIndex {
    pub producer_id: ProducerId,
    pub controller_id: ControllerId,
}

/// Parameters of [`NearestTailSelection`].
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SelectionParams {
    /// Candidates whose last member is further away than this are not considered
    pub max_distance_m: f64,

    /// Minimum cosine between the vehicle's and the platoon's directions
    pub min_direction_cos: f64,

    /// Platoons with this many joins already waiting are not considered
    pub max_queued_joins: usize,

    /// Distance added to the score of platoons owned by other coordinators
    pub remote_penalty_m: f64,
}

/// Selects the platoon whose last member is nearest to the vehicle, among those travelling in
/// the same direction.
#[derive(Debug, Clone)]
pub struct NearestTailSelection {
    params: SelectionParams,
}

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

pub trait PlatoonSelection {
    /// Find the best platoon for a vehicle at `position` travelling along `direction`.
    ///
    /// `local_producer` is the coordinator running the selection. `None` means that no platoon
    /// fits and a new local one should be created.
    fn find_best_platoon(
        &self,
        local_producer: ProducerId,
        position: &Vec3,
        direction: &Vec3,
        catalog: &[PlatoonSummary],
    ) -> Option<PlatoonIndex>;
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            max_distance_m: 300.0,
            min_direction_cos: 0.9,
            max_queued_joins: 4,
            remote_penalty_m: 50.0,
        }
    }
}

impl NearestTailSelection {
    pub fn new(params: SelectionParams) -> Self {
        Self { params }
    }

    /// Score of a candidate, lower is better. `None` if the candidate is not eligible.
    fn score(
        &self,
        local_producer: ProducerId,
        position: &Vec3,
        direction: &Vec3,
        candidate: &PlatoonSummary,
    ) -> Option<f64> {
        let cos = unit_or_zero(direction).dot(&unit_or_zero(&candidate.direction));
        if cos < self.params.min_direction_cos {
            return None;
        }

        if candidate.queued_joins >= self.params.max_queued_joins {
            return None;
        }

        // A platoon with no known tail (still being instantiated, or empty) is scored as if its
        // tail were at the limit
        let distance_m = match candidate.tail_position {
            Some(tail) => (tail - position).norm(),
            None => self.params.max_distance_m,
        };
        if distance_m > self.params.max_distance_m {
            return None;
        }

        if candidate.producer_id == local_producer {
            Some(distance_m)
        }
        else {
            Some(distance_m + self.params.remote_penalty_m)
        }
    }
}

impl PlatoonSelection for NearestTailSelection {
    fn find_best_platoon(
        &self,
        local_producer: ProducerId,
        position: &Vec3,
        direction: &Vec3,
        catalog: &[PlatoonSummary],
    ) -> Option<PlatoonIndex> {
        let mut best: Option<(f64, &PlatoonSummary)> = None;

        for candidate in catalog {
            let score = match self.score(local_producer, position, direction, candidate) {
                Some(s) => s,
                None => continue,
            };

            best = match best {
                Some((s, b))
                    if s < score || (s == score && b.controller_id < candidate.controller_id) =>
                {
                    Some((s, b))
                }
                _ => Some((score, candidate)),
            };
        }

        match best {
            Some((score, b)) => {
                debug!(
                    "Selected platoon {} of producer {} (score {:.1})",
                    b.controller_id, b.producer_id, score
                );
                Some(PlatoonIndex {
                    producer_id: b.producer_id,
                    controller_id: b.controller_id,
                })
            }
            None => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

//! Safety-envelope law
//!
//! The member acceleration is the largest demand for which, assuming the preceding vehicle brakes
//! as hard as allowed while the member accelerates as hard as allowed, the gap over the next two
//! control steps never drops below the critical distance and the member can still stop in time.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::ControlLawKind;
use log::trace;
use util::maths::saturate;

use super::{ControlLaw, ControlLawParams, MemberInput};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Safe {
    params: ControlLawParams,

    /// Prediction horizon, equal to the control period
    period_s: f64,
}

/// The three candidate accelerations of the envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidates {
    /// Keeps the gap after two steps above the critical distance
    pub a1: f64,

    /// Keeps the safety criterion after two steps non-negative
    pub a2: f64,

    /// Keeps the lower bound of the safety criterion after one step non-negative
    pub a3: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Safe {
    pub fn new(params: ControlLawParams, period_s: f64) -> Self {
        Self { params, period_s }
    }

    /// Compute the candidate accelerations for a follower at `distance_m` behind a leading
    /// vehicle.
    pub fn candidates(&self, distance_m: f64, leading_speed_ms: f64, speed_ms: f64) -> Candidates {
        let t = self.period_s;
        let t2 = t * t;
        let a_min = self.params.min_accel_mss;
        let a_max = self.params.max_accel_mss;
        let d_crit = self.params.critical_distance_m;

        // Worst case gap and speeds after one step
        let lb_distance =
            distance_m + (leading_speed_ms - speed_ms) * t + (a_min - a_max) * t2 / 2.0;
        let lb_leading_speed = leading_speed_ms + a_min * t;
        let ub_speed = speed_ms + a_max * t;

        let lb_safety = lb_distance - d_crit
            + (ub_speed.powi(2) - lb_leading_speed.powi(2)) / (2.0 * a_min);

        let lb_next_safety = (lb_safety
            - (a_max - a_min) * (ub_speed + a_max * t / 2.0) * t / -a_min)
            .max(0.0)
            + (a_max - a_min) * t2;

        let a1 = a_min
            + 2.0 * (lb_distance - d_crit + (lb_leading_speed - ub_speed) * t) / (2.0 * t);

        let a2 = (((ub_speed - a_min * t / 2.0).powi(2) - 2.0 * a_min * lb_safety).sqrt()
            - (ub_speed - 1.5 * a_min * t))
            / t;

        let a3 = ((ub_speed + (a_max - a_min / 2.0) * t).powi(2) - 2.0 * a_min * lb_next_safety)
            .sqrt()
            / t
            - (ub_speed + (a_max - 1.5 * a_min) * t) / t;

        Candidates { a1, a2, a3 }
    }
}

impl Candidates {
    /// The smallest finite candidate, `None` if no candidate is finite.
    pub fn min_finite(&self) -> Option<f64> {
        [self.a1, self.a2, self.a3]
            .iter()
            .copied()
            .filter(|a| a.is_finite())
            .fold(None, |acc: Option<f64>, a| match acc {
                Some(m) if m <= a => Some(m),
                _ => Some(a),
            })
    }
}

impl ControlLaw for Safe {
    fn kind(&self) -> ControlLawKind {
        ControlLawKind::Safe
    }

    fn params(&self) -> &ControlLawParams {
        &self.params
    }

    fn member_acceleration(&self, input: &MemberInput) -> f64 {
        let c = self.candidates(
            input.distance_to_preceding_m,
            input.preceding_speed_ms,
            input.speed_ms,
        );
        trace!("Safe envelope candidates: {:?}", c);

        // With no admissible candidate brake as hard as allowed
        let accel = c.min_finite().unwrap_or(self.params.min_accel_mss);

        saturate(accel, self.params.min_accel_mss, self.params.max_accel_mss)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

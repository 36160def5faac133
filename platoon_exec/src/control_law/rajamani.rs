//! Linear leader/predecessor feedback law

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::ControlLawKind;
use util::maths::saturate;

use super::{ControlLaw, ControlLawParams, MemberInput};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Feedback law of Rajamani et al., combining the preceding vehicle's and the leader's
/// acceleration with relative speed and spacing error terms.
#[derive(Debug, Clone)]
pub struct Rajamani {
    params: ControlLawParams,

    /// Gains on preceding accel, leader accel, relative speed to preceding, relative speed to
    /// leader and spacing error respectively.
    k: [f64; 5],
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Rajamani {
    pub fn new(params: ControlLawParams) -> Self {
        let c1 = params.c1;
        let xi = params.xi;
        let omega = params.omega;

        // Critically damped or overdamped only, clamp the root to zero otherwise
        let root = (xi * xi - 1.0).max(0.0).sqrt();

        let k = [
            1.0 - c1,
            c1,
            -(2.0 * xi - c1 * (xi + root)) * omega,
            -(xi + root) * omega * c1,
            -(omega * omega),
        ];

        Self { params, k }
    }

    pub fn gains(&self) -> &[f64; 5] {
        &self.k
    }
}

impl ControlLaw for Rajamani {
    fn kind(&self) -> ControlLawKind {
        ControlLawKind::Rajamani
    }

    fn params(&self) -> &ControlLawParams {
        &self.params
    }

    fn member_acceleration(&self, input: &MemberInput) -> f64 {
        let spacing_error_m = self.params.target_spacing_m - input.distance_to_preceding_m;

        let accel = self.k[0] * input.preceding_accel_mss
            + self.k[1] * input.leader_accel_mss
            + self.k[2] * (input.speed_ms - input.preceding_speed_ms)
            + self.k[3] * (input.speed_ms - input.leader_speed_ms)
            + self.k[4] * spacing_error_m;

        saturate(accel, self.params.min_accel_mss, self.params.max_accel_mss)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

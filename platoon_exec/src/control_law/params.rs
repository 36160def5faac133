//! Control law parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters shared by all control laws.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControlLawParams {
    /// Cruise speed the leader is driven towards
    pub target_speed_ms: f64,

    /// Acceleration demand minimum limit
    pub min_accel_mss: f64,

    /// Acceleration demand maximum limit
    pub max_accel_mss: f64,

    /// Proportional gain of the leader speed controller
    pub leader_gain: f64,

    /// Desired gap between a member and the vehicle ahead of it
    pub target_spacing_m: f64,

    /// A joining vehicle has closed the gap once it is within `target_spacing_m` plus this
    /// tolerance of the last member.
    pub join_tolerance_m: f64,

    /// Weighting of the leader against the preceding vehicle (Rajamani `C1`)
    pub c1: f64,

    /// Damping ratio (Rajamani `xi`)
    pub xi: f64,

    /// Bandwidth of the controller (Rajamani `omega_n`)
    pub omega: f64,

    /// Minimum distance the safety envelope must keep to the preceding vehicle
    pub critical_distance_m: f64,

    /// Lateral acceleration added to a vehicle changing lane to leave
    pub lateral_accel_mss: f64,

    /// Lateral displacement from the leader at which the lane change is complete
    pub lane_change_threshold_m: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for ControlLawParams {
    fn default() -> Self {
        Self {
            target_speed_ms: 25.0,
            min_accel_mss: -5.0,
            max_accel_mss: 5.0,
            leader_gain: 0.2,
            target_spacing_m: 10.0,
            join_tolerance_m: 1.0,
            c1: 0.5,
            xi: 1.0,
            omega: 1.0,
            critical_distance_m: 0.5,
            lateral_accel_mss: 0.3,
            lane_change_threshold_m: 3.0,
        }
    }
}

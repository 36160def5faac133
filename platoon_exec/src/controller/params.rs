//! Platoon controller parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{msg::ControllerConfig, ControlLawKind, ControllerId, Endpoint, ProducerId, Vec3};
use serde::Deserialize;

use crate::control_law::ControlLawParams;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for platoon controllers.
///
/// The periods, laws and flags are the defaults a coordinator sends in its `ConfigureController`
/// message. A controller uses them until it is configured.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerParams {
    /// A vehicle asking to join while a manoeuvre is in progress is rejected if it is further
    /// than this from the last member of the platoon.
    pub admission_threshold_m: f64,

    pub heartbeat_period_s: f64,

    pub longitudinal_control_period_s: f64,
    pub longitudinal_update_period_s: f64,

    pub lateral_control_period_s: f64,
    pub lateral_update_period_s: f64,

    /// Delay of the first control tick of a phase after its first position update
    pub control_offset_s: f64,

    pub longitudinal_law: ControlLawKind,
    pub lateral_law: ControlLawKind,

    /// Extrapolate member positions to the control time before running the control law
    pub adjust_positions: bool,

    /// Request all positions from a producer in one request
    pub send_bulk: bool,

    /// Gains and limits of the control laws
    pub law: ControlLawParams,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ControllerParams {
    /// Build the configuration message for a new controller from these parameters.
    pub fn to_config(
        &self,
        controller_id: ControllerId,
        producer_id: ProducerId,
        producer_endpoint: Endpoint,
        direction: Vec3,
    ) -> ControllerConfig {
        ControllerConfig {
            controller_id,
            producer_id,
            producer_endpoint,
            direction,
            heartbeat_period_s: self.heartbeat_period_s,
            longitudinal_control_period_s: self.longitudinal_control_period_s,
            longitudinal_update_period_s: self.longitudinal_update_period_s,
            lateral_control_period_s: self.lateral_control_period_s,
            lateral_update_period_s: self.lateral_update_period_s,
            control_offset_s: self.control_offset_s,
            longitudinal_law: self.longitudinal_law,
            lateral_law: self.lateral_law,
            adjust_positions: self.adjust_positions,
            send_bulk: self.send_bulk,
        }
    }
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            admission_threshold_m: 50.0,
            heartbeat_period_s: 1.0,
            longitudinal_control_period_s: 0.1,
            longitudinal_update_period_s: 0.1,
            lateral_control_period_s: 0.05,
            lateral_update_period_s: 0.05,
            control_offset_s: 0.01,
            longitudinal_law: ControlLawKind::Rajamani,
            lateral_law: ControlLawKind::Rajamani,
            adjust_positions: false,
            send_bulk: true,
            law: ControlLawParams::default(),
        }
    }
}

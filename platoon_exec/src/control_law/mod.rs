//! # Control laws
//!
//! A control law maps the kinematic state of a platoon onto per-vehicle acceleration demands.
//! Two laws are provided:
//!
//! - [`Rajamani`] - a linear feedback law on the leader and the preceding vehicle,
//! - [`Safe`] - a safety-envelope law which bounds the braking distance at the next control step.
//!
//! Laws only differ in how they compute the member acceleration, the platoon, join and leave
//! manoeuvre steps are shared through the provided methods of [`ControlLaw`].

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod params;
mod rajamani;
mod safe;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::fmt::Debug;

use comms_if::{ControlLawKind, Vec3, VehicleId};
use log::trace;
use util::maths::saturate;

use crate::platoon::{is_ahead, lateral_unit, unit_or_zero, Membership, VehicleState};

pub use params::ControlLawParams;
pub use rajamani::Rajamani;
pub use safe::Safe;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Inputs of the member acceleration computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberInput {
    pub speed_ms: f64,

    pub preceding_speed_ms: f64,

    /// Acceleration demanded of the preceding vehicle during the same control tick
    pub preceding_accel_mss: f64,

    pub leader_speed_ms: f64,

    /// Acceleration demanded of the leader during the same control tick
    pub leader_accel_mss: f64,

    pub distance_to_preceding_m: f64,
}

/// Acceleration demand for one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelCommand {
    pub vehicle_id: VehicleId,

    /// Longitudinal acceleration along the direction of travel
    pub acceleration_mss: f64,

    /// Full acceleration vector, including any lateral component
    pub acceleration: Vec3,

    pub preceding: Option<VehicleId>,
    pub distance_to_preceding_m: Option<f64>,

    /// Set when this command completes the vehicle's manoeuvre
    pub maneuver_ended: bool,
}

/// Output of one manoeuvre control tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ManeuverStep {
    /// Commands for the members and the manoeuvring vehicle
    pub commands: Vec<AccelCommand>,

    /// True if the manoeuvring vehicle has completed its manoeuvre
    pub completed: bool,
}

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

pub trait ControlLaw: Debug {
    fn kind(&self) -> ControlLawKind;

    fn params(&self) -> &ControlLawParams;

    /// Acceleration of the platoon leader, driving its speed towards the target speed.
    fn leader_acceleration(&self, speed_ms: f64) -> f64 {
        let p = self.params();
        saturate(
            (p.target_speed_ms - speed_ms) * p.leader_gain,
            p.min_accel_mss,
            p.max_accel_mss,
        )
    }

    /// Acceleration of a member following the vehicle ahead of it.
    fn member_acceleration(&self, input: &MemberInput) -> f64;

    /// Compute the commands for every member of the platoon, leader first.
    fn control_platoon(&self, platoon: &Membership, direction: &Vec3) -> Vec<AccelCommand> {
        let unit = unit_or_zero(direction);
        let mut commands: Vec<AccelCommand> = Vec::with_capacity(platoon.len());

        let leader = match platoon.leader() {
            Some(l) => l,
            None => return commands,
        };

        let mut preceding: Option<&VehicleState> = None;

        for vehicle in platoon.iter() {
            let cmd = match preceding {
                None => {
                    let accel = self.leader_acceleration(vehicle.speed_ms);
                    longitudinal_command(vehicle.vehicle_id, accel, &unit, None)
                }
                Some(prec) => {
                    let leader_accel = commands[0].acceleration_mss;
                    let prec_accel = commands[commands.len() - 1].acceleration_mss;
                    let input = member_input(vehicle, prec, prec_accel, leader, leader_accel);
                    let accel = self.member_acceleration(&input);

                    longitudinal_command(
                        vehicle.vehicle_id,
                        accel,
                        &unit,
                        Some((prec.vehicle_id, input.distance_to_preceding_m)),
                    )
                }
            };

            trace!(
                "Vehicle {} acceleration demand: {:.3} m/s^2",
                cmd.vehicle_id,
                cmd.acceleration_mss
            );
            commands.push(cmd);
            preceding = Some(vehicle);
        }

        commands
    }

    /// Control the platoon and a vehicle joining it.
    ///
    /// A joiner reaching an empty platoon, or one which is ahead of the leader, becomes the new
    /// leader straight away. Any other joiner follows the last member and completes once it has
    /// closed the gap to within the target spacing plus the join tolerance.
    fn join_step(
        &self,
        platoon: &Membership,
        direction: &Vec3,
        joiner: &VehicleState,
    ) -> ManeuverStep {
        let unit = unit_or_zero(direction);
        let mut commands = self.control_platoon(platoon, direction);

        let (leader, last) = match (platoon.leader(), platoon.last()) {
            (Some(leader), Some(last)) => (leader, last),
            _ => {
                let accel = self.leader_acceleration(joiner.speed_ms);
                let mut cmd = longitudinal_command(joiner.vehicle_id, accel, &unit, None);
                cmd.maneuver_ended = true;
                commands.push(cmd);
                return ManeuverStep {
                    commands,
                    completed: true,
                };
            }
        };

        let cmd = if is_ahead(&joiner.position, &leader.position, direction) {
            let accel = self.leader_acceleration(joiner.speed_ms);
            let mut cmd = longitudinal_command(joiner.vehicle_id, accel, &unit, None);
            cmd.maneuver_ended = true;
            cmd
        }
        else {
            let leader_accel = commands[0].acceleration_mss;
            let last_accel = commands[commands.len() - 1].acceleration_mss;
            let input = member_input(joiner, last, last_accel, leader, leader_accel);
            let accel = self.member_acceleration(&input);

            let mut cmd = longitudinal_command(
                joiner.vehicle_id,
                accel,
                &unit,
                Some((last.vehicle_id, input.distance_to_preceding_m)),
            );
            let p = self.params();
            cmd.maneuver_ended =
                input.distance_to_preceding_m <= p.target_spacing_m + p.join_tolerance_m;
            cmd
        };

        let completed = cmd.maneuver_ended;
        commands.push(cmd);

        ManeuverStep {
            commands,
            completed,
        }
    }

    /// Control the platoon while one of its members leaves.
    ///
    /// The leader leaves immediately. Any other member keeps its longitudinal command plus a
    /// lateral acceleration towards the adjacent lane, and completes once its lateral
    /// displacement from the leader's last known position exceeds the lane change threshold.
    fn leave_step(
        &self,
        platoon: &Membership,
        direction: &Vec3,
        leaver: VehicleId,
    ) -> ManeuverStep {
        let mut commands = self.control_platoon(platoon, direction);
        let p = self.params();

        let leader = match platoon.leader() {
            Some(l) => l,
            None => {
                return ManeuverStep {
                    commands,
                    completed: true,
                }
            }
        };

        let completed = match (
            platoon.get(leaver),
            commands.iter_mut().find(|c| c.vehicle_id == leaver),
        ) {
            (Some(_), Some(cmd)) if leader.vehicle_id == leaver => {
                cmd.maneuver_ended = true;
                true
            }
            (Some(state), Some(cmd)) => {
                let lateral = lateral_unit(direction);
                cmd.acceleration += lateral * p.lateral_accel_mss;

                let displacement_m = (state.position - leader.last_position).dot(&lateral);
                cmd.maneuver_ended = displacement_m > p.lane_change_threshold_m;
                cmd.maneuver_ended
            }
            // Not a member, nothing left to do
            _ => true,
        };

        ManeuverStep {
            commands,
            completed,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Build the control law of the given kind.
///
/// `control_period_s` is the period the law will be ticked at, which the safety envelope law
/// uses as its prediction horizon.
pub fn build_law(
    kind: ControlLawKind,
    params: &ControlLawParams,
    control_period_s: f64,
) -> Box<dyn ControlLaw> {
    match kind {
        ControlLawKind::Rajamani => Box::new(Rajamani::new(params.clone())),
        ControlLawKind::Safe => Box::new(Safe::new(params.clone(), control_period_s)),
    }
}

fn member_input(
    vehicle: &VehicleState,
    preceding: &VehicleState,
    preceding_accel_mss: f64,
    leader: &VehicleState,
    leader_accel_mss: f64,
) -> MemberInput {
    MemberInput {
        speed_ms: vehicle.speed_ms,
        preceding_speed_ms: preceding.speed_ms,
        preceding_accel_mss,
        leader_speed_ms: leader.speed_ms,
        leader_accel_mss,
        distance_to_preceding_m: vehicle.distance_to(preceding),
    }
}

fn longitudinal_command(
    vehicle_id: VehicleId,
    accel_mss: f64,
    unit: &Vec3,
    preceding: Option<(VehicleId, f64)>,
) -> AccelCommand {
    AccelCommand {
        vehicle_id,
        acceleration_mss: accel_mss,
        acceleration: unit * accel_mss,
        preceding: preceding.map(|p| p.0),
        distance_to_preceding_m: preceding.map(|p| p.1),
        maneuver_ended: false,
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::{AppRef, Endpoint};

    fn vehicle(id: VehicleId, x: f64, y: f64, speed_ms: f64) -> VehicleState {
        VehicleState::new(
            id,
            Endpoint::new("edge", 5000, AppRef::Consumer(id)),
            1,
            Vec3::new(x, y, 0.0),
            speed_ms,
            0.0,
        )
    }

    fn platoon(vehicles: Vec<VehicleState>) -> Membership {
        let mut m = Membership::new();
        for v in vehicles {
            m.insert(v, &x_dir());
        }
        m
    }

    fn x_dir() -> Vec3 {
        Vec3::new(1.0, 0.0, 0.0)
    }

    fn law() -> Box<dyn ControlLaw> {
        build_law(ControlLawKind::Rajamani, &ControlLawParams::default(), 0.1)
    }

    #[test]
    fn test_factory() {
        let p = ControlLawParams::default();
        assert_eq!(
            build_law(ControlLawKind::Rajamani, &p, 0.1).kind(),
            ControlLawKind::Rajamani
        );
        assert_eq!(build_law(ControlLawKind::Safe, &p, 0.1).kind(), ControlLawKind::Safe);
    }

    #[test]
    fn test_leader_acceleration() {
        let law = law();

        // (25 - 20) * 0.2
        assert!((law.leader_acceleration(20.0) - 1.0).abs() < 1e-12);

        // Saturated at both ends
        assert_eq!(law.leader_acceleration(-100.0), 5.0);
        assert_eq!(law.leader_acceleration(100.0), -5.0);
    }

    #[test]
    fn test_control_platoon() {
        let law = law();
        let m = platoon(vec![vehicle(1, 100.0, 0.0, 20.0), vehicle(2, 90.0, 0.0, 20.0)]);

        let cmds = law.control_platoon(&m, &x_dir());

        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].vehicle_id, 1);
        assert_eq!(cmds[0].preceding, None);
        assert_eq!(cmds[1].preceding, Some(1));
        assert_eq!(cmds[1].distance_to_preceding_m, Some(10.0));

        // Acceleration vector lies along the direction of travel
        assert_eq!(cmds[0].acceleration[1], 0.0);
        assert!((cmds[0].acceleration[0] - cmds[0].acceleration_mss).abs() < 1e-12);
    }

    #[test]
    fn test_join_empty_platoon() {
        let law = law();
        let step = law.join_step(&Membership::new(), &x_dir(), &vehicle(1, 0.0, 0.0, 20.0));

        assert!(step.completed);
        assert_eq!(step.commands.len(), 1);
        assert!(step.commands[0].maneuver_ended);
        assert_eq!(step.commands[0].preceding, None);
    }

    #[test]
    fn test_join_ahead_of_leader() {
        let law = law();
        let m = platoon(vec![vehicle(1, 100.0, 0.0, 20.0)]);

        let step = law.join_step(&m, &x_dir(), &vehicle(2, 150.0, 0.0, 20.0));

        assert!(step.completed);
        assert_eq!(step.commands.len(), 2);
    }

    #[test]
    fn test_join_trailing() {
        let law = law();
        let m = platoon(vec![vehicle(1, 100.0, 0.0, 20.0)]);

        // Far behind, keeps approaching
        let step = law.join_step(&m, &x_dir(), &vehicle(2, 50.0, 0.0, 20.0));
        assert!(!step.completed);
        assert_eq!(step.commands[1].preceding, Some(1));
        assert_eq!(step.commands[1].distance_to_preceding_m, Some(50.0));

        // Within spacing plus tolerance
        let step = law.join_step(&m, &x_dir(), &vehicle(2, 89.5, 0.0, 20.0));
        assert!(step.completed);
        assert!(step.commands[1].maneuver_ended);
    }

    #[test]
    fn test_leave_leader() {
        let law = law();
        let m = platoon(vec![vehicle(1, 100.0, 0.0, 20.0), vehicle(2, 90.0, 0.0, 20.0)]);

        let step = law.leave_step(&m, &x_dir(), 1);
        assert!(step.completed);
        assert!(step.commands[0].maneuver_ended);
        assert!(!step.commands[1].maneuver_ended);
    }

    #[test]
    fn test_leave_member_changes_lane() {
        let law = law();
        let mut m = platoon(vec![vehicle(1, 100.0, 0.0, 20.0), vehicle(2, 90.0, 0.0, 20.0)]);

        let step = law.leave_step(&m, &x_dir(), 2);
        assert!(!step.completed);
        assert!((step.commands[1].acceleration[1] - 0.3).abs() < 1e-12);

        // Move over by more than the threshold
        if let Some(v) = m.get_mut(2) {
            v.position[1] = 3.5;
        }
        let step = law.leave_step(&m, &x_dir(), 2);
        assert!(step.completed);
        assert!(step.commands[1].maneuver_ended);
    }
}

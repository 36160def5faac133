//! # Platoon data model
//!
//! [`VehicleState`] is the kinematic state tracked for every vehicle a controller looks after,
//! and [`Membership`] the ordered set of members of one platoon.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{cmp::Ordering, collections::HashMap};

use comms_if::{Endpoint, PositionSample, ProducerId, Vec3, VehicleId};
use serde::Serialize;
use util::maths::sign;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Positional differences smaller than this are considered to be zero when checking the order of
/// the platoon.
const ORDER_DEAD_BAND_M: f64 = 1e-6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Kinematic state of a vehicle, plus the snapshot preceding the latest sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleState {
    pub vehicle_id: VehicleId,

    /// Endpoint of the consumer agent relaying for this vehicle
    pub consumer: Endpoint,

    /// Coordinator whose location service provides samples for this vehicle
    pub producer_id: ProducerId,

    pub position: Vec3,
    pub speed_ms: f64,

    /// Last longitudinal acceleration commanded to the vehicle
    pub acceleration_mss: f64,

    pub timestamp_s: f64,

    pub last_position: Vec3,
    pub last_speed_ms: f64,
    pub last_timestamp_s: f64,
}

/// Members of a platoon, ordered from leader to last vehicle along the direction of travel.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    order: Vec<VehicleId>,
    states: HashMap<VehicleId, VehicleState>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl VehicleState {
    pub fn new(
        vehicle_id: VehicleId,
        consumer: Endpoint,
        producer_id: ProducerId,
        position: Vec3,
        speed_ms: f64,
        timestamp_s: f64,
    ) -> Self {
        Self {
            vehicle_id,
            consumer,
            producer_id,
            position,
            speed_ms,
            acceleration_mss: 0.0,
            timestamp_s,
            last_position: position,
            last_speed_ms: speed_ms,
            last_timestamp_s: timestamp_s,
        }
    }

    /// Apply a new sample, moving the current values into the last known snapshot.
    pub fn update(&mut self, sample: &PositionSample) {
        self.last_position = self.position;
        self.last_speed_ms = self.speed_ms;
        self.last_timestamp_s = self.timestamp_s;

        self.position = sample.position;
        self.speed_ms = sample.speed_ms;
        self.timestamp_s = sample.timestamp_s;
    }

    /// Extrapolate the state to `now_s` along `direction` using the last commanded acceleration.
    ///
    /// States which are newer than `now_s` are left untouched.
    pub fn extrapolate(&mut self, direction: &Vec3, now_s: f64) {
        let dt = now_s - self.timestamp_s;
        if dt <= 0.0 {
            return;
        }

        let unit = unit_or_zero(direction);
        let travelled_m = self.speed_ms * dt + 0.5 * self.acceleration_mss * dt * dt;

        self.position += unit * travelled_m;
        self.speed_ms += self.acceleration_mss * dt;
        self.timestamp_s = now_s;
    }

    pub fn distance_to(&self, other: &VehicleState) -> f64 {
        (self.position - other.position).norm()
    }
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, vehicle_id: VehicleId) -> bool {
        self.states.contains_key(&vehicle_id)
    }

    pub fn get(&self, vehicle_id: VehicleId) -> Option<&VehicleState> {
        self.states.get(&vehicle_id)
    }

    pub fn get_mut(&mut self, vehicle_id: VehicleId) -> Option<&mut VehicleState> {
        self.states.get_mut(&vehicle_id)
    }

    /// Vehicle ids, leader first.
    pub fn order(&self) -> &[VehicleId] {
        &self.order
    }

    pub fn leader(&self) -> Option<&VehicleState> {
        self.order.first().and_then(|id| self.states.get(id))
    }

    pub fn last(&self) -> Option<&VehicleState> {
        self.order.last().and_then(|id| self.states.get(id))
    }

    /// The member immediately ahead of `vehicle_id`, `None` for the leader or a non-member.
    pub fn preceding(&self, vehicle_id: VehicleId) -> Option<&VehicleState> {
        let idx = self.order.iter().position(|id| *id == vehicle_id)?;
        if idx == 0 {
            return None;
        }
        self.states.get(&self.order[idx - 1])
    }

    /// Iterate over the members, leader first.
    pub fn iter(&self) -> impl Iterator<Item = &VehicleState> {
        let states = &self.states;
        self.order.iter().filter_map(move |id| states.get(id))
    }

    /// Iterate mutably over the members in no particular order.
    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut VehicleState> {
        self.states.values_mut()
    }

    /// Insert a vehicle at the position preserving the order along `direction`, returning its
    /// index (0 is the leader).
    ///
    /// Starting from the leader, the new vehicle is placed in front of the first member which is
    /// not ahead of it. A vehicle which is already a member is replaced.
    pub fn insert(&mut self, state: VehicleState, direction: &Vec3) -> usize {
        if self.contains(state.vehicle_id) {
            self.remove(state.vehicle_id);
        }

        let idx = self
            .iter()
            .position(|member| !is_ahead(&member.position, &state.position, direction))
            .unwrap_or(self.order.len());

        self.order.insert(idx, state.vehicle_id);
        self.states.insert(state.vehicle_id, state);

        idx
    }

    pub fn remove(&mut self, vehicle_id: VehicleId) -> Option<VehicleState> {
        let state = self.states.remove(&vehicle_id)?;
        self.order.retain(|id| *id != vehicle_id);
        Some(state)
    }

    /// Sort the members along `direction`, leader first. Returns `true` if the order changed.
    ///
    /// Members level with each other keep their relative order.
    pub fn reorder(&mut self, direction: &Vec3) -> bool {
        let states = &self.states;
        let progress = |id: &VehicleId| {
            states
                .get(id)
                .map(|s| s.position.dot(direction))
                .unwrap_or(f64::NEG_INFINITY)
        };

        let mut order = self.order.clone();
        order.sort_by(|a, b| progress(b).partial_cmp(&progress(a)).unwrap_or(Ordering::Equal));

        if order == self.order {
            false
        }
        else {
            self.order = order;
            true
        }
    }

    /// Check the order invariant: for every pair of adjacent members, on every axis along which
    /// the platoon travels, the sign of the positional difference (front minus back) matches the
    /// sign of the direction.
    pub fn is_ordered(&self, direction: &Vec3) -> bool {
        let members: Vec<&VehicleState> = self.iter().collect();

        members.windows(2).all(|pair| {
            let diff = pair[0].position - pair[1].position;

            (0..3).all(|axis| {
                let dir_sign = sign(direction[axis], ORDER_DEAD_BAND_M);
                let diff_sign = sign(diff[axis], ORDER_DEAD_BAND_M);

                dir_sign == 0 || diff_sign == 0 || diff_sign == dir_sign
            })
        })
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// True if `a` is strictly ahead of `b` along `direction`.
pub fn is_ahead(a: &Vec3, b: &Vec3, direction: &Vec3) -> bool {
    (a - b).dot(direction) > 0.0
}

/// Normalise a vector, mapping the zero vector onto itself.
pub fn unit_or_zero(v: &Vec3) -> Vec3 {
    let norm = v.norm();
    if norm > 0.0 {
        v / norm
    }
    else {
        Vec3::zeros()
    }
}

/// Unit vector perpendicular to `direction` in the road plane, pointing to its left.
pub fn lateral_unit(direction: &Vec3) -> Vec3 {
    unit_or_zero(&Vec3::new(-direction[1], direction[0], 0.0))
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::AppRef;
    use proptest::prelude::*;

    fn vehicle(id: VehicleId, x: f64, y: f64) -> VehicleState {
        VehicleState::new(
            id,
            Endpoint::new("edge", 5000, AppRef::Consumer(id)),
            1,
            Vec3::new(x, y, 0.0),
            20.0,
            0.0,
        )
    }

    #[test]
    fn test_insert_order() {
        let dir = Vec3::new(1.0, 0.0, 0.0);
        let mut m = Membership::new();

        assert_eq!(m.insert(vehicle(1, 100.0, 0.0), &dir), 0);
        // Behind the leader
        assert_eq!(m.insert(vehicle(2, 80.0, 0.0), &dir), 1);
        // Ahead of everyone, new leader
        assert_eq!(m.insert(vehicle(3, 120.0, 0.0), &dir), 0);
        // In the middle
        assert_eq!(m.insert(vehicle(4, 90.0, 0.5), &dir), 2);

        assert_eq!(m.order(), &[3, 1, 4, 2]);
        assert_eq!(m.leader().map(|v| v.vehicle_id), Some(3));
        assert_eq!(m.last().map(|v| v.vehicle_id), Some(2));
        assert_eq!(m.preceding(4).map(|v| v.vehicle_id), Some(1));
        assert!(m.preceding(3).is_none());
        assert!(m.is_ordered(&dir));
    }

    #[test]
    fn test_insert_negative_direction() {
        let dir = Vec3::new(0.0, -1.0, 0.0);
        let mut m = Membership::new();

        m.insert(vehicle(1, 0.0, 50.0), &dir);
        m.insert(vehicle(2, 0.0, 10.0), &dir);
        m.insert(vehicle(3, 0.0, 30.0), &dir);

        // Travelling towards -y so the lowest y leads
        assert_eq!(m.order(), &[2, 3, 1]);
        assert!(m.is_ordered(&dir));
    }

    #[test]
    fn test_remove_and_replace() {
        let dir = Vec3::new(1.0, 0.0, 0.0);
        let mut m = Membership::new();

        m.insert(vehicle(1, 10.0, 0.0), &dir);
        m.insert(vehicle(2, 0.0, 0.0), &dir);

        // Re-inserting moves the vehicle instead of duplicating it
        m.insert(vehicle(2, 20.0, 0.0), &dir);
        assert_eq!(m.order(), &[2, 1]);
        assert_eq!(m.len(), 2);

        assert!(m.remove(2).is_some());
        assert!(m.remove(2).is_none());
        assert_eq!(m.order(), &[1]);
    }

    #[test]
    fn test_unordered_detected() {
        let dir = Vec3::new(1.0, 0.0, 0.0);
        let mut m = Membership::new();
        m.insert(vehicle(1, 10.0, 0.0), &dir);
        m.insert(vehicle(2, 0.0, 0.0), &dir);

        // Member 2 overtakes member 1 without the order being updated
        if let Some(v) = m.get_mut(2) {
            v.position[0] = 15.0;
        }
        assert!(!m.is_ordered(&dir));
    }

    #[test]
    fn test_reorder() {
        let dir = Vec3::new(1.0, 0.0, 0.0);
        let mut m = Membership::new();
        m.insert(vehicle(1, 20.0, 0.0), &dir);
        m.insert(vehicle(2, 10.0, 0.0), &dir);
        m.insert(vehicle(3, 0.0, 0.0), &dir);

        assert!(!m.reorder(&dir));

        // Member 3 overtakes everyone, 1 and 2 end up level
        if let Some(v) = m.get_mut(3) {
            v.position[0] = 30.0;
        }
        if let Some(v) = m.get_mut(2) {
            v.position[0] = 20.0;
        }
        assert!(m.reorder(&dir));
        assert_eq!(m.order(), &[3, 1, 2]);
        assert!(m.is_ordered(&dir));
        assert_eq!(m.leader().map(|v| v.vehicle_id), Some(3));
    }

    #[test]
    fn test_update_and_extrapolate() {
        let dir = Vec3::new(2.0, 0.0, 0.0);
        let mut v = vehicle(1, 0.0, 0.0);

        v.update(&PositionSample {
            vehicle_id: 1,
            position: Vec3::new(10.0, 0.0, 0.0),
            speed_ms: 10.0,
            timestamp_s: 1.0,
        });
        assert_eq!(v.last_position, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(v.last_speed_ms, 20.0);
        assert_eq!(v.last_timestamp_s, 0.0);

        v.acceleration_mss = 2.0;
        v.extrapolate(&dir, 2.0);

        // x + v dt + a dt^2 / 2 with dt = 1
        assert!((v.position[0] - 21.0).abs() < 1e-9);
        assert!((v.speed_ms - 12.0).abs() < 1e-9);
        assert_eq!(v.timestamp_s, 2.0);

        // Never extrapolate backwards
        v.extrapolate(&dir, 1.5);
        assert_eq!(v.timestamp_s, 2.0);
    }

    #[test]
    fn test_lateral_unit() {
        let lat = lateral_unit(&Vec3::new(1.0, 0.0, 0.0));
        assert!((lat - Vec3::new(0.0, 1.0, 0.0)).norm() < 1e-12);
        assert_eq!(unit_or_zero(&Vec3::zeros()), Vec3::zeros());
    }

    proptest! {
        /// Whatever the insertion order, the membership stays consistent with the direction.
        #[test]
        fn prop_insert_keeps_order(
            axis in 0usize..2,
            negative in any::<bool>(),
            stations in prop::collection::hash_set(-500i32..500, 1..12),
            jitter in prop::collection::vec(-1.5f64..1.5, 12),
        ) {
            let mut dir = Vec3::zeros();
            dir[axis] = if negative { -1.0 } else { 1.0 };

            let mut m = Membership::new();
            for (i, s) in stations.iter().enumerate() {
                let mut pos = Vec3::zeros();
                pos[axis] = *s as f64 * 4.0;
                pos[1 - axis] = jitter[i];

                let mut v = vehicle(i as VehicleId, 0.0, 0.0);
                v.position = pos;
                m.insert(v, &dir);

                prop_assert!(m.is_ordered(&dir));
            }
            prop_assert_eq!(m.len(), stations.len());
        }
    }
}

//! Request records kept by a platoon controller

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    msg::{JoinRequest, LeaveRequest},
    Endpoint, ProducerId, Vec3, VehicleId,
};

use crate::platoon::VehicleState;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A join request, as held in the join queue.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinEntry {
    pub vehicle_id: VehicleId,
    pub producer_id: ProducerId,
    pub reply_to: Endpoint,

    /// Last known position of the vehicle
    pub position: Vec3,
    pub speed_ms: f64,
}

/// A leave request, as held in the leave queue.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveEntry {
    pub vehicle_id: VehicleId,
    pub reply_to: Endpoint,
}

/// What the controller knows about the consumer of a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub consumer: Endpoint,
    pub producer_id: ProducerId,
    pub status: ConsumerStatus,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    NotJoined,
    Joined,
    ManeuveringToJoin,
    ManeuveringToLeave,
    QueuedJoin,
    QueuedLeave,
}

/// The single vehicle a controller is currently manoeuvring.
#[derive(Debug, Clone)]
pub enum Maneuvering {
    /// A vehicle which is not yet a member, tracked outside the membership until it joins
    Joining {
        request: JoinEntry,
        state: VehicleState,
    },

    /// A member changing lane to leave
    Leaving { request: LeaveEntry },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl From<JoinRequest> for JoinEntry {
    fn from(req: JoinRequest) -> Self {
        Self {
            vehicle_id: req.vehicle_id,
            producer_id: req.producer_id,
            reply_to: req.reply_to,
            position: req.position,
            speed_ms: req.speed_ms,
        }
    }
}

impl From<LeaveRequest> for LeaveEntry {
    fn from(req: LeaveRequest) -> Self {
        Self {
            vehicle_id: req.vehicle_id,
            reply_to: req.reply_to,
        }
    }
}

impl Maneuvering {
    pub fn vehicle_id(&self) -> VehicleId {
        match self {
            Maneuvering::Joining { request, .. } => request.vehicle_id,
            Maneuvering::Leaving { request } => request.vehicle_id,
        }
    }
}
